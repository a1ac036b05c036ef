//! Follow - async follower for CouchDB-style continuous change feeds.
//!
//! A feed connects to `/{db}/_changes?feed=continuous` or
//! `/_db_updates?feed=continuous`, normalizes every record into a
//! [`ChangeEvent`] and delivers it to listeners registered on a
//! [`FeedHandle`]. Lost connections are re-established with backoff,
//! resuming after the last processed sequence.
//!
//! # Quick Start
//!
//! ```no_run
//! use follow_client::{follow, FeedConfig, Since};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let feed = follow(FeedConfig::db_updates("http://localhost:5984").with_since(Since::Now))?;
//!
//!     let stopper = feed.clone();
//!     feed.on_change(move |change| {
//!         println!("{} {} {}", change.db_name, change.change_type, change.seq);
//!         if change.db_name == "done" {
//!             stopper.stop();
//!         }
//!     });
//!     feed.on_error(|err| eprintln!("feed error: {}", err));
//!
//!     feed.start()?;
//!     feed.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod feed;

pub use admin::DatabaseAdmin;
pub use backoff::RetryConfig;
pub use config::{ChangeFilter, FeedConfig, Since};
pub use connection::{ConnectionState, StreamConnection, StreamItem};
pub use dispatcher::{EventDispatcher, EventKind, FeedEvent, ListenerId};
pub use error::{ConnectionError, Error, Result};
pub use feed::{FeedHandle, FeedState};

pub use follow_proto::{ChangeEvent, ChangeType, Seq};

/// Re-export protocol types.
pub use follow_proto as proto;

/// Create an idle feed for a target URL or configuration.
///
/// Register listeners on the returned handle, then call
/// [`FeedHandle::start`].
pub fn follow(config: impl Into<FeedConfig>) -> Result<FeedHandle> {
    FeedHandle::new(config.into())
}
