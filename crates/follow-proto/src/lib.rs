//! Change feed protocol types.
//!
//! This crate defines the record-level view of a CouchDB-style continuous
//! change feed. It performs no I/O.
//!
//! # Modules
//!
//! - [`seq`] - Ordering tokens
//! - [`change`] - Typed change events
//! - [`framing`] - Newline framing of the byte stream
//! - [`normalize`] - Raw line to typed record conversion
//! - [`error`] - Protocol error types
//!
//! # Example
//!
//! ```
//! use follow_proto::{ChangeType, FeedRecord, LineFramer, Line, Normalizer};
//!
//! let mut framer = LineFramer::new();
//! framer.push(b"{\"db_name\":\"db\",\"type\":\"created\",\"seq\":\"1-a\"}\n").unwrap();
//!
//! let normalizer = Normalizer::default();
//! if let Some(Line::Record(line)) = framer.next_line() {
//!     match normalizer.normalize(&line).unwrap() {
//!         FeedRecord::Change(change) => assert_eq!(change.change_type, ChangeType::Created),
//!         FeedRecord::LastSeq(_) => unreachable!(),
//!     }
//! }
//! ```

pub mod change;
pub mod error;
pub mod framing;
pub mod normalize;
pub mod seq;

pub use change::{ChangeEvent, ChangeType, FeedRecord};
pub use error::Error;
pub use framing::{Line, LineFramer, MAX_LINE_SIZE};
pub use normalize::Normalizer;
pub use seq::Seq;
