//! Client error types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::ListenerId;

/// Transport-level failures of the stream connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The request could not be sent or the body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// The server answered with a non-2xx status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Nothing, not even a heartbeat, arrived within the inactivity window.
    #[error("no data received for {0:?}")]
    Inactivity(Duration),

    /// The stream ended in the middle of a record.
    #[error("stream ended with {buffered} bytes of an incomplete record")]
    MalformedTermination { buffered: usize },

    /// The stream produced data that could not be framed.
    #[error("framing error: {0}")]
    Framing(#[from] follow_proto::Error),

    /// The configured target is not a usable URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Every allowed reconnect attempt failed.
    #[error("giving up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl From<reqwest::Error> for ConnectionError {
    fn from(e: reqwest::Error) -> Self {
        ConnectionError::Request(e.to_string())
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Stream connection failure.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A record could not be normalized.
    #[error("protocol error: {0}")]
    Protocol(#[from] follow_proto::Error),

    /// An operation was called in a state that does not allow it.
    #[error("invalid use: {0}")]
    InvalidUse(String),

    /// The listener id is not (or no longer) registered.
    #[error("unknown listener: {0}")]
    UnknownListener(ListenerId),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP failure outside the feed (provisioning requests).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An error was emitted with no error listener registered.
    #[error("unhandled feed error: {0}")]
    Unhandled(Arc<Error>),

    /// A listener panicked and took the feed task down.
    #[error("feed task panicked: {0}")]
    Panicked(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
