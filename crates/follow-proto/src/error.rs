//! Protocol error types.

use thiserror::Error;

/// Errors produced while framing or normalizing change records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The record is not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// The record is valid JSON but not an object.
    #[error("record is not a json object")]
    NotAnObject,

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The `type` discriminator is not one we know.
    #[error("unknown change type: {0}")]
    UnknownChangeType(String),

    /// A single line grew past the framing limit.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The server sent an error record inside the stream.
    #[error("remote error {error}: {reason}")]
    Remote { error: String, reason: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidJson(e.to_string())
    }
}
