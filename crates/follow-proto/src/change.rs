//! Typed change records.

use serde::{Deserialize, Serialize};

use crate::{Error, Seq};

/// Kind of change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// A database or document was created.
    Created,
    /// An existing database or document was modified.
    Updated,
    /// A database or document was deleted.
    Deleted,
}

impl ChangeType {
    /// Parse the `type` discriminator used by `_db_updates`.
    pub fn from_discriminator(s: &str) -> Result<Self, Error> {
        match s {
            "created" => Ok(ChangeType::Created),
            "updated" | "ddoc_updated" => Ok(ChangeType::Updated),
            "deleted" => Ok(ChangeType::Deleted),
            other => Err(Error::UnknownChangeType(other.to_string())),
        }
    }

    /// Name as written on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change notification from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Database the change belongs to.
    pub db_name: String,
    /// What happened.
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// Position of this change in the feed.
    pub seq: Seq,
    /// Document id, for document-level feeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The raw record as received.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ChangeEvent {
    /// Create a change without a document id or payload.
    pub fn new(db_name: impl Into<String>, change_type: ChangeType, seq: impl Into<Seq>) -> Self {
        Self {
            db_name: db_name.into(),
            change_type,
            seq: seq.into(),
            id: None,
            payload: serde_json::Value::Null,
        }
    }

    /// True if this change is for the named database.
    ///
    /// Cloudant prefixes database names with an account path, so a
    /// suffix match is used.
    pub fn is_for_database(&self, name: &str) -> bool {
        self.db_name == name || self.db_name.ends_with(&format!("/{}", name))
    }
}

/// A normalized record from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedRecord {
    /// A change notification.
    Change(ChangeEvent),
    /// The server reports it has sent everything up to this sequence.
    LastSeq(Seq),
}
