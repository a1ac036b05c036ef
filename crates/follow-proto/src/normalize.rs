//! Normalization of raw feed lines into typed records.
//!
//! Two record shapes are understood:
//!
//! - `_db_updates`: `{"db_name": "x", "type": "created", "seq": "1-g1.."}`
//! - `_changes`: `{"seq": 5, "id": "doc", "changes": [{"rev": "1-abc"}], "deleted": true}`
//!
//! plus the `{"last_seq": ..}` marker and in-band `{"error": .., "reason": ..}`
//! records.

use serde_json::{Map, Value};

use crate::{ChangeEvent, ChangeType, Error, FeedRecord, Seq};

/// Converts raw lines into [`FeedRecord`]s.
///
/// `_changes` records do not name their database, so the normalizer carries
/// the database name of the feed it serves.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    db_name: Option<String>,
}

impl Normalizer {
    /// Create a normalizer. `db_name` is used for records without one.
    pub fn new(db_name: Option<String>) -> Self {
        Self { db_name }
    }

    /// Database name used for document-level records.
    pub fn db_name(&self) -> Option<&str> {
        self.db_name.as_deref()
    }

    /// Normalize one line.
    pub fn normalize(&self, line: &[u8]) -> Result<FeedRecord, Error> {
        let value: Value = serde_json::from_slice(line)?;
        let Value::Object(obj) = value else {
            return Err(Error::NotAnObject);
        };

        if let Some(error) = obj.get("error") {
            return Err(Error::Remote {
                error: text(error),
                reason: obj.get("reason").map(text).unwrap_or_default(),
            });
        }

        if let Some(last_seq) = obj.get("last_seq") {
            if !obj.contains_key("seq") {
                return Ok(FeedRecord::LastSeq(Seq::from_json(last_seq)?));
            }
        }

        let seq = Seq::from_json(obj.get("seq").ok_or(Error::MissingField("seq"))?)?;

        let event = match obj.get("type") {
            Some(discriminator) => self.db_update(&obj, seq, discriminator)?,
            None => self.document_change(&obj, seq)?,
        };

        Ok(FeedRecord::Change(ChangeEvent {
            payload: Value::Object(obj),
            ..event
        }))
    }

    fn db_update(
        &self,
        obj: &Map<String, Value>,
        seq: Seq,
        discriminator: &Value,
    ) -> Result<ChangeEvent, Error> {
        let discriminator = discriminator.as_str().ok_or_else(|| Error::InvalidField {
            field: "type",
            reason: "expected a string".to_string(),
        })?;
        let change_type = ChangeType::from_discriminator(discriminator)?;

        let db_name = match obj.get("db_name") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => {
                return Err(Error::InvalidField {
                    field: "db_name",
                    reason: "expected a string".to_string(),
                })
            }
            None => self.db_name.clone().ok_or(Error::MissingField("db_name"))?,
        };

        Ok(ChangeEvent {
            db_name,
            change_type,
            seq,
            id: None,
            payload: Value::Null,
        })
    }

    fn document_change(&self, obj: &Map<String, Value>, seq: Seq) -> Result<ChangeEvent, Error> {
        let db_name = self.db_name.clone().ok_or(Error::MissingField("db_name"))?;

        let id = match obj.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => {
                return Err(Error::InvalidField {
                    field: "id",
                    reason: "expected a string".to_string(),
                })
            }
            None => None,
        };

        let change_type = if obj.get("deleted").and_then(Value::as_bool) == Some(true) {
            ChangeType::Deleted
        } else {
            let first_rev = obj
                .get("changes")
                .and_then(Value::as_array)
                .and_then(|changes| changes.first())
                .and_then(|change| change.get("rev"))
                .and_then(Value::as_str);
            match first_rev {
                Some(rev) if rev.starts_with("1-") => ChangeType::Created,
                _ => ChangeType::Updated,
            }
        };

        Ok(ChangeEvent {
            db_name,
            change_type,
            seq,
            id,
            payload: Value::Null,
        })
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
