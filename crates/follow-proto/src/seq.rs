//! Ordering tokens for change feeds.
//!
//! CouchDB 1.x uses plain integers as sequence values; CouchDB 2.x and
//! Cloudant use opaque strings of the form `"<n>-<base64>"`. Both carry a
//! leading integer (the ordinal) that orders tokens within one feed.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A position in a change feed.
///
/// Serializes back to exactly the JSON form it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    /// Integer sequence (CouchDB 1.x).
    Number(u64),
    /// Opaque sequence token (CouchDB 2.x, Cloudant).
    Token(String),
}

impl Seq {
    /// The sequence at the very beginning of a feed.
    pub const ZERO: Seq = Seq::Number(0);

    /// Build a sequence from a raw JSON value.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, Error> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(Seq::Number).ok_or_else(|| {
                Error::InvalidField {
                    field: "seq",
                    reason: format!("not an unsigned integer: {}", n),
                }
            }),
            serde_json::Value::String(s) if !s.is_empty() => Ok(Seq::Token(s.clone())),
            other => Err(Error::InvalidField {
                field: "seq",
                reason: format!("unsupported sequence value: {}", other),
            }),
        }
    }

    /// The leading integer of the token, if it has one.
    pub fn ordinal(&self) -> Option<u64> {
        match self {
            Seq::Number(n) => Some(*n),
            Seq::Token(s) => {
                let digits = s.split('-').next().unwrap_or_default();
                digits.parse().ok()
            }
        }
    }

    /// Compare two tokens by ordinal.
    ///
    /// Returns `None` when either side has no ordinal.
    pub fn compare(&self, other: &Seq) -> Option<Ordering> {
        Some(self.ordinal()?.cmp(&other.ordinal()?))
    }

    /// True if `self` is strictly behind `other`.
    pub fn is_behind(&self, other: &Seq) -> bool {
        self.compare(other) == Some(Ordering::Less)
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::ZERO
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Number(n) => write!(f, "{}", n),
            Seq::Token(s) => f.write_str(s),
        }
    }
}

impl FromStr for Seq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidField {
                field: "seq",
                reason: "empty sequence".to_string(),
            });
        }
        Ok(match s.parse::<u64>() {
            Ok(n) => Seq::Number(n),
            Err(_) => Seq::Token(s.to_string()),
        })
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq::Number(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ordinal() {
        assert_eq!(Seq::Number(42).ordinal(), Some(42));
        assert_eq!(Seq::Token("17-g1AAAAB".into()).ordinal(), Some(17));
        assert_eq!(Seq::Token("abc".into()).ordinal(), None);
    }

    #[test]
    fn test_compare() {
        let a = Seq::Token("3-xyz".into());
        let b = Seq::Number(5);
        assert!(a.is_behind(&b));
        assert!(!b.is_behind(&a));
        assert_eq!(a.compare(&Seq::Number(3)), Some(Ordering::Equal));
        assert_eq!(a.compare(&Seq::Token("opaque".into())), None);
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Seq::from_json(&json!(7)).unwrap(), Seq::Number(7));
        assert_eq!(
            Seq::from_json(&json!("7-abc")).unwrap(),
            Seq::Token("7-abc".into())
        );
        assert!(Seq::from_json(&json!(-1)).is_err());
        assert!(Seq::from_json(&json!("")).is_err());
        assert!(Seq::from_json(&json!([1, "x"])).is_err());
    }

    #[test]
    fn test_from_str_and_display() {
        let seq: Seq = "12".parse().unwrap();
        assert_eq!(seq, Seq::Number(12));
        let seq: Seq = "12-g1AAA".parse().unwrap();
        assert_eq!(seq.to_string(), "12-g1AAA");
        assert!("".parse::<Seq>().is_err());
    }

    #[test]
    fn test_serde_preserves_form() {
        let token = Seq::Token("9-g1AAAA".into());
        assert_eq!(serde_json::to_value(&token).unwrap(), json!("9-g1AAAA"));
        assert_eq!(serde_json::to_value(Seq::Number(9)).unwrap(), json!(9));

        let back: Seq = serde_json::from_value(json!("9-g1AAAA")).unwrap();
        assert_eq!(back, token);
    }
}
