//! Harvested record model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One harvested unit of communication (review comment, chat line, mail, post).
///
/// Adapters build these; the engine only looks at `source`, `id`, `timestamp`
/// and the content fields named by the identity strategy. `fields` is a
/// `BTreeMap` so a record always serializes to the same line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub provenance: String,
}

impl Record {
    pub fn new(source: impl Into<String>, provenance: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: None,
            fields: BTreeMap::new(),
            timestamp: None,
            provenance: provenance.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Serialize as a single store line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn line_has_no_optional_nulls() {
        let rec = Record::new("irc", "libera-logs").with_field("body", "hi");
        let line = String::from_utf8(rec.to_line().unwrap()).unwrap();
        assert!(!line.contains("\"id\""));
        assert!(!line.contains("\"timestamp\""));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn line_roundtrips() {
        let rec = Record::new("gerrit", "gerrit-api")
            .with_id("I123")
            .with_timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
            .with_field("author", "alice")
            .with_field("votes", 2);
        let line = rec.to_line().unwrap();
        let back: Record = serde_json::from_slice(&line).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn fields_serialize_in_key_order() {
        let a = Record::new("s", "p").with_field("z", 1).with_field("a", 2);
        let b = Record::new("s", "p").with_field("a", 2).with_field("z", 1);
        assert_eq!(a.to_line().unwrap(), b.to_line().unwrap());
    }
}
