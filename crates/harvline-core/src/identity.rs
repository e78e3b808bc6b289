//! Identity keys, exclusion set, and the dedup resolver.
//!
//! Two strategies produce keys:
//!
//! - **strong**: the record carries an external ID (`id:<source>:<id>`).
//! - **weak**: no ID, so a blake3 digest over the timestamp and a normalized
//!   prefix of selected content fields stands in (`wk:<source>:<hex>`).
//!
//! Weak keys can over-deduplicate (two distinct short messages with identical
//! text in the same second) and under-deduplicate (an edited message whose
//! prefix changed). They are counted and logged separately so an audit can
//! tell the two strategies apart.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use rustc_hash::FxHashSet;
use serde::Deserialize;

use crate::record::Record;

/// Default number of characters per content field fed into a weak key
pub const DEFAULT_CONTENT_PREFIX_CHARS: usize = 200;

/// Hex digits kept from the blake3 digest of a weak key (128 bits)
const WEAK_HEX_LEN: usize = 32;

const UNIT_SEP: &[u8] = b"\x1f";
const RECORD_SEP: &[u8] = b"\x1e";

/// Value used to decide whether a record was already collected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Strong(String),
    Weak(String),
}

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Strong(k) | Self::Weak(k) => k,
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, Self::Weak(_))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record for which no key can be derived: no ID, no timestamp, no content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityError {
    pub source: String,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: record has no id, timestamp, or content to derive an identity key from",
            self.source
        )
    }
}

impl std::error::Error for IdentityError {}

/// Per-source weak-identity settings.
///
/// `content_fields` selects which fields feed the weak key; empty means all
/// fields. `content_prefix_chars == 0` disables truncation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdentityStrategy {
    pub content_fields: Vec<String>,
    pub content_prefix_chars: usize,
}

impl Default for IdentityStrategy {
    fn default() -> Self {
        Self {
            content_fields: Vec::new(),
            content_prefix_chars: DEFAULT_CONTENT_PREFIX_CHARS,
        }
    }
}

impl IdentityStrategy {
    /// Whether `field` feeds weak keys.
    pub fn selects(&self, field: &str) -> bool {
        self.content_fields.is_empty() || self.content_fields.iter().any(|f| f == field)
    }

    /// Derive the identity key from identity-critical parts of a record.
    ///
    /// `fields` must yield `(name, value)` in ascending name order; both
    /// `Record::fields` and the ledger's borrowed view satisfy this, so a
    /// record re-read from disk hashes exactly like the one that was written.
    pub fn derive<'a>(
        &self,
        source: &str,
        id: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
        fields: impl Iterator<Item = (&'a str, Cow<'a, serde_json::Value>)>,
    ) -> Result<IdentityKey, IdentityError> {
        if let Some(id) = id.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(IdentityKey::Strong(format!("id:{source}:{id}")));
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(source.as_bytes());
        hasher.update(RECORD_SEP);
        let mut material = false;

        if let Some(ts) = timestamp {
            hasher.update(ts.to_rfc3339_opts(SecondsFormat::Secs, true).as_bytes());
            material = true;
        }
        hasher.update(RECORD_SEP);

        for (name, value) in fields {
            if !self.selects(name) {
                continue;
            }
            let Some(text) = normalize(&value, self.content_prefix_chars) else {
                continue;
            };
            hasher.update(name.as_bytes());
            hasher.update(UNIT_SEP);
            hasher.update(text.as_bytes());
            hasher.update(RECORD_SEP);
            material = true;
        }

        if !material {
            return Err(IdentityError {
                source: source.to_string(),
            });
        }
        let hex = hasher.finalize().to_hex();
        Ok(IdentityKey::Weak(format!(
            "wk:{source}:{}",
            &hex[..WEAK_HEX_LEN]
        )))
    }

    pub fn key_for(&self, record: &Record) -> Result<IdentityKey, IdentityError> {
        self.derive(
            &record.source,
            record.id.as_deref(),
            record.timestamp.as_ref(),
            record
                .fields
                .iter()
                .map(|(k, v)| (k.as_str(), Cow::Borrowed(v))),
        )
    }
}

/// Collapse whitespace and truncate; `None` for null or blank values.
fn normalize(value: &serde_json::Value, prefix_chars: usize) -> Option<String> {
    let raw: Cow<'_, str> = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => Cow::Borrowed(s),
        other => Cow::Owned(other.to_string()),
    };
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    if prefix_chars == 0 {
        return Some(collapsed);
    }
    Some(collapsed.chars().take(prefix_chars).collect())
}

/// Keys already known for this run: store, backups, artifacts, and everything
/// accepted so far. Only grows.
#[derive(Debug, Default)]
pub struct ExclusionSet {
    keys: FxHashSet<String>,
    weak: usize,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the key was not present before.
    pub fn insert(&mut self, key: &IdentityKey) -> bool {
        let fresh = self.keys.insert(key.as_str().to_string());
        if fresh && key.is_weak() {
            self.weak += 1;
        }
        fresh
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.keys.contains(key.as_str())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn weak_len(&self) -> usize {
        self.weak
    }

    pub fn strong_len(&self) -> usize {
        self.keys.len() - self.weak
    }
}

/// Outcome of checking one candidate record against the exclusion set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(IdentityKey),
    Duplicate(IdentityKey),
}

/// Dedup resolver for one source.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    strategy: IdentityStrategy,
}

impl Resolver {
    pub fn new(strategy: IdentityStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &IdentityStrategy {
        &self.strategy
    }

    /// Accept or reject a candidate.
    ///
    /// An accepted key is inserted into `set` before the caller persists the
    /// record, so overlapping pages cannot accept the same key twice.
    pub fn admit(
        &self,
        record: &Record,
        set: &mut ExclusionSet,
    ) -> Result<Verdict, IdentityError> {
        let key = self.strategy.key_for(record)?;
        if set.insert(&key) {
            Ok(Verdict::Accepted(key))
        } else {
            Ok(Verdict::Duplicate(key))
        }
    }
}
