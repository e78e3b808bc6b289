//! Generic JSON-over-HTTP [`Adapter`]

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use harvline_core::{Adapter, FailureClass, ParseError, Record};
use serde_json::Value;

use crate::client::{FetchError, get_text};
use crate::config::{HttpSourceConfig, HttpUnit};

/// Walks a paged or dated JSON endpoint and maps each item to a [`Record`]
/// via JSON pointers.
#[derive(Debug)]
pub struct JsonHttpAdapter {
    source: String,
    provenance: String,
    config: HttpSourceConfig,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl JsonHttpAdapter {
    pub fn new(source: impl Into<String>, config: HttpSourceConfig) -> Result<Self> {
        let source = source.into();
        config
            .validate()
            .with_context(|| format!("Invalid [source.http] for {source}"))?;
        let headers = config.resolved_headers()?;
        let provenance = config
            .provenance
            .clone()
            .unwrap_or_else(|| format!("{source}-http"));
        Ok(Self {
            timeout: Duration::from_secs(config.timeout_secs),
            source,
            provenance,
            config,
            headers,
        })
    }

    fn item_to_record(&self, item: &Value) -> Record {
        let mut record = Record::new(self.source.as_str(), self.provenance.as_str());
        if let Some(id) = self
            .config
            .id_pointer
            .as_deref()
            .and_then(|p| item.pointer(p))
            .and_then(scalar_to_string)
        {
            record = record.with_id(id);
        }
        if let Some(raw) = self
            .config
            .timestamp_pointer
            .as_deref()
            .and_then(|p| item.pointer(p))
        {
            match parse_timestamp(raw) {
                Some(ts) => record = record.with_timestamp(ts),
                None => log::debug!("{}: unrecognised timestamp {raw}", self.source),
            }
        }
        for (name, pointer) in &self.config.fields {
            if let Some(v) = item.pointer(pointer) {
                record = record.with_field(name.as_str(), v.clone());
            }
        }
        record
    }
}

impl Adapter for JsonHttpAdapter {
    type Unit = HttpUnit;
    type Payload = String;
    type Error = FetchError;

    fn source(&self) -> &str {
        &self.source
    }

    fn units(&self) -> Box<dyn Iterator<Item = HttpUnit> + '_> {
        self.config.units()
    }

    fn fetch(&self, unit: &HttpUnit) -> Result<String, FetchError> {
        let url = self.config.render_url(unit);
        log::trace!("{}: GET {url}", self.source);
        get_text(&url, &self.headers, self.timeout)
    }

    fn classify(&self, err: &FetchError) -> FailureClass {
        err.classify()
    }

    fn parse(&self, unit: &HttpUnit, body: String) -> Result<Vec<Record>, ParseError> {
        let body = match &self.config.strip_prefix {
            Some(prefix) => body.strip_prefix(prefix.as_str()).unwrap_or(&body),
            None => &body,
        };
        let doc: Value = serde_json::from_str(body)?;
        let items = if self.config.items_pointer.is_empty() {
            Some(&doc)
        } else {
            doc.pointer(&self.config.items_pointer)
        };
        match items {
            Some(Value::Array(items)) => Ok(items.iter().map(|i| self.item_to_record(i)).collect()),
            // An empty day or past-the-end page
            Some(Value::Null) | None if !self.config.items_pointer.is_empty() => Ok(Vec::new()),
            _ => Err(ParseError::new(format!(
                "{unit}: {:?} is not an array",
                self.config.items_pointer
            ))),
        }
    }

    /// An empty page is past the last one. An empty day is just a quiet day.
    fn ends_walk(&self, unit: &HttpUnit, records: &[Record]) -> bool {
        matches!(unit, HttpUnit::Page(_)) && records.is_empty()
    }
}

/// IDs may be strings or numbers upstream; both render the same way.
fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339, `YYYY-mm-dd HH:MM:SS[.fff…]` as UTC (Gerrit), or epoch seconds.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            }),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}
