//! Contract between the engine and a source-specific collector

use std::fmt;

use crate::error::ParseError;
use crate::record::Record;
use crate::retry::FailureClass;

/// A remote source: walk order, fetch, failure classification, parsing.
///
/// The engine calls `fetch` once per attempt (one outstanding call at a
/// time) and `parse` once per successful fetch. Neither may write to the
/// store; records flow back to the engine for dedup and persistence.
pub trait Adapter {
    /// One step of the walk: a page, a day, a monthly archive.
    type Unit: fmt::Display;
    /// Raw fetched content for a unit.
    type Payload;
    type Error: fmt::Display;

    /// Source tag stamped on every record.
    fn source(&self) -> &str;

    /// Work units in walk order, newest first for backward walks. May be
    /// unbounded; the engine stops on its own conditions.
    fn units(&self) -> Box<dyn Iterator<Item = Self::Unit> + '_>;

    fn fetch(&self, unit: &Self::Unit) -> Result<Self::Payload, Self::Error>;

    fn classify(&self, err: &Self::Error) -> FailureClass;

    /// Turn fetched content into zero or more candidate records.
    fn parse(&self, unit: &Self::Unit, payload: Self::Payload) -> Result<Vec<Record>, ParseError>;

    /// Whether a successfully parsed unit marks the end of the remote's
    /// history (an empty page past the last one). Checked after the unit's
    /// records are persisted.
    fn ends_walk(&self, _unit: &Self::Unit, _records: &[Record]) -> bool {
        false
    }
}
