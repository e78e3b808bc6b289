//! Harvline HTTP - JSON-over-HTTP source adapter
//!
//! Covers any endpoint that returns a JSON array of items per page or per
//! day: the URL template names the unit, JSON pointers pick out the ID,
//! timestamp and content fields.

pub mod adapter;
pub mod client;
pub mod config;

pub use adapter::JsonHttpAdapter;
pub use client::{FetchError, get_text};
pub use config::{HttpSourceConfig, HttpUnit, Walk, expand_env_vars};
