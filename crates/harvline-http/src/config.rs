//! `[source.http]` configuration

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result, bail};
use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

/// How the endpoint is walked, newest unit first.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Walk {
    /// `{page}` = start, start + step, ... up to `end` (inclusive)
    Pages {
        #[serde(default = "default_page_start")]
        start: u64,
        #[serde(default = "default_page_step")]
        step: u64,
        #[serde(default)]
        end: Option<u64>,
    },
    /// `{date}` = start, start - 1 day, ... down to `until` (inclusive).
    /// `start` defaults to today (UTC).
    Days {
        #[serde(default)]
        start: Option<NaiveDate>,
        #[serde(default)]
        until: Option<NaiveDate>,
        #[serde(default = "default_date_format")]
        format: String,
    },
}

fn default_page_start() -> u64 {
    1
}

fn default_page_step() -> u64 {
    1
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

impl Default for Walk {
    fn default() -> Self {
        Self::Pages {
            start: default_page_start(),
            step: default_page_step(),
            end: None,
        }
    }
}

impl Walk {
    fn placeholder(&self) -> &'static str {
        match self {
            Self::Pages { .. } => "{page}",
            Self::Days { .. } => "{date}",
        }
    }
}

/// One unit of an HTTP walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpUnit {
    Page(u64),
    Day(NaiveDate),
}

impl fmt::Display for HttpUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page(n) => write!(f, "page {n}"),
            Self::Day(d) => write!(f, "day {d}"),
        }
    }
}

/// Endpoint description for a JSON-over-HTTP source.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    /// URL template containing `{page}` or `{date}`
    pub url: String,
    #[serde(default)]
    pub walk: Walk,
    /// JSON pointer to the item array; empty means the body is the array
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default)]
    pub id_pointer: Option<String>,
    #[serde(default)]
    pub timestamp_pointer: Option<String>,
    /// Output field name → JSON pointer into the item
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub provenance: Option<String>,
    /// Header values may reference `${VAR}`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Anti-XSSI prefix to strip before parsing (Gerrit sends `)]}'`)
    #[serde(default)]
    pub strip_prefix: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl HttpSourceConfig {
    /// Check the template matches the walk and pointers are well-formed.
    pub fn validate(&self) -> Result<()> {
        let placeholder = self.walk.placeholder();
        if !self.url.contains(placeholder) {
            bail!("url {:?} has no {placeholder} placeholder", self.url);
        }
        match &self.walk {
            Walk::Pages { step: 0, .. } => bail!("walk step must be at least 1"),
            Walk::Days { format, .. } if StrftimeItems::new(format).any(|i| i == Item::Error) => {
                bail!("invalid date format {format:?}")
            }
            _ => {}
        }
        let pointers = std::iter::once(self.items_pointer.as_str())
            .chain(self.id_pointer.as_deref())
            .chain(self.timestamp_pointer.as_deref())
            .chain(self.fields.values().map(String::as_str));
        for p in pointers {
            if !p.is_empty() && !p.starts_with('/') {
                bail!("JSON pointer {p:?} must start with '/'");
            }
        }
        Ok(())
    }

    /// Header list with `${VAR}` references expanded.
    pub fn resolved_headers(&self) -> Result<Vec<(String, String)>> {
        self.headers
            .iter()
            .map(|(name, value)| {
                let value = expand_env_vars(value)
                    .with_context(|| format!("Failed to expand header {name}"))?;
                Ok((name.clone(), value))
            })
            .collect()
    }

    /// Units in walk order.
    pub fn units(&self) -> Box<dyn Iterator<Item = HttpUnit> + '_> {
        match &self.walk {
            Walk::Pages { start, step, end } => {
                let (start, step, end) = (*start, *step, *end);
                Box::new(
                    (0u64..)
                        .map_while(move |i| i.checked_mul(step)?.checked_add(start))
                        .take_while(move |n| end.is_none_or(|e| *n <= e))
                        .map(HttpUnit::Page),
                )
            }
            Walk::Days { start, until, .. } => {
                let first = start.unwrap_or_else(|| Utc::now().date_naive());
                let until = *until;
                Box::new(
                    std::iter::successors(Some(first), |d| d.pred_opt())
                        .take_while(move |d| until.is_none_or(|u| *d >= u))
                        .map(HttpUnit::Day),
                )
            }
        }
    }

    pub fn render_url(&self, unit: &HttpUnit) -> String {
        match (unit, &self.walk) {
            (HttpUnit::Page(n), _) => self.url.replace("{page}", &n.to_string()),
            (HttpUnit::Day(d), Walk::Days { format, .. }) => {
                self.url.replace("{date}", &d.format(format).to_string())
            }
            (HttpUnit::Day(d), _) => self.url.replace("{date}", &d.to_string()),
        }
    }
}

/// Expand every `${VAR}` in `s`; unset variables are an error.
pub fn expand_env_vars(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find('}')
            .with_context(|| format!("unterminated ${{ in {s:?}"))?;
        let name = &after[..close];
        let value = std::env::var(name)
            .with_context(|| format!("environment variable {name} is not set"))?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
