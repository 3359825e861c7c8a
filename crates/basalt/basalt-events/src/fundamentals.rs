use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalised company fundamentals. Producing these (report fetch + XML
/// parsing) happens outside this workspace; values the report lacked are
/// `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    pub symbol: String,
    pub as_of: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub report_types_used: Vec<String>,
    #[serde(default)]
    pub company: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub statements: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub ratios: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub cap_table: BTreeMap<String, Option<f64>>,
}

impl Fundamentals {
    pub fn empty(symbol: &str, source: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            as_of: Utc::now(),
            source: source.to_string(),
            report_types_used: Vec::new(),
            company: BTreeMap::new(),
            statements: BTreeMap::new(),
            ratios: BTreeMap::new(),
            cap_table: BTreeMap::new(),
        }
    }
}
