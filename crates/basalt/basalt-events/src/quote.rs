use serde::{Deserialize, Serialize};

use crate::record::BarRow;

pub const DEFAULT_CURRENCY: &str = "USD";

/// Latest known value for one ticker, as served by `get_quote`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub volume: i64,
    pub currency: String,
    /// Publish time of the batch that produced this quote.
    pub ts_epoch_ms: u64,
    pub source: String,
    /// Date of the bar the price was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<String>,
}

impl Quote {
    pub fn from_row(row: &BarRow, source: &str, ts_epoch_ms: u64) -> Self {
        Self {
            price: row.close,
            volume: row.volume,
            currency: DEFAULT_CURRENCY.to_string(),
            ts_epoch_ms,
            source: source.to_string(),
            as_of: Some(row.date.clone()),
        }
    }

    /// A quote is stale once it is strictly older than `window_ms`.
    #[inline]
    pub fn is_stale(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.ts_epoch_ms) > window_ms
    }
}
