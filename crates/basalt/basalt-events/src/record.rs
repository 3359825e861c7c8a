// Validated bar records.
//
// The acquisition side hands over loosely-typed dictionaries (the
// `to_serializable_dict` shape). They are parsed into `TickerRecord` exactly
// once, at the boundary; a row with a missing or non-numeric field rejects the
// whole record instead of leaking a sentinel into the shared region.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

use crate::fundamentals::Fundamentals;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid record for {}", .ticker.as_deref().unwrap_or("<unknown>"))]
    Invalid {
        ticker: Option<String>,
        #[source]
        source: serde_json::Error,
    },

    #[error("record has an empty ticker")]
    EmptyTicker,

    #[error("unparseable bar date '{0}'")]
    BadDate(String),
}

/// One OHLCV bar. Field names on the wire follow the dataframe columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRow {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Open")]
    pub open: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "Close")]
    pub close: f64,
    #[serde(rename = "Volume", deserialize_with = "volume")]
    pub volume: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerRecord {
    pub ticker: String,
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub cur_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub period: String,
    /// Older producers name this `df`; `null` means no rows.
    #[serde(default, alias = "df", deserialize_with = "nullable_rows")]
    pub rows: Vec<BarRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fundamentals: Option<Fundamentals>,
}

impl TickerRecord {
    /// Validate a raw collaborator dictionary.
    pub fn from_value(value: serde_json::Value) -> Result<Self, RecordError> {
        let ticker = value
            .get("ticker")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        let record: TickerRecord =
            serde_json::from_value(value).map_err(|source| RecordError::Invalid { ticker, source })?;
        if record.ticker.trim().is_empty() {
            return Err(RecordError::EmptyTicker);
        }
        Ok(record)
    }

    pub fn last_row(&self) -> Option<&BarRow> {
        self.rows.last()
    }
}

impl BarRow {
    /// Bar timestamp in epoch milliseconds (UTC for naive dates).
    pub fn timestamp_ms(&self) -> Result<i64, RecordError> {
        parse_date_ms(&self.date).ok_or_else(|| RecordError::BadDate(self.date.clone()))
    }
}

/// Accepts `2024-01-01`, `2024-01-01 09:30:00`, offset-qualified variants of
/// the latter and RFC 3339.
pub fn parse_date_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

// Volumes arrive as integers or as floats from CSV round trips.
fn volume<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    use serde::de::Error;

    let n = serde_json::Number::deserialize(d)?;
    if let Some(v) = n.as_i64() {
        return Ok(v);
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Ok(f.trunc() as i64),
        _ => Err(D::Error::custom(format!("volume {n} out of range"))),
    }
}

fn nullable_rows<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<BarRow>, D::Error> {
    Ok(Option::<Vec<BarRow>>::deserialize(d)?.unwrap_or_default())
}
