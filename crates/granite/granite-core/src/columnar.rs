//! Feeds validated records into the columnar ring region.

use std::sync::Arc;

use basalt_events::{Quote, TickerRecord, now_ms};
use basalt_icc::{ColumnarError, ColumnarWriter, TickerIndex};
use basalt_mmap::ShmNamespace;
use granite_config::ColumnarConfig;
use parking_lot::Mutex;

use crate::market_state::MarketState;

pub const QUOTE_SOURCE: &str = "columnar";

pub fn index_from_config(cfg: &ColumnarConfig) -> Result<TickerIndex, ColumnarError> {
    let index = TickerIndex::sequential(cfg.tickers.iter().map(|t| (t.ticker.clone(), t.capacity)))?;
    Ok(index)
}

pub struct ColumnarPublisher {
    writer: Mutex<ColumnarWriter>,
    state: Arc<MarketState>,
}

impl ColumnarPublisher {
    pub fn create(
        ns: &ShmNamespace,
        name: &str,
        index: TickerIndex,
        state: Arc<MarketState>,
    ) -> Result<Self, ColumnarError> {
        let writer = ColumnarWriter::create(ns, name, index)?;
        Ok(Self {
            writer: Mutex::new(writer),
            state,
        })
    }

    pub fn from_config(
        ns: &ShmNamespace,
        cfg: &ColumnarConfig,
        state: Arc<MarketState>,
    ) -> Result<Self, ColumnarError> {
        Self::create(ns, &cfg.region_name, index_from_config(cfg)?, state)
    }

    pub fn region_name(&self) -> String {
        self.writer.lock().name().to_string()
    }

    pub fn index(&self) -> TickerIndex {
        self.writer.lock().index().clone()
    }

    /// Append every row newer than the ticker's `last_ts`. Returns the number
    /// of rows appended. Tickers outside the index and rows with unparseable
    /// dates are skipped.
    pub fn publish(&self, records: &[TickerRecord]) -> Result<usize, ColumnarError> {
        let mut writer = self.writer.lock();
        let _batch = self.state.batch();
        self.append_records(&mut writer, records, now_ms())
    }

    fn append_records(
        &self,
        writer: &mut ColumnarWriter,
        records: &[TickerRecord],
        batch_ms: u64,
    ) -> Result<usize, ColumnarError> {
        let mut appended = 0;
        for record in records {
            let ticker = record.ticker.as_str();
            if writer.layout(ticker).is_none() {
                tracing::warn!(ticker, "ticker not in columnar index; skipped");
                continue;
            }
            let header = writer.header(ticker)?;
            // A never-written ring accepts any timestamp, including 0.
            let mut fresh = header.seqlock == 0;
            let mut last_ts = header.last_ts as i64;

            for row in &record.rows {
                let ts = match row.timestamp_ms() {
                    Ok(ts) => ts,
                    Err(e) => {
                        tracing::warn!(ticker, error = %e, "row skipped");
                        continue;
                    }
                };
                if !fresh && ts <= last_ts {
                    continue;
                }
                writer.append(
                    ticker,
                    ts,
                    row.open as f32,
                    row.high as f32,
                    row.low as f32,
                    row.close as f32,
                    row.volume,
                )?;
                fresh = false;
                last_ts = ts;
                appended += 1;
            }

            if let Some(row) = record.last_row() {
                self.state
                    .set_quote(ticker, Quote::from_row(row, QUOTE_SOURCE, batch_ms));
            }
        }
        Ok(appended)
    }
}
