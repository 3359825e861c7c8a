//! Snapshot publisher: one JSON document per region, rewritten per batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use basalt_events::{Quote, SnapshotEntry, SnapshotHeader, TickerRecord, now_ms};
use basalt_mmap::ShmNamespace;
use granite_config::SnapshotConfig;
use parking_lot::Mutex;

use super::SnapshotError;
use super::region::{PREAMBLE_SIZE, SnapshotRegion};
use crate::collab::{NoMirror, RowMirror};
use crate::fundamentals::FundamentalsCache;
use crate::market_state::MarketState;

pub const QUOTE_SOURCE: &str = "snapshot";

/// Region name for generation `generation` of `base`.
pub fn region_name_for(base: &str, generation: u32) -> String {
    if generation == 0 {
        base.to_string()
    } else {
        format!("{base}-g{generation}")
    }
}

/// Result of one `write_data` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub tickers: usize,
    pub blob_bytes: usize,
    /// Region that holds the document after this batch.
    pub region: String,
    /// False when the region could not be grown; the previous blob stays.
    pub blob_written: bool,
}

struct Inner {
    ns: ShmNamespace,
    base_name: String,
    initial_size: usize,
    generation: u32,
    region: SnapshotRegion,
    entries: BTreeMap<String, SnapshotEntry>,
}

pub struct SnapshotPublisher {
    inner: Mutex<Inner>,
    state: Arc<MarketState>,
    mirror: Arc<dyn RowMirror>,
    fundamentals: Option<Arc<FundamentalsCache>>,
    pid: u32,
}

impl SnapshotPublisher {
    /// Create the first-generation region and advertise its name.
    pub fn create(
        ns: ShmNamespace,
        cfg: &SnapshotConfig,
        state: Arc<MarketState>,
    ) -> Result<Self, SnapshotError> {
        let initial_size = cfg.initial_size_bytes.max(PREAMBLE_SIZE + 1);
        let region = SnapshotRegion::create(&ns, &cfg.region_name, initial_size)?;
        state.set_shm_name(Some(region.name().to_string()));
        tracing::info!(region = %region.name(), size_bytes = initial_size, "snapshot region created");

        Ok(Self {
            inner: Mutex::new(Inner {
                ns,
                base_name: cfg.region_name.clone(),
                initial_size,
                generation: 0,
                region,
                entries: BTreeMap::new(),
            }),
            state,
            mirror: Arc::new(NoMirror),
            fundamentals: None,
            pid: std::process::id(),
        })
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn RowMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn with_fundamentals(mut self, cache: Arc<FundamentalsCache>) -> Self {
        self.fundamentals = Some(cache);
        self
    }

    pub fn state(&self) -> &Arc<MarketState> {
        &self.state
    }

    pub fn region_name(&self) -> String {
        self.inner.lock().region.name().to_string()
    }

    /// Current in-process entry for `ticker`.
    pub fn entry(&self, ticker: &str) -> Option<SnapshotEntry> {
        self.inner.lock().entries.get(ticker).cloned()
    }

    /// Validate raw collaborator dictionaries and publish the valid ones.
    /// Invalid records are logged and skipped.
    pub fn publish_raw(
        &self,
        values: Vec<serde_json::Value>,
    ) -> Result<PublishOutcome, SnapshotError> {
        let records: Vec<TickerRecord> = values
            .into_iter()
            .filter_map(|v| match TickerRecord::from_value(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping invalid record");
                    None
                }
            })
            .collect();
        self.write_data(records)
    }

    /// Publish one refresh batch. The only mutator of the document.
    pub fn write_data(&self, records: Vec<TickerRecord>) -> Result<PublishOutcome, SnapshotError> {
        let mut inner = self.inner.lock();
        let batch = self.state.batch();
        let batch_ms = now_ms();

        let count = records.len();
        for mut record in records {
            if let Some(f) = self.fundamentals.as_ref().and_then(|c| c.get(&record.ticker)) {
                record.fundamentals = Some((*f).clone());
            }

            let ticker = record.ticker.clone();
            let quote = record
                .last_row()
                .map(|row| Quote::from_row(row, QUOTE_SOURCE, batch_ms));
            if let Err(e) = self.mirror.mirror(&record) {
                tracing::warn!(ticker = %ticker, error = %e, "row mirror failed");
            }

            let pid = self.pid;
            let entry = inner
                .entries
                .entry(ticker.clone())
                .or_insert_with(|| SnapshotEntry {
                    header: SnapshotHeader::new(pid),
                    data: record.clone(),
                });
            entry.header.epoch += 1;
            entry.data = record;
            entry.header.last_update_ms = batch_ms;
            entry.header.epoch += 1;

            if let Some(q) = quote {
                self.state.set_quote(&ticker, q);
            }
        }

        drop(batch);

        let blob = serde_json::to_vec(&inner.entries).map_err(SnapshotError::Encode)?;
        let blob_written = self.store_blob(&mut inner, &blob);

        Ok(PublishOutcome {
            tickers: count,
            blob_bytes: blob.len(),
            region: inner.region.name().to_string(),
            blob_written,
        })
    }

    fn store_blob(&self, inner: &mut Inner, blob: &[u8]) -> bool {
        if blob.len() > inner.region.payload_capacity() {
            if let Err(e) = self.grow(inner, PREAMBLE_SIZE + blob.len()) {
                tracing::error!(
                    region = %inner.region.name(),
                    needed = PREAMBLE_SIZE + blob.len(),
                    error = %e,
                    "snapshot region resize failed; keeping previous blob"
                );
                return false;
            }
        }
        match inner.region.write_blob(blob) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(region = %inner.region.name(), error = %e, "snapshot blob write failed");
                false
            }
        }
    }

    fn grow(&self, inner: &mut Inner, needed: usize) -> Result<(), SnapshotError> {
        let size = needed.next_power_of_two().max(inner.initial_size);
        let generation = inner.generation + 1;
        let name = region_name_for(&inner.base_name, generation);
        let fresh = SnapshotRegion::create(&inner.ns, &name, size)?;

        let mut old = std::mem::replace(&mut inner.region, fresh);
        inner.generation = generation;
        self.state.set_shm_name(Some(name.clone()));
        old.retire();
        let old_name = old.name().to_string();
        if let Err(e) = old.close() {
            tracing::warn!(region = %old_name, error = %e, "retired region not unlinked");
        }
        tracing::info!(from = %old_name, to = %name, size_bytes = size, "snapshot region grown");
        Ok(())
    }
}
