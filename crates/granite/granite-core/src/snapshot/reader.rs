//! Consumer side of the snapshot region.

use std::collections::{BTreeMap, HashMap};

use basalt_events::{SnapshotEntry, TickerRecord};
use basalt_mmap::ShmNamespace;

use super::SnapshotError;
use super::region::{BlobRead, SnapshotRegionReader};

pub const DEFAULT_MAX_RETRIES: u32 = 6;

#[derive(Debug, Clone)]
pub struct SnapshotReaderConfig {
    pub ns: ShmNamespace,
    /// Advertised region to attach to (see `get_shm_name`).
    pub region_name: Option<String>,
    /// Static ticker -> record mapping served instead of a region.
    pub layout: Option<BTreeMap<String, TickerRecord>>,
    pub max_retries: u32,
}

impl Default for SnapshotReaderConfig {
    fn default() -> Self {
        Self {
            ns: ShmNamespace::default(),
            region_name: None,
            layout: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

pub struct SnapshotReader {
    region: Option<SnapshotRegionReader>,
    layout: Option<BTreeMap<String, TickerRecord>>,
    max_retries: u32,
}

type Document = HashMap<String, SnapshotEntry>;

impl SnapshotReader {
    pub fn new(cfg: SnapshotReaderConfig) -> Result<Self, SnapshotError> {
        let region = match &cfg.region_name {
            Some(name) => {
                let r = SnapshotRegionReader::open_with_retries(&cfg.ns, name, cfg.max_retries)?;
                tracing::info!(region = %name, "snapshot reader attached");
                Some(r)
            }
            None => {
                tracing::info!(layout = cfg.layout.is_some(), "snapshot reader without shared memory");
                None
            }
        };
        Ok(Self {
            region,
            layout: cfg.layout,
            max_retries: cfg.max_retries.max(1),
        })
    }

    fn load(region: &SnapshotRegionReader) -> Result<Option<(u64, Document)>, SnapshotError> {
        match region.read_blob() {
            BlobRead::Stable { seq, blob } => {
                if blob.is_empty() {
                    return Ok(Some((seq, Document::new())));
                }
                match serde_json::from_slice::<Document>(&blob) {
                    Ok(doc) => Ok(Some((seq, doc))),
                    Err(e) => {
                        tracing::debug!(error = %e, "undecodable snapshot blob");
                        Ok(None)
                    }
                }
            }
            BlobRead::Busy => Ok(None),
            BlobRead::Retired => Err(SnapshotError::Retired(region.name().to_string())),
        }
    }

    /// Tickers present in the layout or the current document.
    pub fn list_tickers(&self) -> Result<Vec<String>, SnapshotError> {
        if let Some(layout) = &self.layout {
            return Ok(layout.keys().cloned().collect());
        }
        let region = self.region.as_ref().ok_or(SnapshotError::NotConfigured)?;
        for _ in 0..self.max_retries {
            if let Some((_, doc)) = Self::load(region)? {
                let mut keys: Vec<String> = doc.into_keys().collect();
                keys.sort_unstable();
                return Ok(keys);
            }
        }
        Err(SnapshotError::Unstable {
            ticker: String::new(),
            attempts: self.max_retries,
        })
    }

    /// Consistent record for `ticker`.
    pub fn get_stock(&self, ticker: &str) -> Result<TickerRecord, SnapshotError> {
        if let Some(layout) = &self.layout {
            return layout
                .get(ticker)
                .cloned()
                .ok_or_else(|| SnapshotError::UnknownTicker(ticker.to_string()));
        }
        let region = self.region.as_ref().ok_or(SnapshotError::NotConfigured)?;

        for attempt in 0..self.max_retries {
            let Some((seq, mut doc)) = Self::load(region)? else {
                tracing::debug!(ticker, attempt, "snapshot busy; retrying");
                continue;
            };
            let Some(entry) = doc.remove(ticker) else {
                return Err(SnapshotError::UnknownTicker(ticker.to_string()));
            };
            if !entry.header.is_stable() {
                tracing::debug!(ticker, attempt, epoch = entry.header.epoch, "odd entry epoch");
                continue;
            }
            if region.seq() == seq {
                return Ok(entry.data);
            }
            tracing::debug!(ticker, attempt, "snapshot replaced during read");
        }

        Err(SnapshotError::Unstable {
            ticker: ticker.to_string(),
            attempts: self.max_retries,
        })
    }

    pub fn close(self) {
        if let Some(r) = self.region {
            r.close();
        }
    }
}
