// MarketState: process-local state shared between publishers and the
// control-plane server.
//
//   quotes    ticker -> latest Quote, rewritten once per publish batch
//   epoch     region-wide epoch; odd while a batch is in flight
//   shm_name  the region name currently advertised to readers
//
// Publishers are the only writers. The server reads every field on each
// request, so the hot fields are atomics and the maps sit behind short
// parking_lot locks that are never held across I/O. Every publisher brackets
// its batch through `MarketState::batch`, which serialises batches across
// publishers so an odd epoch always means exactly one batch in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use basalt_events::{Quote, SnapshotEpoch, now_ms};
use parking_lot::{Mutex, MutexGuard, RwLock};

/// Odd/even epoch bracketing a whole publish batch.
#[derive(Debug, Default)]
pub struct SnapshotState {
    epoch: AtomicU64,
    last_update_ms: AtomicU64,
}

impl SnapshotState {
    /// Enter a batch: epoch becomes odd.
    pub fn begin(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Leave a batch: record `now_ms`, then epoch becomes even.
    pub fn end(&self, now_ms: u64) -> u64 {
        self.last_update_ms.store(now_ms, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn load(&self) -> SnapshotEpoch {
        SnapshotEpoch {
            epoch: self.epoch.load(Ordering::Acquire),
            last_update_ms: self.last_update_ms.load(Ordering::Relaxed),
        }
    }
}

/// Open publish batch. The epoch is odd for the guard's lifetime and goes
/// even, stamped with the drop time, when it is dropped.
pub struct BatchGuard<'a> {
    snapshot: &'a SnapshotState,
    epoch: u64,
    _serial: MutexGuard<'a, ()>,
}

impl BatchGuard<'_> {
    /// Odd epoch this batch runs under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.snapshot.end(now_ms());
    }
}

#[derive(Debug, Default)]
pub struct MarketState {
    quotes: RwLock<HashMap<String, Quote>>,
    snapshot: SnapshotState,
    batch: Mutex<()>,
    shm_name: RwLock<Option<String>>,
}

impl MarketState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quote(&self, ticker: &str) -> Option<Quote> {
        self.quotes.read().get(ticker).cloned()
    }

    pub fn set_quote(&self, ticker: &str, quote: Quote) {
        self.quotes.write().insert(ticker.to_string(), quote);
    }

    /// Known tickers, sorted.
    pub fn tickers(&self) -> Vec<String> {
        let mut out: Vec<String> = self.quotes.read().keys().cloned().collect();
        out.sort_unstable();
        out
    }

    pub fn snapshot(&self) -> &SnapshotState {
        &self.snapshot
    }

    /// Start a publish batch, waiting for any other publisher's batch to end.
    pub fn batch(&self) -> BatchGuard<'_> {
        let serial = self.batch.lock();
        let epoch = self.snapshot.begin();
        BatchGuard {
            snapshot: &self.snapshot,
            epoch,
            _serial: serial,
        }
    }

    pub fn snapshot_epoch(&self) -> SnapshotEpoch {
        self.snapshot.load()
    }

    pub fn shm_name(&self) -> Option<String> {
        self.shm_name.read().clone()
    }

    pub fn set_shm_name(&self, name: Option<String>) {
        *self.shm_name.write() = name;
    }
}
