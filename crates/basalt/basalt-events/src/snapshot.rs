use serde::{Deserialize, Serialize};

use crate::record::TickerRecord;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Per-ticker seqlock header inside the snapshot document.
/// Odd epoch: the entry is being rewritten. Even: stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
    pub epoch: u64,
    pub last_update_ms: u64,
    pub writer_pid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub header: SnapshotHeader,
    pub data: TickerRecord,
}

impl SnapshotHeader {
    pub fn new(writer_pid: u32) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            epoch: 0,
            last_update_ms: 0,
            writer_pid,
        }
    }

    #[inline]
    pub fn is_stable(&self) -> bool {
        self.epoch & 1 == 0
    }
}

/// Value of the region-wide epoch that brackets a publish batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEpoch {
    pub epoch: u64,
    pub last_update_ms: u64,
}
