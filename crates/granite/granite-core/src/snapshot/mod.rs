mod publisher;
mod reader;
mod region;

pub use publisher::{PublishOutcome, SnapshotPublisher, region_name_for};
pub use reader::{SnapshotReader, SnapshotReaderConfig};
pub use region::{
    BlobRead, FLAG_RETIRED, PREAMBLE_SIZE, SNAPSHOT_MAGIC, SnapshotRegion, SnapshotRegionReader,
};

use basalt_mmap::RegionError;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("region '{name}' is too small ({size} bytes)")]
    RegionTooSmall { name: String, size: usize },

    #[error("blob of {len} bytes exceeds region payload capacity {capacity}")]
    BlobTooLarge { len: usize, capacity: usize },

    #[error("region '{0}' exists but its preamble is not written yet")]
    NotReady(String),

    #[error("region '{name}' is not a snapshot region (magic {found:#x})")]
    BadMagic { name: String, found: u64 },

    #[error("failed to encode snapshot document")]
    Encode(#[source] serde_json::Error),

    #[error("shared memory not configured")]
    NotConfigured,

    #[error("unknown ticker '{0}'")]
    UnknownTicker(String),

    #[error("no consistent snapshot of '{ticker}' after {attempts} attempts")]
    Unstable { ticker: String, attempts: u32 },

    #[error("region '{0}' was retired; look up the current name")]
    Retired(String),
}
