pub mod fundamentals;
pub mod quote;
pub mod record;
pub mod snapshot;
pub mod time;

pub use fundamentals::Fundamentals;
pub use quote::Quote;
pub use record::{BarRow, RecordError, TickerRecord};
pub use snapshot::{SNAPSHOT_VERSION, SnapshotEntry, SnapshotEpoch, SnapshotHeader};
pub use time::now_ms;
