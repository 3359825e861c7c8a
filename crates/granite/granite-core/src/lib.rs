pub mod collab;
pub mod columnar;
pub mod fundamentals;
pub mod listener;
pub mod market_state;
pub mod snapshot;

pub use collab::{
    DataManager, DownloadListener, FetchError, FundamentalsSource, IdleDataManager, NoMirror,
    RowMirror,
};
pub use columnar::ColumnarPublisher;
pub use fundamentals::FundamentalsCache;
pub use listener::PublishingListener;
pub use market_state::{BatchGuard, MarketState, SnapshotState};
pub use snapshot::{
    PublishOutcome, SnapshotError, SnapshotPublisher, SnapshotReader, SnapshotReaderConfig,
};
