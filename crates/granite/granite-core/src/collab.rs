//! Interfaces to the collaborators that live outside this workspace: bar
//! acquisition (and the IBKR TWS session it owns), CSV mirroring and the
//! fundamentals fetch.

use std::io;
use std::sync::Arc;

use basalt_events::{Fundamentals, TickerRecord};

/// Data-acquisition side. Calls may block for a long time (network, TWS
/// handshakes); async callers must move them onto a blocking worker.
pub trait DataManager: Send + Sync {
    fn register_listener(&self, listener: Arc<dyn DownloadListener>);

    fn start_downloader_agent(&self);

    /// Every known ticker in the `to_serializable_dict` shape.
    fn get_all_stock_data(&self) -> Vec<serde_json::Value>;

    fn connect_to_ibkr_tws(&self);

    fn disconnect_from_ibkr_tws(&self);

    fn is_downloading(&self) -> bool;
}

/// Notifications from the data manager. Invoked on the manager's threads.
pub trait DownloadListener: Send + Sync {
    fn on_download_started(&self) {}

    fn on_download_finished(&self) {}

    /// The TWS connection dropped under whoever was holding it.
    fn on_ibkr_connection_failed(&self) {}
}

/// Best-effort persistence of published rows.
pub trait RowMirror: Send + Sync {
    fn mirror(&self, record: &TickerRecord) -> io::Result<()>;
}

/// Mirror that persists nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMirror;

impl RowMirror for NoMirror {
    fn mirror(&self, _record: &TickerRecord) -> io::Result<()> {
        Ok(())
    }
}

pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

pub trait FundamentalsSource: Send + Sync {
    fn fetch(&self, symbol: &str) -> Result<Fundamentals, FetchError>;
}

/// Data manager with no feed attached: never downloads, holds no data and
/// treats TWS session requests as no-ops.
#[derive(Default)]
pub struct IdleDataManager {
    listeners: parking_lot::Mutex<Vec<Arc<dyn DownloadListener>>>,
}

impl IdleDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl DataManager for IdleDataManager {
    fn register_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.listeners.lock().push(listener);
    }

    fn start_downloader_agent(&self) {
        tracing::info!("no data feed configured; downloader agent idle");
    }

    fn get_all_stock_data(&self) -> Vec<serde_json::Value> {
        Vec::new()
    }

    fn connect_to_ibkr_tws(&self) {
        tracing::debug!("connect_to_ibkr_tws ignored by idle data manager");
    }

    fn disconnect_from_ibkr_tws(&self) {
        tracing::debug!("disconnect_from_ibkr_tws ignored by idle data manager");
    }

    fn is_downloading(&self) -> bool {
        false
    }
}
