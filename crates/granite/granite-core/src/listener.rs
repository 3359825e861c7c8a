//! Publishes the data manager's stock data whenever a download completes.

use std::sync::{Arc, Weak};

use basalt_events::TickerRecord;

use crate::collab::{DataManager, DownloadListener};
use crate::columnar::ColumnarPublisher;
use crate::snapshot::SnapshotPublisher;

pub struct PublishingListener {
    manager: Weak<dyn DataManager>,
    snapshot: Option<Arc<SnapshotPublisher>>,
    columnar: Option<Arc<ColumnarPublisher>>,
}

impl PublishingListener {
    /// The manager is held weakly: it owns the listener once registered.
    pub fn new(manager: &Arc<dyn DataManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            snapshot: None,
            columnar: None,
        }
    }

    pub fn with_snapshot(mut self, publisher: Arc<SnapshotPublisher>) -> Self {
        self.snapshot = Some(publisher);
        self
    }

    pub fn with_columnar(mut self, publisher: Arc<ColumnarPublisher>) -> Self {
        self.columnar = Some(publisher);
        self
    }

    /// Pull everything from the manager and run it through each publisher.
    pub fn publish_all(&self) {
        let Some(manager) = self.manager.upgrade() else {
            tracing::warn!("data manager gone; nothing to publish");
            return;
        };
        let records: Vec<TickerRecord> = manager
            .get_all_stock_data()
            .into_iter()
            .filter_map(|v| match TickerRecord::from_value(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping invalid record");
                    None
                }
            })
            .collect();
        tracing::info!(records = records.len(), "publishing downloaded data");

        if let Some(columnar) = &self.columnar {
            match columnar.publish(&records) {
                Ok(rows) => tracing::debug!(rows, "columnar rows appended"),
                Err(e) => tracing::error!(error = %e, "columnar publish failed"),
            }
        }
        if let Some(snapshot) = &self.snapshot {
            match snapshot.write_data(records) {
                Ok(out) => tracing::debug!(
                    tickers = out.tickers,
                    bytes = out.blob_bytes,
                    region = %out.region,
                    "snapshot published"
                ),
                Err(e) => tracing::error!(error = %e, "snapshot publish failed"),
            }
        }
    }
}

impl DownloadListener for PublishingListener {
    fn on_download_started(&self) {
        tracing::debug!("download started");
    }

    fn on_download_finished(&self) {
        self.publish_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_state::MarketState;
    use basalt_mmap::ShmNamespace;
    use granite_config::SnapshotConfig;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct OneShot {
        listeners: Mutex<Vec<Arc<dyn DownloadListener>>>,
    }

    impl DataManager for OneShot {
        fn register_listener(&self, l: Arc<dyn DownloadListener>) {
            self.listeners.lock().push(l);
        }
        fn start_downloader_agent(&self) {
            let listeners = self.listeners.lock().clone();
            for l in listeners {
                l.on_download_started();
                l.on_download_finished();
            }
        }
        fn get_all_stock_data(&self) -> Vec<serde_json::Value> {
            vec![
                json!({"ticker": "AAPL", "df": [{
                    "Date": "2024-01-01", "Open": 10.0, "High": 12.0,
                    "Low": 9.5, "Close": 11.5, "Volume": 1500
                }]}),
                json!({"ticker": "", "df": null}),
            ]
        }
        fn connect_to_ibkr_tws(&self) {}
        fn disconnect_from_ibkr_tws(&self) {}
        fn is_downloading(&self) -> bool {
            false
        }
    }

    #[test]
    fn download_finished_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(MarketState::new());
        let cfg = SnapshotConfig {
            region_name: "md".into(),
            initial_size_bytes: 4096,
            max_retries: 6,
        };
        let snapshot =
            Arc::new(SnapshotPublisher::create(ShmNamespace::new(dir.path()), &cfg, state.clone()).unwrap());

        let manager: Arc<dyn DataManager> = Arc::new(OneShot::default());
        let listener = PublishingListener::new(&manager).with_snapshot(snapshot);
        manager.register_listener(Arc::new(listener));
        manager.start_downloader_agent();

        assert_eq!(state.tickers(), ["AAPL"]);
        assert_eq!(state.quote("AAPL").unwrap().price, 11.5);
        assert_eq!(state.snapshot_epoch().epoch, 2);
    }
}
