//! Snapshot and columnar publishers sharing one MarketState.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use basalt_events::TickerRecord;
use basalt_icc::TickerIndex;
use basalt_mmap::ShmNamespace;
use granite_config::SnapshotConfig;
use granite_core::{ColumnarPublisher, MarketState, RowMirror, SnapshotPublisher};
use serde_json::json;

const SNAPSHOT_BATCHES: usize = 200;
const COLUMNAR_BATCHES: usize = 200;

/// Records the global epoch parity seen while a snapshot batch is open.
struct ParityRecorder {
    state: Arc<MarketState>,
    calls: AtomicUsize,
    even_inside_batch: AtomicUsize,
}

impl RowMirror for ParityRecorder {
    fn mirror(&self, _record: &TickerRecord) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.state.snapshot_epoch().epoch % 2 == 0 {
            self.even_inside_batch.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn record(ticker: &str, day: usize) -> TickerRecord {
    let date = format!("2024-01-{:02}", 1 + day % 28);
    TickerRecord::from_value(json!({
        "ticker": ticker,
        "rows": [{"Date": date, "Open": 1.0, "High": 1.0, "Low": 1.0, "Close": 1.0, "Volume": 1}]
    }))
    .unwrap()
}

#[test]
fn concurrent_publishers_keep_epoch_parity() {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    let state = Arc::new(MarketState::new());

    let recorder = Arc::new(ParityRecorder {
        state: Arc::clone(&state),
        calls: AtomicUsize::new(0),
        even_inside_batch: AtomicUsize::new(0),
    });
    let cfg = SnapshotConfig {
        region_name: "snap".into(),
        initial_size_bytes: 1 << 16,
        max_retries: 6,
    };
    let snapshot = SnapshotPublisher::create(ns.clone(), &cfg, Arc::clone(&state))
        .unwrap()
        .with_mirror(recorder.clone());
    let index = TickerIndex::sequential([("AAPL", 64), ("MSFT", 64)]).unwrap();
    let columnar = ColumnarPublisher::create(&ns, "bars", index, Arc::clone(&state)).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..SNAPSHOT_BATCHES {
                let batch = vec![record("AAPL", i), record("MSFT", i), record("NVDA", i)];
                snapshot.write_data(batch).unwrap();
            }
        });
        s.spawn(|| {
            for i in 0..COLUMNAR_BATCHES {
                columnar.publish(&[record("AAPL", i), record("MSFT", i)]).unwrap();
            }
        });
    });

    assert_eq!(recorder.calls.load(Ordering::SeqCst), SNAPSHOT_BATCHES * 3);
    assert_eq!(
        recorder.even_inside_batch.load(Ordering::SeqCst),
        0,
        "epoch went even while a snapshot batch was open"
    );
    let epoch = state.snapshot_epoch().epoch;
    assert_eq!(epoch, 2 * (SNAPSHOT_BATCHES + COLUMNAR_BATCHES) as u64);
}

#[test]
fn each_batch_advances_epoch_by_two() {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    let state = Arc::new(MarketState::new());
    let cfg = SnapshotConfig {
        region_name: "snap".into(),
        initial_size_bytes: 4096,
        max_retries: 6,
    };
    let snapshot = SnapshotPublisher::create(ns.clone(), &cfg, Arc::clone(&state)).unwrap();
    let index = TickerIndex::sequential([("AAPL", 8)]).unwrap();
    let columnar = ColumnarPublisher::create(&ns, "bars", index, Arc::clone(&state)).unwrap();

    snapshot.write_data(vec![record("AAPL", 0)]).unwrap();
    assert_eq!(state.snapshot_epoch().epoch, 2);
    columnar.publish(&[record("AAPL", 0)]).unwrap();
    assert_eq!(state.snapshot_epoch().epoch, 4);
}
