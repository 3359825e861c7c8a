//! End-to-end tests for the columnar ring region.
//!
//! # Overview
//!
//! The two-process test spawns the test executable twice (writer and reader
//! roles selected by an environment variable). The writer appends paced bars
//! while the reader repeatedly takes `view_last_n` snapshots and checks that
//! every row it sees is internally consistent: a torn row would pair a `ts`
//! with prices or a volume from a different append.
//!
//! ```text
//! [Writer]  --[create]--[append 0..N, paced]--------------[wait .done]--[unlink]
//!                |            |     |     |
//!                v            v     v     v
//!           [region file]  (concurrent snapshots)
//!                ^            ^     ^     ^
//! [Reader]  ----[attach]----[view_last_n ...]--[touch .done]
//! ```
//!
//! # Running the Test
//!
//! ```bash
//! cargo test -p basalt-icc --test e2e_columnar -- --nocapture
//! ```

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use basalt_icc::{ColumnarError, ColumnarReader, ColumnarWriter, TickerIndex};
use basalt_mmap::ShmNamespace;

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "BASALT_E2E_ROLE";
const ENV_DIR: &str = "BASALT_E2E_DIR";

const ROLE_WRITER: &str = "writer";
const ROLE_READER: &str = "reader";

const REGION: &str = "basalt_e2e_bars";
const TICKERS: [&str; 2] = ["AAPL", "MSFT"];
const RING_CAPACITY: usize = 256;
const ROW_COUNT: i64 = 20_000;

const WRITER_BATCH_SIZE: i64 = 200;
const WRITER_BATCH_DELAY_US: u64 = 200;

fn index() -> TickerIndex {
    TickerIndex::sequential(TICKERS.iter().map(|t| (*t, RING_CAPACITY))).unwrap()
}

fn done_marker(dir: &Path) -> PathBuf {
    dir.join(format!("{REGION}.done"))
}

fn test_dir() -> PathBuf {
    let pid = std::process::id();
    env::temp_dir().join(format!("basalt_e2e_{pid}"))
}

// Each row encodes its own timestamp in every column, so any mix of two
// appends is detectable.
fn append_row(writer: &mut ColumnarWriter, ticker: &str, ts: i64) {
    let px = ts as f32;
    writer
        .append(ticker, ts, px, px, px, px, ts * 10)
        .expect("writer: append failed");
}

fn run_writer(dir: &Path) {
    let ns = ShmNamespace::new(dir);
    log!("[WRITER] Creating region {REGION} in {}", dir.display());
    let mut writer = ColumnarWriter::create(&ns, REGION, index()).expect("writer: create failed");

    let start = Instant::now();
    for ts in 1..=ROW_COUNT {
        for ticker in TICKERS {
            append_row(&mut writer, ticker, ts);
        }
        if ts % WRITER_BATCH_SIZE == 0 {
            std::thread::sleep(Duration::from_micros(WRITER_BATCH_DELAY_US));
        }
    }
    log!("[WRITER] Appended {ROW_COUNT} rows per ticker in {:?}", start.elapsed());

    // Keep the region alive until the reader has taken its final snapshot.
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done_marker(dir).exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    writer.close().expect("writer: close failed");
    log!("[WRITER] Region closed");
}

fn run_reader(dir: &Path) {
    let ns = ShmNamespace::new(dir);

    let open_deadline = Instant::now() + Duration::from_secs(5);
    let reader = loop {
        match ColumnarReader::attach(&ns, REGION, index()) {
            Ok(r) => break r,
            Err(_) if Instant::now() < open_deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("[READER] Failed to attach: {e}"),
        }
    };
    log!("[READER] Attached");

    let read_deadline = Instant::now() + Duration::from_secs(15);
    let mut snapshots = 0u64;
    let mut unstable = 0u64;
    let mut last_seen = 0i64;

    while Instant::now() < read_deadline {
        for ticker in TICKERS {
            match reader.view_last_n(ticker, RING_CAPACITY) {
                Ok(bars) => {
                    snapshots += 1;
                    let mut prev = None;
                    for i in 0..bars.len() {
                        let ts = bars.ts[i];
                        if ts == 0 {
                            // Slot not written yet.
                            continue;
                        }
                        let px = ts as f32;
                        assert_eq!(bars.open[i], px, "torn open at ts {ts}");
                        assert_eq!(bars.high[i], px, "torn high at ts {ts}");
                        assert_eq!(bars.low[i], px, "torn low at ts {ts}");
                        assert_eq!(bars.close[i], px, "torn close at ts {ts}");
                        assert_eq!(bars.volume[i], ts * 10, "torn volume at ts {ts}");
                        if let Some(p) = prev {
                            assert!(ts > p, "rows out of order: {p} then {ts}");
                        }
                        prev = Some(ts);
                    }
                    if let Some(p) = prev {
                        last_seen = last_seen.max(p);
                    }
                }
                Err(ColumnarError::Unstable { .. }) => unstable += 1,
                Err(e) => panic!("[READER] read failed: {e}"),
            }
        }
        if last_seen == ROW_COUNT {
            break;
        }
    }

    log!("[READER] snapshots: {snapshots}, unstable: {unstable}, last ts: {last_seen}");
    std::fs::write(done_marker(dir), b"").expect("reader: failed to write marker");
    reader.close();

    assert!(snapshots > 0, "Reader never obtained a consistent snapshot");
    assert_eq!(last_seen, ROW_COUNT, "Reader never observed the final row");
}

#[test]
fn e2e_two_process_columnar_ring() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let dir = PathBuf::from(env::var(ENV_DIR).expect("BASALT_E2E_DIR not set"));
        match role.as_str() {
            ROLE_WRITER => run_writer(&dir),
            ROLE_READER => run_reader(&dir),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let dir = test_dir();
    std::fs::create_dir_all(&dir).expect("failed to create test dir");
    let exe = env::current_exe().expect("Failed to get current executable path");

    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_columnar_ring")
            .env(ENV_ROLE, role)
            .env(ENV_DIR, &dir)
            .stderr(Stdio::inherit())
            .spawn()
            .expect("Failed to spawn child process")
    };

    let mut writer_proc = spawn(ROLE_WRITER);
    std::thread::sleep(Duration::from_millis(5));
    let mut reader_proc = spawn(ROLE_READER);

    let writer_status = writer_proc.wait().expect("Failed to wait for writer");
    let reader_status = reader_proc.wait().expect("Failed to wait for reader");

    let region_left = dir.join(REGION).exists();
    let _ = std::fs::remove_dir_all(&dir);

    assert!(writer_status.success(), "Writer process failed: {writer_status}");
    assert!(reader_status.success(), "Reader process failed: {reader_status}");
    assert!(!region_left, "writer did not unlink its region");
}

#[test]
fn eviction_keeps_most_recent_rows_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    let cap = 5usize;
    let mut writer =
        ColumnarWriter::create(&ns, "evict", TickerIndex::sequential([("AAPL", cap)]).unwrap())
            .unwrap();
    let reader =
        ColumnarReader::attach(&ns, "evict", writer.index().clone()).unwrap();

    for k in 0..(2 * cap as i64 + 3) {
        append_row(&mut writer, "AAPL", k + 1);
        let written = k + 1;
        let bars = reader.view_last_n("AAPL", cap).unwrap();
        if written >= cap as i64 {
            let expected: Vec<i64> = (written - cap as i64 + 1..=written).collect();
            assert_eq!(bars.ts, expected);
        }
        assert_eq!(
            reader.header("AAPL").unwrap().write_idx,
            (written as u64) % cap as u64
        );
    }

    reader.close();
    writer.close().unwrap();
    assert!(!ns.exists("evict"));
}

#[test]
fn ring_scenario_last_three_and_since() {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    let mut writer =
        ColumnarWriter::create(&ns, "scenario", TickerIndex::sequential([("AAPL", 5)]).unwrap())
            .unwrap();
    for ts in 0..=6 {
        let px = ts as f32;
        writer.append("AAPL", ts, px, px, px, px, ts).unwrap();
    }

    let reader = ColumnarReader::attach(&ns, "scenario", writer.index().clone()).unwrap();
    assert_eq!(reader.view_last_n("AAPL", 3).unwrap().ts, vec![4, 5, 6]);
    assert_eq!(reader.view_since("AAPL", 3).unwrap().ts, vec![4, 5, 6]);
    assert_eq!(reader.view_since("AAPL", 6).unwrap().len(), 0);
}

#[test]
fn reader_survives_region_unlink() {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    let mut writer =
        ColumnarWriter::create(&ns, "gone", TickerIndex::sequential([("AAPL", 4)]).unwrap())
            .unwrap();
    writer.append("AAPL", 9, 1.0, 1.0, 1.0, 1.0, 1).unwrap();
    let reader = ColumnarReader::attach(&ns, "gone", writer.index().clone()).unwrap();
    writer.close().unwrap();

    assert_eq!(reader.view_last_n("AAPL", 1).unwrap().ts, vec![9]);
    assert!(matches!(
        ColumnarReader::attach(&ns, "gone", TickerIndex::sequential([("AAPL", 4)]).unwrap()),
        Err(ColumnarError::Region(_))
    ));
}
