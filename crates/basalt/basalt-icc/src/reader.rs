//! Reader side of the columnar ring region.
//!
//! Any number of readers may attach to one region, in any process. A reader
//! never writes to the mapping and never blocks the writer: every read is an
//! optimistic copy validated against the header seqlock, retried a bounded
//! number of times.

use std::ptr;

use basalt_mmap::{SharedRegion, ShmNamespace};

use crate::ColumnarError;
use crate::layout::{Header, TickerIndex, TickerLayout};
use crate::ring::{ring_slice, window_start};
use crate::seqlock;

/// Default bound on seqlock retries per read.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Six aligned columns; row `i` is `(ts[i], open[i], ..., volume[i])`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bars {
    pub ts: Vec<i64>,
    pub open: Vec<f32>,
    pub high: Vec<f32>,
    pub low: Vec<f32>,
    pub close: Vec<f32>,
    pub volume: Vec<i64>,
}

impl Bars {
    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    fn window(&self, start: usize, end: usize, capacity: usize) -> Self {
        Self {
            ts: ring_slice(&self.ts, start, end, capacity),
            open: ring_slice(&self.open, start, end, capacity),
            high: ring_slice(&self.high, start, end, capacity),
            low: ring_slice(&self.low, start, end, capacity),
            close: ring_slice(&self.close, start, end, capacity),
            volume: ring_slice(&self.volume, start, end, capacity),
        }
    }

    /// Keep rows whose `ts` satisfies `keep`, with all columns kept aligned.
    fn retain_by_ts(self, keep: impl Fn(i64) -> bool) -> Self {
        let mask: Vec<bool> = self.ts.iter().map(|&t| keep(t)).collect();
        fn pick<T: Copy>(col: Vec<T>, mask: &[bool]) -> Vec<T> {
            col.into_iter()
                .zip(mask)
                .filter_map(|(v, &k)| k.then_some(v))
                .collect()
        }
        Self {
            ts: pick(self.ts, &mask),
            open: pick(self.open, &mask),
            high: pick(self.high, &mask),
            low: pick(self.low, &mask),
            close: pick(self.close, &mask),
            volume: pick(self.volume, &mask),
        }
    }
}

pub struct ColumnarReader {
    region: SharedRegion,
    base: *const u8,
    index: TickerIndex,
    max_retries: u32,
}

// SAFETY: the reader only performs reads through `base`, which stays valid for
// as long as `region` (moved together with it) is mapped.
unsafe impl Send for ColumnarReader {}

impl ColumnarReader {
    /// Attach to region `name` using the same ticker index as the writer.
    pub fn attach(ns: &ShmNamespace, name: &str, index: TickerIndex) -> Result<Self, ColumnarError> {
        Self::attach_with_retries(ns, name, index, DEFAULT_MAX_RETRIES)
    }

    pub fn attach_with_retries(
        ns: &ShmNamespace,
        name: &str,
        index: TickerIndex,
        max_retries: u32,
    ) -> Result<Self, ColumnarError> {
        let region = SharedRegion::open_ro(ns, name)?;
        let expected = index.region_size();
        if region.len() < expected {
            return Err(ColumnarError::RegionTooSmall {
                expected,
                actual: region.len(),
            });
        }
        let base = region.as_ptr();

        for (ticker, layout) in index.iter() {
            // SAFETY: the region covers every layout in the index (checked
            // above); capacity is written once before any append.
            let found = unsafe { seqlock::load_header(base, layout) }.capacity;
            if found != layout.capacity as u64 {
                return Err(ColumnarError::LayoutMismatch {
                    ticker: ticker.to_string(),
                    expected: layout.capacity as u64,
                    found,
                });
            }
        }

        tracing::debug!(region = name, tickers = index.len(), "attached columnar reader");
        Ok(Self {
            region,
            base,
            index,
            max_retries: max_retries.max(1),
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.index.tickers()
    }

    fn layout(&self, ticker: &str) -> Result<&TickerLayout, ColumnarError> {
        self.index
            .get(ticker)
            .ok_or_else(|| ColumnarError::UnknownTicker(ticker.to_string()))
    }

    /// Consistent header and all `capacity` slots in physical (slot) order.
    pub fn read_consistent(&self, ticker: &str) -> Result<(Header, Bars), ColumnarError> {
        let layout = self.layout(ticker)?;
        let base = self.base;

        for _ in 0..self.max_retries {
            // SAFETY: layout lies within the mapped region (validated on attach).
            unsafe {
                let s1 = seqlock::load_seq(base, layout);
                if s1 & 1 == 1 {
                    std::hint::spin_loop();
                    continue;
                }
                let h1 = seqlock::load_header(base, layout);
                let bars = copy_columns(base, layout);
                seqlock::read_fence();
                let s2 = seqlock::load_seq(base, layout);
                let h2 = seqlock::load_header(base, layout);

                if s1 == s2 && h1 == h2 {
                    return Ok((h1, bars));
                }
            }
            std::hint::spin_loop();
        }

        tracing::debug!(ticker, attempts = self.max_retries, "columnar read unstable");
        Err(ColumnarError::Unstable {
            ticker: ticker.to_string(),
            attempts: self.max_retries,
        })
    }

    /// Consistent header for `ticker`.
    pub fn header(&self, ticker: &str) -> Result<Header, ColumnarError> {
        let layout = self.layout(ticker)?;
        let base = self.base;
        for _ in 0..self.max_retries {
            // SAFETY: see `read_consistent`.
            unsafe {
                let s1 = seqlock::load_seq(base, layout);
                if s1 & 1 == 0 {
                    let h = seqlock::load_header(base, layout);
                    seqlock::read_fence();
                    if seqlock::load_seq(base, layout) == s1 {
                        return Ok(h);
                    }
                }
            }
            std::hint::spin_loop();
        }
        Err(ColumnarError::Unstable {
            ticker: ticker.to_string(),
            attempts: self.max_retries,
        })
    }

    /// The `n` most recent rows in chronological order. `n` is clamped to the
    /// ring capacity; slots never written read back as zeros.
    pub fn view_last_n(&self, ticker: &str, n: usize) -> Result<Bars, ColumnarError> {
        let (header, bars) = self.read_consistent(ticker)?;
        let capacity = header.capacity as usize;
        let n = n.min(capacity);
        if n == 0 {
            return Ok(Bars::default());
        }
        let end = header.write_idx as usize;
        let start = window_start(header.write_idx, n as u64, header.capacity) as usize;
        Ok(bars.window(start, end, capacity))
    }

    /// Rows of the full ring with `ts > ts_threshold`, chronological.
    pub fn view_since(&self, ticker: &str, ts_threshold: i64) -> Result<Bars, ColumnarError> {
        let capacity = self.layout(ticker)?.capacity;
        let all = self.view_last_n(ticker, capacity)?;
        Ok(all.retain_by_ts(|t| t > ts_threshold))
    }

    /// Detach; the region stays in place for its owner.
    pub fn close(self) {
        tracing::debug!(region = self.region.name(), "detached columnar reader");
        self.region.close();
    }
}

unsafe fn read_col<T: Copy, const W: usize>(
    base: *const u8,
    off: usize,
    n: usize,
    decode: fn([u8; W]) -> T,
) -> Vec<T> {
    (0..n)
        .map(|i| decode(unsafe { ptr::read_volatile(base.add(off + i * W) as *const [u8; W]) }))
        .collect()
}

unsafe fn copy_columns(base: *const u8, l: &TickerLayout) -> Bars {
    let n = l.capacity;
    unsafe {
        Bars {
            ts: read_col(base, l.ts_off, n, i64::from_le_bytes),
            open: read_col(base, l.open_off, n, f32::from_le_bytes),
            high: read_col(base, l.high_off, n, f32::from_le_bytes),
            low: read_col(base, l.low_off, n, f32::from_le_bytes),
            close: read_col(base, l.close_off, n, f32::from_le_bytes),
            volume: read_col(base, l.volume_off, n, i64::from_le_bytes),
        }
    }
}
