//! Byte layout of the columnar ring region.
//!
//! Every ticker owns one contiguous block: a fixed header followed by six
//! column arrays, each `capacity` elements long. Writer and reader derive the
//! offsets from the same `(offset, capacity)` pair through [`compute_layout`],
//! so the two sides cannot drift apart.
//!
//! # Memory Layout
//!
//! ```text
//! offset ─►┌──────────────────────────────────────────────────────────┐
//!          │ Header (28 B, little-endian, no padding)                 │
//!          │  write_idx u64 │ capacity u64 │ last_ts u64 │ seqlock u32 │
//!          ├──────────────────────────────────────────────────────────┤
//!          │ ts     i64 × capacity                                    │
//!          │ open   f32 × capacity                                    │
//!          │ high   f32 × capacity                                    │
//!          │ low    f32 × capacity                                    │
//!          │ close  f32 × capacity                                    │
//!          │ volume i64 × capacity                                    │
//! end ────►└──────────────────────────────────────────────────────────┘
//! ```
//!
//! Because the header is a multiple of 4 bytes and each row adds 32 bytes, a
//! 4-byte aligned ticker offset keeps the next ticker 4-byte aligned too, which
//! is what the atomic seqlock word needs.

use std::collections::HashMap;

/// Encoded header size: three u64 fields plus the u32 seqlock.
pub const HEADER_SIZE: usize = 28;

/// Offset of the seqlock word inside the header.
pub const SEQLOCK_OFFSET: usize = 24;

const TS_WIDTH: usize = 8;
const PX_WIDTH: usize = 4;
const VOL_WIDTH: usize = 8;

/// Bytes per ring slot across all six columns.
pub const ROW_BYTES: usize = TS_WIDTH + 4 * PX_WIDTH + VOL_WIDTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickerLayout {
    pub offset: usize,
    pub capacity: usize,
    pub ts_off: usize,
    pub open_off: usize,
    pub high_off: usize,
    pub low_off: usize,
    pub close_off: usize,
    pub volume_off: usize,
    pub end: usize,
}

/// Header start, the six column starts and the block end for one ticker.
pub fn compute_layout(offset: usize, capacity: usize) -> TickerLayout {
    let ts_off = offset + HEADER_SIZE;
    let open_off = ts_off + TS_WIDTH * capacity;
    let high_off = open_off + PX_WIDTH * capacity;
    let low_off = high_off + PX_WIDTH * capacity;
    let close_off = low_off + PX_WIDTH * capacity;
    let volume_off = close_off + PX_WIDTH * capacity;
    let end = volume_off + VOL_WIDTH * capacity;
    TickerLayout {
        offset,
        capacity,
        ts_off,
        open_off,
        high_off,
        low_off,
        close_off,
        volume_off,
        end,
    }
}

/// Decoded form of the per-ticker header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub write_idx: u64,
    pub capacity: u64,
    pub last_ts: u64,
    /// Odd while a row is being written, even when stable.
    pub seqlock: u32,
}

impl Header {
    #[inline]
    pub fn is_stable(&self) -> bool {
        self.seqlock & 1 == 0
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.write_idx.to_le_bytes());
        out[8..16].copy_from_slice(&self.capacity.to_le_bytes());
        out[16..24].copy_from_slice(&self.last_ts.to_le_bytes());
        out[24..28].copy_from_slice(&self.seqlock.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&bytes[24..28]);
        Self {
            write_idx: u64_at(0),
            capacity: u64_at(8),
            last_ts: u64_at(16),
            seqlock: u32::from_le_bytes(seq),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("ticker index is empty")]
    Empty,

    #[error("ticker '{0}' listed more than once")]
    Duplicate(String),

    #[error("ticker '{0}' has zero capacity")]
    ZeroCapacity(String),

    #[error("ticker '{ticker}' offset {offset} is not 4-byte aligned")]
    Misaligned { ticker: String, offset: usize },

    #[error("tickers '{first}' and '{second}' overlap")]
    Overlap { first: String, second: String },
}

/// Static `ticker -> layout` table, computed once before the first write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerIndex {
    entries: Vec<(String, TickerLayout)>,
    by_ticker: HashMap<String, usize>,
}

impl TickerIndex {
    /// Pack tickers back to back starting at offset 0, in iteration order.
    pub fn sequential<I, S>(tickers: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut next = 0usize;
        let mut explicit = Vec::new();
        for (ticker, capacity) in tickers {
            let layout = compute_layout(next, capacity);
            explicit.push((ticker.into(), next, capacity));
            next = layout.end;
        }
        Self::with_offsets(explicit)
    }

    /// Build from explicit `(ticker, offset, capacity)` triples.
    pub fn with_offsets<I, S>(tickers: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = (S, usize, usize)>,
        S: Into<String>,
    {
        let mut entries: Vec<(String, TickerLayout)> = Vec::new();
        let mut by_ticker = HashMap::new();
        for (ticker, offset, capacity) in tickers {
            let ticker = ticker.into();
            if capacity == 0 {
                return Err(LayoutError::ZeroCapacity(ticker));
            }
            if offset % 4 != 0 {
                return Err(LayoutError::Misaligned { ticker, offset });
            }
            if by_ticker.contains_key(&ticker) {
                return Err(LayoutError::Duplicate(ticker));
            }
            by_ticker.insert(ticker.clone(), entries.len());
            entries.push((ticker, compute_layout(offset, capacity)));
        }
        if entries.is_empty() {
            return Err(LayoutError::Empty);
        }

        let mut spans: Vec<&(String, TickerLayout)> = entries.iter().collect();
        spans.sort_by_key(|(_, l)| l.offset);
        for pair in spans.windows(2) {
            if pair[0].1.end > pair[1].1.offset {
                return Err(LayoutError::Overlap {
                    first: pair[0].0.clone(),
                    second: pair[1].0.clone(),
                });
            }
        }

        Ok(Self { entries, by_ticker })
    }

    #[inline]
    pub fn get(&self, ticker: &str) -> Option<&TickerLayout> {
        self.by_ticker.get(ticker).map(|&i| &self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TickerLayout)> {
        self.entries.iter().map(|(t, l)| (t.as_str(), l))
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(t, _)| t.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total region size covering every ticker block.
    pub fn region_size(&self) -> usize {
        self.entries.iter().map(|(_, l)| l.end).max().unwrap_or(0)
    }
}
