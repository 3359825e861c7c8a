//! Single-writer side of the columnar ring region.
//!
//! The writer creates and owns the region. Exactly one writer exists per
//! region: `append` takes `&mut self`, and the type is not `Sync`.

use std::ptr;

use basalt_mmap::{SharedRegionMut, ShmNamespace};

use crate::ColumnarError;
use crate::layout::{TickerIndex, TickerLayout};
use crate::ring::advance;
use crate::seqlock;

pub struct ColumnarWriter {
    /// Owns the mapping; unlinked when the writer is closed or dropped.
    region: SharedRegionMut,
    /// Start of the mapped region.
    base: *mut u8,
    index: TickerIndex,
}

// SAFETY: `base` points into `region`, which moves with the writer. All access
// goes through `&mut self`, so the single-writer rule holds on any thread.
unsafe impl Send for ColumnarWriter {}

impl ColumnarWriter {
    /// Create region `name` sized for `index` and initialise every header to
    /// `{write_idx: 0, capacity, last_ts: 0, seqlock: 0}`.
    pub fn create(ns: &ShmNamespace, name: &str, index: TickerIndex) -> Result<Self, ColumnarError> {
        let mut region = SharedRegionMut::create(ns, name, index.region_size())?;
        let base = region.as_mut_ptr();

        // SAFETY: region was just created with room for every layout in the
        // index, and no reader can have seen a header yet.
        for (_, layout) in index.iter() {
            unsafe { seqlock::init_header(base, layout) };
        }

        tracing::info!(
            region = name,
            tickers = index.len(),
            size_bytes = region.len(),
            "columnar region created"
        );
        Ok(Self {
            region,
            base,
            index,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn index(&self) -> &TickerIndex {
        &self.index
    }

    /// Append one bar for `ticker` and return `(write_idx, last_ts)` after the
    /// write. When the ring is full the oldest slot is overwritten.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        ticker: &str,
        ts: i64,
        open: f32,
        high: f32,
        low: f32,
        close: f32,
        volume: i64,
    ) -> Result<(u64, i64), ColumnarError> {
        let layout = *self
            .index
            .get(ticker)
            .ok_or_else(|| ColumnarError::UnknownTicker(ticker.to_string()))?;
        let base = self.base;

        // SAFETY: layout comes from the index the region was sized for, and
        // `&mut self` guarantees no other writer touches this header.
        unsafe {
            let header = seqlock::load_header(base, &layout);
            let wi = header.write_idx;
            let s0 = seqlock::begin_write(base, &layout);

            write_slot(base, &layout, wi as usize, ts, open, high, low, close, volume);

            let next = advance(wi, header.capacity);
            seqlock::end_write(base, &layout, s0, next, ts as u64);
            Ok((next, ts))
        }
    }

    /// Layout lookup, mainly for diagnostics.
    pub fn layout(&self, ticker: &str) -> Option<&TickerLayout> {
        self.index.get(ticker)
    }

    /// Current header for `ticker` as seen by the writer itself.
    pub fn header(&self, ticker: &str) -> Result<crate::Header, ColumnarError> {
        let layout = self
            .index
            .get(ticker)
            .ok_or_else(|| ColumnarError::UnknownTicker(ticker.to_string()))?;
        // SAFETY: only this writer mutates the header, and it is borrowed here.
        Ok(unsafe { seqlock::load_header(self.base, layout) })
    }

    #[cfg(test)]
    pub(crate) fn region_ptr_for_test(&mut self) -> *mut u8 {
        self.base
    }

    /// Unmap and unlink the region.
    pub fn close(self) -> Result<(), ColumnarError> {
        let name = self.region.name().to_string();
        self.region.close()?;
        tracing::info!(region = %name, "columnar region closed");
        Ok(())
    }
}

// Column order is fixed: ts, open, high, low, close, volume.
#[allow(clippy::too_many_arguments)]
#[inline(always)]
unsafe fn write_slot(
    base: *mut u8,
    l: &TickerLayout,
    slot: usize,
    ts: i64,
    open: f32,
    high: f32,
    low: f32,
    close: f32,
    volume: i64,
) {
    unsafe {
        ptr::write(base.add(l.ts_off + slot * 8) as *mut [u8; 8], ts.to_le_bytes());
        ptr::write(base.add(l.open_off + slot * 4) as *mut [u8; 4], open.to_le_bytes());
        ptr::write(base.add(l.high_off + slot * 4) as *mut [u8; 4], high.to_le_bytes());
        ptr::write(base.add(l.low_off + slot * 4) as *mut [u8; 4], low.to_le_bytes());
        ptr::write(base.add(l.close_off + slot * 4) as *mut [u8; 4], close.to_le_bytes());
        ptr::write(base.add(l.volume_off + slot * 8) as *mut [u8; 8], volume.to_le_bytes());
    }
}
