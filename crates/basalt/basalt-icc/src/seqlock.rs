//! Header seqlock over raw mapped memory.
//!
//! The header lives at an arbitrary (4-byte aligned) offset inside the shared
//! region, so the u64 fields are moved as little-endian byte arrays and only
//! the seqlock word at `offset + 24` is accessed atomically.
//!
//! # Protocol
//!
//! **Writer:**
//! 1. Store `seq + 1` (odd) and issue a release fence
//! 2. Write the row into the six columns
//! 3. Store `write_idx`/`last_ts`, then `seq + 2` (even) with Release ordering
//!
//! **Reader:**
//! 1. Load seq with Acquire; odd means a write is in flight, try again
//! 2. Copy header fields and columns
//! 3. Acquire fence, reload seq and header; any difference means the copy may
//!    be torn, try again
//!
//! Retries are bounded by the caller; the reader never spins forever.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::layout::{HEADER_SIZE, Header, SEQLOCK_OFFSET, TickerLayout};

/// # Safety
/// `base + layout.offset + 28` must lie inside a live mapping and
/// `base + layout.offset` must be 4-byte aligned.
#[inline(always)]
unsafe fn seq_word<'a>(base: *const u8, layout: &TickerLayout) -> &'a AtomicU32 {
    unsafe { &*(base.add(layout.offset + SEQLOCK_OFFSET) as *const AtomicU32) }
}

#[inline(always)]
unsafe fn load_u64(p: *const u8) -> u64 {
    u64::from_le_bytes(unsafe { ptr::read(p as *const [u8; 8]) })
}

#[inline(always)]
unsafe fn store_u64(p: *mut u8, v: u64) {
    unsafe { ptr::write(p as *mut [u8; 8], v.to_le_bytes()) }
}

/// Current seqlock value (Acquire).
#[inline(always)]
pub(crate) unsafe fn load_seq(base: *const u8, layout: &TickerLayout) -> u32 {
    u32::from_le(unsafe { seq_word(base, layout) }.load(Ordering::Acquire))
}

/// Header image as currently in memory. Not consistent on its own; pair with
/// [`load_seq`] and [`read_fence`].
#[inline(always)]
pub(crate) unsafe fn load_header(base: *const u8, layout: &TickerLayout) -> Header {
    let h = unsafe { base.add(layout.offset) };
    unsafe {
        Header {
            write_idx: load_u64(h),
            capacity: load_u64(h.add(8)),
            last_ts: load_u64(h.add(16)),
            seqlock: u32::from_le(seq_word(base, layout).load(Ordering::Relaxed)),
        }
    }
}

/// Orders the preceding plain loads before the following seqlock reload.
#[inline(always)]
pub(crate) fn read_fence() {
    fence(Ordering::Acquire);
}

/// Write the initial header image `{0, capacity, 0, 0}`.
pub(crate) unsafe fn init_header(base: *mut u8, layout: &TickerLayout) {
    let header = Header {
        write_idx: 0,
        capacity: layout.capacity as u64,
        last_ts: 0,
        seqlock: 0,
    };
    let bytes = header.encode();
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(layout.offset), HEADER_SIZE) };
    fence(Ordering::Release);
}

/// Begin-write: publish `seq + 1` (odd). Returns the even value it replaced.
#[inline(always)]
pub(crate) unsafe fn begin_write(base: *mut u8, layout: &TickerLayout) -> u32 {
    let word = unsafe { seq_word(base, layout) };
    let s0 = u32::from_le(word.load(Ordering::Relaxed));
    word.store(s0.wrapping_add(1).to_le(), Ordering::Relaxed);
    fence(Ordering::Release);
    s0
}

/// End-write: store the new `write_idx`/`last_ts`, then publish `s0 + 2` (even).
#[inline(always)]
pub(crate) unsafe fn end_write(
    base: *mut u8,
    layout: &TickerLayout,
    s0: u32,
    write_idx: u64,
    last_ts: u64,
) {
    unsafe {
        let h = base.add(layout.offset);
        store_u64(h, write_idx);
        store_u64(h.add(16), last_ts);
        seq_word(base, layout).store(s0.wrapping_add(2).to_le(), Ordering::Release);
    }
}
