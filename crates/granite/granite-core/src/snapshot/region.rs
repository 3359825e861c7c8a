//! Seqlock-guarded blob image inside a snapshot region.
//!
//! # Memory Layout
//!
//! ```text
//! 0 ──►┌───────────────────────────────────────────────┐
//!      │ magic u64 │ seq u64 │ len u64 │ flags u64     │  preamble (32 B, LE)
//! 32 ─►├───────────────────────────────────────────────┤
//!      │ len bytes of UTF-8 JSON                       │
//!      │ (unused tail)                                 │
//!      └───────────────────────────────────────────────┘
//! ```
//!
//! `seq` is odd while the blob is being replaced. A region whose flags carry
//! [`FLAG_RETIRED`] has been superseded by a larger one and is about to be
//! unlinked; readers should look up the advertised name again.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::Duration;

use basalt_mmap::{SharedRegion, SharedRegionMut, ShmNamespace};

use super::SnapshotError;

pub const PREAMBLE_SIZE: usize = 32;
pub const SNAPSHOT_MAGIC: u64 = u64::from_le_bytes(*b"GRNTSNAP");
pub const FLAG_RETIRED: u64 = 1;

const SEQ_OFFSET: usize = 8;
const LEN_OFFSET: usize = 16;
const FLAGS_OFFSET: usize = 24;

/// Pause between attempts to open a region whose preamble is still zero.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(1);

#[inline(always)]
unsafe fn seq_word<'a>(base: *const u8) -> &'a AtomicU64 {
    // SAFETY: mappings are page aligned, so offset 8 is 8-byte aligned.
    unsafe { &*(base.add(SEQ_OFFSET) as *const AtomicU64) }
}

#[inline(always)]
unsafe fn load_u64(p: *const u8) -> u64 {
    u64::from_le_bytes(unsafe { ptr::read_volatile(p as *const [u8; 8]) })
}

#[inline(always)]
unsafe fn store_u64(p: *mut u8, v: u64) {
    unsafe { ptr::write_volatile(p as *mut [u8; 8], v.to_le_bytes()) }
}

/// Writer-owned snapshot region.
pub struct SnapshotRegion {
    region: SharedRegionMut,
    base: *mut u8,
}

// SAFETY: `base` points into `region`; mutation requires `&mut self`.
unsafe impl Send for SnapshotRegion {}

impl SnapshotRegion {
    pub fn create(ns: &ShmNamespace, name: &str, size_bytes: usize) -> Result<Self, SnapshotError> {
        if size_bytes <= PREAMBLE_SIZE {
            return Err(SnapshotError::RegionTooSmall {
                name: name.to_string(),
                size: size_bytes,
            });
        }
        let mut region = SharedRegionMut::create(ns, name, size_bytes)?;
        let base = region.as_mut_ptr();
        // SAFETY: fresh mapping at least PREAMBLE_SIZE long. Readers may
        // already see the zero-filled file; they treat magic 0 as not ready,
        // so the magic is stored last.
        unsafe {
            store_u64(base.add(LEN_OFFSET), 0);
            store_u64(base.add(FLAGS_OFFSET), 0);
            seq_word(base).store(0, Ordering::Relaxed);
            fence(Ordering::Release);
            store_u64(base, SNAPSHOT_MAGIC);
        }
        Ok(Self { region, base })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Largest blob this region can hold.
    pub fn payload_capacity(&self) -> usize {
        self.region.len() - PREAMBLE_SIZE
    }

    /// Replace the blob. Fails without touching memory when it does not fit.
    pub fn write_blob(&mut self, blob: &[u8]) -> Result<u64, SnapshotError> {
        if blob.len() > self.payload_capacity() {
            return Err(SnapshotError::BlobTooLarge {
                len: blob.len(),
                capacity: self.payload_capacity(),
            });
        }
        let base = self.base;
        // SAFETY: the blob fits (checked above) and `&mut self` makes this the
        // only writer.
        unsafe {
            let word = seq_word(base);
            let s0 = word.load(Ordering::Relaxed);
            word.store(s0.wrapping_add(1), Ordering::Relaxed);
            fence(Ordering::Release);

            ptr::copy_nonoverlapping(blob.as_ptr(), base.add(PREAMBLE_SIZE), blob.len());
            store_u64(base.add(LEN_OFFSET), blob.len() as u64);

            let s1 = s0.wrapping_add(2);
            word.store(s1, Ordering::Release);
            Ok(s1)
        }
    }

    /// Flag the region as superseded.
    pub fn retire(&mut self) {
        let base = self.base;
        // SAFETY: same single-writer discipline as `write_blob`.
        unsafe {
            let word = seq_word(base);
            let s0 = word.load(Ordering::Relaxed);
            word.store(s0.wrapping_add(1), Ordering::Relaxed);
            fence(Ordering::Release);
            let flags = load_u64(base.add(FLAGS_OFFSET));
            store_u64(base.add(FLAGS_OFFSET), flags | FLAG_RETIRED);
            word.store(s0.wrapping_add(2), Ordering::Release);
        }
    }

    /// Unmap and unlink.
    pub fn close(self) -> Result<(), SnapshotError> {
        self.region.close()?;
        Ok(())
    }
}

/// Outcome of one optimistic blob read.
#[derive(Debug, PartialEq, Eq)]
pub enum BlobRead {
    Stable { seq: u64, blob: Vec<u8> },
    /// A write was in flight or the copy was torn.
    Busy,
    Retired,
}

/// Read-only attachment to a snapshot region.
pub struct SnapshotRegionReader {
    region: SharedRegion,
    base: *const u8,
}

// SAFETY: reads only, through a pointer owned by `region`.
unsafe impl Send for SnapshotRegionReader {}

impl SnapshotRegionReader {
    /// Attach to `name`. A region whose preamble is still being written
    /// yields [`SnapshotError::NotReady`].
    pub fn open(ns: &ShmNamespace, name: &str) -> Result<Self, SnapshotError> {
        let region = SharedRegion::open_ro(ns, name)?;
        if region.len() <= PREAMBLE_SIZE {
            return Err(SnapshotError::RegionTooSmall {
                name: name.to_string(),
                size: region.len(),
            });
        }
        let base = region.as_ptr();
        // SAFETY: the region is longer than the preamble.
        let magic = unsafe { load_u64(base) };
        if magic == 0 {
            return Err(SnapshotError::NotReady(name.to_string()));
        }
        fence(Ordering::Acquire);
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic {
                name: name.to_string(),
                found: magic,
            });
        }
        Ok(Self { region, base })
    }

    /// [`open`](Self::open), retrying up to `attempts` times while the
    /// region is not ready.
    pub fn open_with_retries(ns: &ShmNamespace, name: &str, attempts: u32) -> Result<Self, SnapshotError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::open(ns, name) {
                Err(SnapshotError::NotReady(_)) if attempt < attempts => {
                    tracing::debug!(region = name, attempt, "snapshot region not ready; retrying");
                    std::thread::sleep(OPEN_RETRY_DELAY);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn seq(&self) -> u64 {
        // SAFETY: validated on open.
        unsafe { seq_word(self.base) }.load(Ordering::Acquire)
    }

    pub fn read_blob(&self) -> BlobRead {
        let base = self.base;
        let cap = self.region.len() - PREAMBLE_SIZE;
        // SAFETY: every access stays inside the mapping; `len` is bounded by
        // the payload capacity before the copy.
        unsafe {
            let s1 = seq_word(base).load(Ordering::Acquire);
            if s1 & 1 == 1 {
                return BlobRead::Busy;
            }
            let flags = load_u64(base.add(FLAGS_OFFSET));
            let len = load_u64(base.add(LEN_OFFSET)) as usize;
            if len > cap {
                return BlobRead::Busy;
            }
            let mut blob = vec![0u8; len];
            for (i, b) in blob.iter_mut().enumerate() {
                *b = ptr::read_volatile(base.add(PREAMBLE_SIZE + i));
            }
            fence(Ordering::Acquire);
            let s2 = seq_word(base).load(Ordering::Relaxed);
            if s1 != s2 {
                return BlobRead::Busy;
            }
            if flags & FLAG_RETIRED != 0 {
                return BlobRead::Retired;
            }
            BlobRead::Stable { seq: s1, blob }
        }
    }

    pub fn close(self) {
        self.region.close();
    }
}
