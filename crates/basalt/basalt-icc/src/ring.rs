//! Ring index arithmetic.
//!
//! Slots are addressed modulo the ticker's capacity. Capacities come from the
//! static ticker index and need not be powers of two, so plain `%` is used
//! rather than a mask.

/// Slot that follows `idx` in a ring of `capacity` slots.
#[inline(always)]
pub fn advance(idx: u64, capacity: u64) -> u64 {
    (idx + 1) % capacity
}

/// Start slot of the window holding the `n` most recent rows when the next
/// write goes to `write_idx`.
///
/// ```text
/// capacity = 5, write_idx = 2, n = 3  →  start = (2 - 3) mod 5 = 4
/// window = slots 4, 0, 1
/// ```
#[inline(always)]
pub fn window_start(write_idx: u64, n: u64, capacity: u64) -> u64 {
    (write_idx + capacity - n % capacity) % capacity
}

/// Logical slice `[start, end)` of a ring buffer, in ring order.
///
/// `start` and `end` are taken modulo `capacity`, then clamped to the slots
/// `arr` actually holds:
/// - `start < end`: the plain slice `arr[start..end]`
/// - `start == end`: the whole buffer, beginning at `start`
///   (`arr[start..] ++ arr[..start]`), never an empty result
/// - `start > end`: the wrapped slice `arr[start..] ++ arr[..end]`
///
/// # Example
/// ```
/// use basalt_icc::ring_slice;
/// let arr = [0, 1, 2, 3, 4];
/// assert_eq!(ring_slice(&arr, 3, 1, 5), vec![3, 4, 0]);
/// assert_eq!(ring_slice(&arr, 0, 0, 5), vec![0, 1, 2, 3, 4]);
/// ```
pub fn ring_slice<T: Copy>(arr: &[T], start: usize, end: usize, capacity: usize) -> Vec<T> {
    let len = capacity.min(arr.len());
    if len == 0 {
        return Vec::new();
    }
    let arr = &arr[..len];
    let start = (start % capacity).min(len);
    let end = (end % capacity).min(len);

    if start < end {
        return arr[start..end].to_vec();
    }
    // start == end is the full-buffer case: arr[..end] is then arr[..start].
    let mut out = Vec::with_capacity(arr.len() - start + end);
    out.extend_from_slice(&arr[start..]);
    out.extend_from_slice(&arr[..end]);
    out
}
