/// Wall-clock milliseconds since the unix epoch. A clock set before 1970
/// reads as zero.
#[inline(always)]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
