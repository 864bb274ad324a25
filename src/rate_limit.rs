//! Conversion of user bandwidth limits into storage traffic-limit values.

/// Header carrying the per-request traffic limit in bits/s.
pub const TRAFFIC_LIMIT_HEADER: &str = "x-oss-traffic-limit";

/// Smallest limit the storage accepts (bits/s).
pub const MIN_TRAFFIC_LIMIT: u64 = 245_760;

/// Largest limit the storage accepts (bits/s).
pub const MAX_TRAFFIC_LIMIT: u64 = 838_860_800;

/// Clamps a limit in bits/s to the range storage accepts.
///
/// Values of zero or below mean "no limit" and yield 0.
pub fn traffic_limit(bits_per_sec: i64) -> u64 {
    if bits_per_sec <= 0 {
        return 0;
    }
    (bits_per_sec as u64).clamp(MIN_TRAFFIC_LIMIT, MAX_TRAFFIC_LIMIT)
}

/// Splits an aggregate limit in KB/s evenly across `threads` workers.
///
/// # Example
///
/// ```
/// use dsfetch::per_thread_traffic_limit;
///
/// // 1 MB/s over 4 workers: 1024 * 1024 * 8 / 4 bits/s each
/// assert_eq!(per_thread_traffic_limit(1024, 4), 2_097_152);
/// assert_eq!(per_thread_traffic_limit(0, 4), 0);
/// ```
pub fn per_thread_traffic_limit(limit_kb_per_sec: i64, threads: usize) -> u64 {
    let threads = threads.max(1) as i64;
    traffic_limit(limit_kb_per_sec.saturating_mul(1024 * 8) / threads)
}
