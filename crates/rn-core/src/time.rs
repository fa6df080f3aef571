//! Time utilities for rn nodes

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock reads earlier than the Unix epoch.
///
/// # Examples
/// ```
/// use rn_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Convert a possibly negative millisecond count to a `Duration`, clamping at zero
pub fn millis_to_duration(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}
