pub mod logging;

use std::time::Duration;

/// Whole milliseconds, saturating instead of truncating on absurd durations.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
