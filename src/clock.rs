//! Wall-clock time source for message timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time in microseconds since the Unix epoch.
///
/// Clocks set before the epoch yield negative values rather than an error.
///
/// # Examples
///
/// ```
/// # use logstream::clock::real_time_micros;
/// let t1 = real_time_micros();
/// let t2 = real_time_micros();
/// assert!(t1 > 0);
/// assert!(t2 >= t1 - 1_000_000);
/// ```
pub fn real_time_micros() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_micros() as i64,
        Err(before) => -(before.duration().as_micros() as i64),
    }
}
