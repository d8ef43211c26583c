use std::time::Duration;

/// Events per second over `elapsed`, zero when no time has passed.
pub(crate) fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// Integer average, zero when there is nothing to divide by.
pub(crate) fn average(total: u64, count: u64) -> u64 {
    total.checked_div(count).unwrap_or(0)
}
