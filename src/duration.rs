//! Latency formatting with a unit picked from the magnitude.
use std::{fmt, time::Duration};

/// Display unit for latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatencyUnit {
    Micros,
    Millis,
    Secs,
}

impl LatencyUnit {
    /// The largest unit in which `d` is at least one.
    pub(crate) fn of(d: Duration) -> Self {
        match d.as_micros() {
            n if n < 1_000 => LatencyUnit::Micros,
            n if n < 1_000_000 => LatencyUnit::Millis,
            _ => LatencyUnit::Secs,
        }
    }

    fn scale(self, d: Duration) -> f64 {
        let nanos = d.as_nanos() as f64;
        match self {
            LatencyUnit::Micros => nanos / 1e3,
            LatencyUnit::Millis => nanos / 1e6,
            LatencyUnit::Secs => nanos / 1e9,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            LatencyUnit::Micros => "µs",
            LatencyUnit::Millis => "ms",
            LatencyUnit::Secs => "s",
        }
    }
}

/// A latency shown in a fixed unit; honours the formatter precision.
pub(crate) struct Latency {
    duration: Duration,
    unit:     LatencyUnit,
}

impl Latency {
    pub(crate) fn new(duration: Duration, unit: LatencyUnit) -> Self {
        Self { duration, unit }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.unit.scale(self.duration), f)?;
        f.write_str(self.unit.suffix())
    }
}
