//! A thin wrapper around [`hdrhistogram::Histogram`] for request latencies.
use std::time::Duration;

use hdrhistogram::Histogram;

use crate::error::AggregatorError;

/// Percentiles reported for request latencies.
pub(crate) const PERCENTAGES: &[f64] = &[50.0, 75.0, 90.0, 95.0, 99.0, 99.9];

/// Request latency histogram with microsecond resolution.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    hist: Histogram<u64>,
}

impl LatencyHistogram {
    /// Creates an empty histogram.
    pub fn new() -> LatencyHistogram {
        Self { hist: Histogram::<u64>::new(3).expect("create histogram") }
    }

    /// Records a latency value.
    pub fn record(&mut self, d: Duration) -> Result<(), AggregatorError> {
        let micros = u64::try_from(d.as_micros()).map_err(|_| AggregatorError::LatencyTooLarge { latency: d })?;
        self.hist.record(micros).map_err(AggregatorError::HistogramRecord)
    }

    /// Number of recorded values.
    pub fn len(&self) -> u64 {
        self.hist.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.hist.is_empty()
    }

    /// Lowest recorded latency.
    pub fn min(&self) -> Duration {
        Duration::from_micros(self.hist.min())
    }

    /// Highest recorded latency.
    pub fn max(&self) -> Duration {
        Duration::from_micros(self.hist.max())
    }

    /// Latency at the given quantile (0.0..=1.0).
    pub fn value_at_quantile(&self, q: f64) -> Duration {
        Duration::from_micros(self.hist.value_at_quantile(q))
    }

    /// Latency at each of the given percentages.
    pub fn percentiles<'a>(&'a self, percentages: &'a [f64]) -> impl Iterator<Item = (f64, Duration)> + 'a {
        percentages.iter().map(|&p| (p, self.value_at_quantile(p / 100.0)))
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}
