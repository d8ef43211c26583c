use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

use crate::{
    histogram::LatencyHistogram,
    record::{OTHER, Outcome, Record},
};

/// Aggregate state owned by the aggregator consumer.
///
/// Producers never see this type mutably; live observers receive clones.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub struct AggregateCounters {
    pub total_requests:     u64,
    pub total_success:      u64,
    pub total_failed:       u64,
    pub total_unclassified: u64,

    pub total_request_time_ms:   u64,
    pub success_request_time_ms: u64,
    pub failed_request_time_ms:  u64,

    pub failure_reasons: HashMap<String, u64>,
    /// Responses per http status code, for records tagged with `status`.
    pub status_codes:    BTreeMap<u16, u64>,
    pub latency:         LatencyHistogram,

    pub started_at:      Instant,
    pub started_at_wall: DateTime<Utc>,
    pub stopped_at:      Option<Instant>,

    max_failure_reasons: usize,
}

impl AggregateCounters {
    /// Zeroed counters starting now.
    pub fn new(max_failure_reasons: usize) -> Self {
        Self {
            total_requests: 0,
            total_success: 0,
            total_failed: 0,
            total_unclassified: 0,
            total_request_time_ms: 0,
            success_request_time_ms: 0,
            failed_request_time_ms: 0,
            failure_reasons: HashMap::new(),
            status_codes: BTreeMap::new(),
            latency: LatencyHistogram::new(),
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
            stopped_at: None,
            max_failure_reasons,
        }
    }

    /// Wall-clock time from start to `now`, or to the stop time once stopped.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        self.stopped_at.unwrap_or(now).saturating_duration_since(self.started_at)
    }

    pub(crate) fn stop(&mut self) {
        self.stopped_at.get_or_insert_with(Instant::now);
    }

    fn count_reason(&mut self, reason: &str) {
        if let Some(count) = self.failure_reasons.get_mut(reason) {
            *count += 1;
            return;
        }
        // the cap leaves one slot for the overflow bucket itself
        let key = if self.failure_reasons.len() + 1 < self.max_failure_reasons { reason } else { OTHER };
        *self.failure_reasons.entry(key.to_owned()).or_default() += 1;
    }
}

impl std::ops::AddAssign<&Record> for AggregateCounters {
    fn add_assign(&mut self, record: &Record) {
        // the recorder only forwards records with both timestamps set
        let duration = record.duration().unwrap_or_default();
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        self.total_requests += 1;
        self.total_request_time_ms += millis;

        match record.outcome() {
            Outcome::Success => {
                self.total_success += 1;
                self.success_request_time_ms += millis;
            }
            Outcome::Failed(reason) => {
                self.total_failed += 1;
                self.failed_request_time_ms += millis;
                self.count_reason(reason);
            }
            Outcome::Unset => self.total_unclassified += 1,
        }

        if let Some(code) = record.get("status").and_then(|v| v.as_u64()).and_then(|c| u16::try_from(c).ok()) {
            *self.status_codes.entry(code).or_default() += 1;
        }

        if let Err(e) = self.latency.record(duration) {
            tracing::warn!("dropping latency sample: {e}");
        }
    }
}
