//! Read-only view derived from the aggregate counters.
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    aggregator::AggregateCounters,
    histogram::PERCENTAGES,
    util::{average, rate},
};

/// Derived metrics, copied out of the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct ResultSnapshot {
    pub total_requests:     u64,
    pub total_success:      u64,
    pub total_failed:       u64,
    pub total_unclassified: u64,
    /// Failure reason counts, sorted by reason.
    pub failure_reasons:    BTreeMap<String, u64>,
    /// Responses per http status code, sorted by code.
    pub status_codes:       BTreeMap<u16, u64>,

    pub total_request_time_ms:   u64,
    pub success_request_time_ms: u64,
    pub failed_request_time_ms:  u64,

    pub average_latency_ms:         u64,
    pub average_success_latency_ms: u64,
    pub average_failed_latency_ms:  u64,

    /// Requests per second over the wall-clock time since the aggregator started.
    pub rps:         f64,
    pub success_rps: f64,
    pub failed_rps:  f64,

    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed:    Duration,
    pub started_at: DateTime<Utc>,

    /// Latency percentiles in milliseconds, absent when nothing was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySummary>,
}

/// Latency distribution summary, serialized in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Lowest latency.
    #[serde(rename = "min_ms", serialize_with = "as_millis_f64")]
    pub min: Duration,
    /// Highest latency.
    #[serde(rename = "max_ms", serialize_with = "as_millis_f64")]
    pub max: Duration,
    /// `(percentage, latency)` pairs.
    #[serde(serialize_with = "percentiles_as_millis")]
    pub percentiles: Vec<(f64, Duration)>,
}

impl ResultSnapshot {
    /// Snapshot of `counters` measured now.
    pub fn from_counters(counters: &AggregateCounters) -> Self {
        Self::measured_at(counters, Instant::now())
    }

    /// Snapshot of `counters` measured at `now`.
    ///
    /// Stopped counters are always measured at their stop time.
    pub fn measured_at(counters: &AggregateCounters, now: Instant) -> Self {
        let elapsed = counters.elapsed_at(now);
        let latency = (!counters.latency.is_empty()).then(|| LatencySummary {
            min: counters.latency.min(),
            max: counters.latency.max(),
            percentiles: counters.latency.percentiles(PERCENTAGES).collect(),
        });

        Self {
            total_requests: counters.total_requests,
            total_success: counters.total_success,
            total_failed: counters.total_failed,
            total_unclassified: counters.total_unclassified,
            failure_reasons: counters.failure_reasons.iter().map(|(k, &v)| (k.clone(), v)).collect(),
            status_codes: counters.status_codes.clone(),
            total_request_time_ms: counters.total_request_time_ms,
            success_request_time_ms: counters.success_request_time_ms,
            failed_request_time_ms: counters.failed_request_time_ms,
            average_latency_ms: average(counters.total_request_time_ms, counters.total_requests),
            average_success_latency_ms: average(counters.success_request_time_ms, counters.total_success),
            average_failed_latency_ms: average(counters.failed_request_time_ms, counters.total_failed),
            rps: rate(counters.total_requests, elapsed),
            success_rps: rate(counters.total_success, elapsed),
            failed_rps: rate(counters.total_failed, elapsed),
            elapsed,
            started_at: counters.started_at_wall,
            latency,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e6
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn as_millis_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(millis(*d))
}

fn percentiles_as_millis<S: serde::Serializer>(percentiles: &[(f64, Duration)], s: S) -> Result<S::Ok, S::Error> {
    s.collect_map(percentiles.iter().map(|&(p, d)| (format!("p{p}"), millis(d))))
}
