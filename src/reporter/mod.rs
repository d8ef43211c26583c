//! This module defines a trait for printing load reports.
mod json;
mod text;

pub use json::JsonReporter;
pub use text::TextReporter;

use crate::report::LoadReport;

/// A trait for reporting load test results.
pub trait LoadReporter {
    /// Print the report to the given writer.
    fn print(&self, w: &mut dyn std::io::Write, report: &LoadReport) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::time::{Duration, Instant};

    use crate::{
        aggregator::AggregateCounters, orchestrator::LifecycleStats, record::Record, report::LoadReport,
        snapshot::ResultSnapshot,
    };

    /// A report with 3 successes, 2 failures and 1 unclassified request.
    ///
    /// Every request but the timed out one got a response: four `200` and one
    /// `500`.
    pub(crate) fn report() -> LoadReport {
        let mut counters = AggregateCounters::new(8);
        let start = Instant::now();
        for (ms, outcome) in [
            (10, Some(None)),
            (20, Some(None)),
            (30, Some(None)),
            (40, Some(Some("status 500"))),
            (50, Some(Some("timeout"))),
            (60, None),
        ] {
            let mut record = Record::new("http");
            record.set_span(start, start + Duration::from_millis(ms));
            match outcome {
                Some(Some("status 500")) => record.set("status", 500),
                Some(Some(_)) => {}
                _ => record.set("status", 200),
            }
            match outcome {
                Some(None) => record.success(),
                Some(Some(reason)) => record.failed(reason),
                None => {}
            }
            counters += &record;
        }
        let result = ResultSnapshot::measured_at(&counters, counters.started_at + Duration::from_secs(2));
        LoadReport {
            vus: 4,
            duration: Duration::from_secs(2),
            stats: LifecycleStats { iterations: 6, hook_errors: 1 },
            result,
        }
    }
}
