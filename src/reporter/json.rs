use crate::{report::LoadReport, snapshot::ResultSnapshot};

use super::LoadReporter;

use serde::Serialize;
use std::io::Write;

/// Prints the report as pretty JSON.
pub struct JsonReporter;

impl LoadReporter for JsonReporter {
    fn print(&self, w: &mut dyn Write, report: &LoadReport) -> anyhow::Result<()> {
        let r = &report.result;
        let summary = Summary {
            vus: report.vus,
            duration: report.duration.as_secs_f64(),
            iterations: report.stats.iterations,
            hook_errors: report.stats.hook_errors,
            success_ratio: (r.total_requests > 0).then(|| r.total_success as f64 / r.total_requests as f64),
        };

        serde_json::to_writer_pretty(&mut *w, &Report { summary, result: r })?;

        writeln!(w)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct Summary {
    vus: u32,
    duration: f64,
    iterations: u64,
    hook_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    success_ratio: Option<f64>,
}

#[derive(Serialize)]
struct Report<'a> {
    summary: Summary,
    result: &'a ResultSnapshot,
}
