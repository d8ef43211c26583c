//! The final load report.
use std::time::Duration;

use crate::{orchestrator::LifecycleStats, snapshot::ResultSnapshot};

/// Everything a reporter prints once a run has finished.
#[derive(Debug, Clone)]
pub struct LoadReport {
    /// Number of virtual users.
    pub vus: u32,
    /// Configured run duration.
    pub duration: Duration,
    /// Iteration statistics from the orchestrator.
    pub stats: LifecycleStats,
    /// Final aggregate metrics.
    pub result: ResultSnapshot,
}
