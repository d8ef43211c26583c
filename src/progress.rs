//! Live single-line progress view on stderr.
use std::{
    io::{self, Write},
    time::Duration,
};

use crossterm::{
    cursor::MoveToColumn,
    queue,
    style::{Print, Stylize},
    terminal::{Clear, ClearType},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{aggregator::AggregateCounters, snapshot::ResultSnapshot};

const BAR_WIDTH: usize = 30;

/// Redraws a progress line every time the aggregator publishes counters.
pub struct ProgressPrinter {
    live:     watch::Receiver<AggregateCounters>,
    duration: Duration,
}

impl ProgressPrinter {
    /// Creates a printer for a run of `duration`.
    pub fn new(live: watch::Receiver<AggregateCounters>, duration: Duration) -> Self {
        Self { live, duration }
    }

    /// Prints until `cancel` is cancelled or the aggregator goes away, then
    /// clears the line.
    pub async fn run(mut self, cancel: CancellationToken) -> io::Result<()> {
        let mut stderr = io::stderr();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = self.live.changed() => if changed.is_err() { break },
            }

            let snapshot = ResultSnapshot::from_counters(&self.live.borrow_and_update());
            queue!(stderr, MoveToColumn(0), Clear(ClearType::CurrentLine), Print(render_line(&snapshot, self.duration)))?;
            stderr.flush()?;
        }

        queue!(stderr, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        stderr.flush()
    }
}

fn render_line(snapshot: &ResultSnapshot, duration: Duration) -> String {
    let progress = if duration.is_zero() {
        1.0
    } else {
        (snapshot.elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0)
    };
    let filled = (progress * BAR_WIDTH as f64) as usize;
    let bar = format!("{}{}", "=".repeat(filled), " ".repeat(BAR_WIDTH - filled));

    format!(
        "[{}] {:>3.0}%  requests: {}  success: {}  failed: {}  rps: {:.1}",
        bar.green(),
        progress * 100.0,
        snapshot.total_requests,
        snapshot.total_success.to_string().green(),
        snapshot.total_failed.to_string().red(),
        snapshot.rps,
    )
}
