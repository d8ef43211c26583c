//! Command line interface of the `loadscript` binary.
//!
//! ```shell
//! $ loadscript --help
//! Usage: loadscript [OPTIONS] <SCRIPT>
//!
//! Arguments:
//!   <SCRIPT>
//!           Path of the JavaScript file defining the lifecycle hooks
//!
//! Options:
//!   -u, --vus <VUS>
//!           Number of virtual users running the script concurrently
//!
//!           [default: 10]
//!
//!   -d, --duration <DURATION>
//!           How long the virtual users keep iterating
//!
//!           Examples: -d 10s, -d 5m, -d 1h
//!
//!           [default: 60s]
//!
//!       --timeout <TIMEOUT>
//!           Timeout of a single http request
//!
//!           [default: 30s]
//!
//!       --iteration-delay <ITERATION_DELAY>
//!           Pause between two iterations of the same virtual user
//!
//!           [default: 0s]
//!
//!   -v, --verbose
//!           Log response bodies and lifecycle events
//!
//!   -q, --quiet
//!           Do not show the live progress line
//!
//!       --max-failure-reasons <MAX_FAILURE_REASONS>
//!           Number of distinct failure reasons kept before folding into "other"
//!
//!           [default: 64]
//!
//!   -o, --output <OUTPUT>
//!           Output format for the report
//!
//!           [default: text]
//!
//!   -O, --output-file <OUTPUT_FILE>
//!           Output file path for the report
//! ```
use std::{
    fs::File,
    io::{self, stderr, stdout},
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use clap::{
    Parser, ValueEnum,
    builder::{
        Styles,
        styling::{AnsiColor, Effects},
    },
};
use crossterm::tty::IsTty;
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::{Aggregator, AggregatorOpts},
    error::LifecycleError,
    http::HttpClient,
    orchestrator::{self, LifecycleStats, RunOptions},
    progress::ProgressPrinter,
    report::LoadReport,
    reporter::{JsonReporter, LoadReporter, TextReporter},
    script::{JsEngine, ScriptEngine},
};

#[derive(Parser, Clone, Debug)]
#[clap(
    name = "loadscript",
    version,
    about,
    styles(Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default())
    )
)]
#[allow(missing_docs)]
pub struct ScriptCli {
    /// Path of the JavaScript file defining the lifecycle hooks
    pub script: PathBuf,

    /// Number of virtual users running the script concurrently
    #[clap(long, short = 'u', default_value = "10")]
    pub vus: NonZeroU32,

    /// How long the virtual users keep iterating
    ///
    /// Examples: -d 10s, -d 5m, -d 1h
    #[clap(long, short = 'd', default_value = "60s")]
    pub duration: humantime::Duration,

    /// Timeout of a single http request
    #[clap(long, default_value = "30s")]
    pub timeout: humantime::Duration,

    /// Pause between two iterations of the same virtual user
    #[clap(long, default_value = "0s")]
    pub iteration_delay: humantime::Duration,

    /// Log response bodies and lifecycle events
    #[clap(long, short = 'v')]
    pub verbose: bool,

    /// Do not show the live progress line
    #[clap(long, short = 'q')]
    pub quiet: bool,

    /// Number of distinct failure reasons kept before folding into "other"
    #[clap(long, default_value = "64")]
    pub max_failure_reasons: NonZeroUsize,

    /// Output format for the report
    #[clap(short, long, value_enum, default_value_t = ReportFormat::Text, ignore_case = true)]
    pub output: ReportFormat,

    /// Output file path for the report
    ///
    /// When set, the report will be written to the specified file instead of stdout.
    #[clap(long, short = 'O')]
    pub output_file: Option<PathBuf>,
}

impl ScriptCli {
    pub(crate) fn run_options(&self) -> RunOptions {
        RunOptions {
            vus: self.vus.get(),
            duration: self.duration.into(),
            verbose: self.verbose,
            iteration_delay: self.iteration_delay.into(),
        }
    }

    fn show_progress(&self) -> bool {
        !self.quiet && stderr().is_tty()
    }
}

/// Load report format.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ReportFormat {
    /// Report in plain text format. See [`TextReporter`].
    Text,

    /// Report in JSON format. See [`JsonReporter`].
    Json,
}

/// Runs the script given on the command line and prints the report.
///
/// Nothing is printed when the run fails.
pub async fn run(cli: ScriptCli) -> anyhow::Result<()> {
    let name = cli.script.display().to_string();
    let source = std::fs::read_to_string(&cli.script).with_context(|| format!("failed to read script `{name}`"))?;
    let opts = cli.run_options();

    let mut aggregator = Aggregator::start(AggregatorOpts {
        max_failure_reasons: cli.max_failure_reasons.get(),
        ..Default::default()
    });

    let http = HttpClient::new(Handle::current(), Some(cli.timeout.into()), cli.verbose)?;
    let engine = JsEngine::new(aggregator.recorder(), http);
    let program = Arc::new(engine.compile(&name, &source).map_err(LifecycleError::Compile)?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping virtual users");
                cancel.cancel();
            }
        }
    });

    let done = CancellationToken::new();
    let progress = cli.show_progress().then(|| {
        let printer = ProgressPrinter::new(aggregator.subscribe(), opts.duration);
        tokio::spawn(printer.run(done.clone()))
    });

    let outcome = orchestrator::run(cancel, program, &opts).await;

    done.cancel();
    let stats = wind_down(outcome, &mut aggregator, progress).await?;

    let report = LoadReport { vus: opts.vus, duration: opts.duration, stats, result: aggregator.result() };
    let reporter: &dyn LoadReporter = match cli.output {
        ReportFormat::Text => &TextReporter,
        ReportFormat::Json => &JsonReporter,
    };
    match cli.output_file {
        Some(path) => reporter.print(&mut File::create(path)?, &report)?,
        None => reporter.print(&mut stdout(), &report)?,
    }

    Ok(())
}

/// Drains the aggregator and waits for the progress line.
///
/// The run outcome takes precedence over an aggregator error; a failing
/// progress line is only logged.
async fn wind_down(
    outcome: Result<LifecycleStats, LifecycleError>,
    aggregator: &mut Aggregator,
    progress: Option<JoinHandle<io::Result<()>>>,
) -> anyhow::Result<LifecycleStats> {
    let stopped = aggregator.stop().await;
    if let Some(progress) = progress {
        match progress.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "progress line failed"),
            Err(e) => tracing::warn!(error = %e, "progress task terminated abnormally"),
        }
    }
    let stats = outcome?;
    stopped?;
    Ok(stats)
}
