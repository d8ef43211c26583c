//! A scriptable HTTP load generator.
//!
//! A JavaScript file defines lifecycle hooks that issue HTTP calls; the engine
//! replays it across concurrent virtual users (VUs) for a fixed duration and
//! aggregates per-request metrics.
//!
//! ## Script
//!
//! ```js
//! function before_all() {
//!     return { token: os.getenv("API_TOKEN") };
//! }
//!
//! function run({ before_all }) {
//!     const res = load.http({
//!         url: "http://localhost:8080/items",
//!         headers: { authorization: `Bearer ${before_all.token}` },
//!     });
//!     if (res.statusCode === 200) {
//!         res.success();
//!     } else {
//!         res.fail(`status ${res.statusCode}`);
//!     }
//! }
//! ```
//!
//! Hooks are `before_all`, `before_each`, `run` (required), `after_each` and
//! `after_all`. Each receives one object holding the results of the hooks that
//! already ran in the current iteration. Responses left unclassified when the
//! hook returns are counted as unclassified.
//!
//! ## Library
//!
//! The orchestrator is engine-agnostic; [`script::NativeProgram`] drives it
//! with Rust closures:
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use loadscript::{Aggregator, AggregatorOpts, RunOptions, orchestrator, script::NativeProgram};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut aggregator = Aggregator::start(AggregatorOpts::default());
//!     let recorder = aggregator.recorder();
//!
//!     let program = NativeProgram::builder()
//!         .run(move |_, _| {
//!             let mut record = recorder.new_record("work");
//!             record.start();
//!             // do the work here
//!             record.end();
//!             record.success();
//!             recorder.record(record).ok();
//!             Ok(None)
//!         })
//!         .build();
//!
//!     let opts = RunOptions { vus: 4, duration: Duration::from_secs(5), ..Default::default() };
//!     orchestrator::run(CancellationToken::new(), Arc::new(program), &opts).await?;
//!
//!     aggregator.stop().await?;
//!     println!("{:?}", aggregator.result());
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

mod duration;
mod histogram;
mod util;

pub mod aggregator;
pub mod cli;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod progress;
pub mod record;
pub mod recorder;
pub mod report;
pub mod reporter;
pub mod script;
pub mod snapshot;

pub use crate::{
    aggregator::{AggregateCounters, Aggregator, AggregatorOpts},
    histogram::LatencyHistogram,
    orchestrator::{LifecycleStats, RunOptions},
    record::{Outcome, Record},
    recorder::{Recorder, ResultHandle},
    report::LoadReport,
    snapshot::ResultSnapshot,
};
