//! Error types for each layer of the engine.
//!
//! Library code returns these typed errors; the CLI wraps them in
//! [`anyhow::Error`] at the binary boundary.
use std::time::Duration;

use thiserror::Error;

use crate::script::{CloneId, Hook};

/// Errors raised while compiling a script or calling into it.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script failed to parse or its top level threw.
    #[error("failed to compile `{name}`:\n{message}")]
    Compile {
        /// Name of the script, usually its path.
        name: String,
        /// Engine error message.
        message: String,
    },

    /// A global with a lifecycle hook name exists but is not callable.
    #[error("{hook} should be a function, but found: {found}")]
    InvalidHook {
        /// The hook that was looked up.
        hook: Hook,
        /// The type found instead.
        found: String,
    },

    /// The hook threw.
    #[error("{0}")]
    Exception(String),

    /// The engine itself failed (allocation, context creation, ...).
    #[error("script runtime error: {0}")]
    Runtime(String),

    /// Hook data could not be converted between the engine and JSON.
    #[error("hook data is not representable as JSON: {0}")]
    Data(#[from] serde_json::Error),
}

/// Errors raised by a [`Record`](crate::Record).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The duration was requested before both timestamps were set.
    #[error("`{record_type}` record has no {missing} timestamp")]
    InvalidState {
        /// The record type tag.
        record_type: &'static str,
        /// Which timestamp is missing: `start` or `end`.
        missing: &'static str,
    },
}

/// Errors raised when forwarding records to the aggregator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecorderError {
    /// The aggregator has been stopped; nothing can be recorded anymore.
    #[error("aggregator queue is closed")]
    QueueClosed,

    /// The record is not terminal yet.
    #[error("record is not complete: {0}")]
    InvalidRecord(#[from] RecordError),

    /// The queue is full and blocking would stall a current-thread runtime.
    #[error("aggregator queue is full and the current runtime cannot block")]
    WouldBlock,

    /// `success()` or `fail()` was called on an already classified result.
    #[error("result has already been classified")]
    AlreadySealed,
}

/// Errors raised by the `http` built-in before any network call is made.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The options object could not be read.
    #[error("invalid `http` options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    /// `url` is missing or empty.
    #[error("`http[url]` cannot be empty")]
    EmptyUrl,

    /// `url` could not be parsed.
    #[error("`http[url]` should be a valid url: {url}: {reason}")]
    InvalidUrl {
        /// The url as given by the script.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// `url` is not an http(s) url.
    #[error("`http[url]` has unsupported scheme `{0}`")]
    UnsupportedScheme(String),

    /// `method` is not a valid http method.
    #[error("`http[method]` should be a valid http method: {0}")]
    InvalidMethod(String),

    /// A header name or value is invalid.
    #[error("`http[headers]` contains an invalid header `{name}`: {reason}")]
    InvalidHeader {
        /// The header name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The http client could not be built.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Fatal errors of a lifecycle run.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Invalid options or a script without `run()`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The script failed to compile.
    #[error(transparent)]
    Compile(ScriptError),

    /// An execution clone could not be created.
    #[error("failed to create execution context for {id}: {source}")]
    Instantiate {
        /// The clone being created.
        id: CloneId,
        /// The engine error.
        #[source]
        source: ScriptError,
    },

    /// `before_all()` or `after_all()` failed.
    #[error("{hook}() failed: {source}")]
    Hook {
        /// The failing hook.
        hook: Hook,
        /// The script error.
        #[source]
        source: ScriptError,
    },

    /// `run()` failed; this cancels every virtual user.
    #[error("run() failed in vu-{worker}: {source}")]
    Run {
        /// The virtual user that failed first.
        worker: u32,
        /// The script error.
        #[source]
        source: ScriptError,
    },

    /// A virtual user thread could not be started.
    #[error("failed to start vu-{worker}: {source}")]
    Spawn {
        /// The virtual user.
        worker: u32,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },

    /// A virtual user thread exited without reporting, which means it panicked.
    #[error("vu-{worker} terminated abnormally")]
    Aborted {
        /// The virtual user.
        worker: u32,
    },

    /// A task or blocking thread of the run panicked or was aborted.
    #[error("virtual user terminated abnormally: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Errors raised by the aggregator.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// A latency does not fit into the histogram.
    #[error("latency too large to record: {latency:?}")]
    LatencyTooLarge {
        /// The rejected latency.
        latency: Duration,
    },

    /// The histogram rejected a value.
    #[error("failed to record latency: {0}")]
    HistogramRecord(#[from] hdrhistogram::RecordError),

    /// The consumer task panicked.
    #[error("aggregator consumer terminated abnormally: {0}")]
    Consumer(#[from] tokio::task::JoinError),
}
