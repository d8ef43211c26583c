//! The execution record: one measured unit of work inside a hook call.
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use serde_json::Value;

use crate::error::RecordError;

/// Reason used for requests that timed out before a response was read.
pub const TIMEOUT: &str = "timeout";
/// Reason used for transport failures other than timeouts.
pub const TRANSPORT_ERROR: &str = "error";
/// Reason used once the distinct failure reason cap is reached.
pub const OTHER: &str = "other";
/// Reason used when `fail()` is called without a reason.
pub const NO_REASON: &str = "<no reason>";

/// Terminal classification of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Not classified yet.
    #[default]
    Unset,
    /// Classified as a success.
    Success,
    /// Classified as a failure with the given reason.
    Failed(String),
}

/// One measured unit of work, e.g. a single HTTP call.
///
/// A record is mutable until it is handed to
/// [`Recorder::record`](crate::Recorder::record), which takes it by value.
#[derive(Debug, Clone)]
pub struct Record {
    record_type: &'static str,
    start: Option<Instant>,
    end: Option<Instant>,
    outcome: Outcome,
    data: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record of the given type.
    pub fn new(record_type: &'static str) -> Self {
        Self { record_type, start: None, end: None, outcome: Outcome::Unset, data: BTreeMap::new() }
    }

    /// Stamps the start time with the current instant.
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Stamps the end time with the current instant.
    pub fn end(&mut self) {
        self.end = Some(Instant::now());
    }

    /// Sets both timestamps explicitly.
    pub fn set_span(&mut self, start: Instant, end: Instant) {
        self.start = Some(start);
        self.end = Some(end);
    }

    /// Tags the record with a caller supplied value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Removes a tag.
    pub fn del(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Removes all tags.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Returns a tag value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Classifies the record as a success.
    pub fn success(&mut self) {
        self.outcome = Outcome::Success;
    }

    /// Classifies the record as a failure.
    pub fn failed(&mut self, reason: impl Into<String>) {
        self.outcome = Outcome::Failed(reason.into());
    }

    /// The record type tag.
    pub fn record_type(&self) -> &'static str {
        self.record_type
    }

    /// The current classification.
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Time between start and end.
    ///
    /// Only valid once both timestamps are set.
    pub fn duration(&self) -> Result<Duration, RecordError> {
        let missing = |missing| RecordError::InvalidState { record_type: self.record_type, missing };
        let start = self.start.ok_or_else(|| missing("start"))?;
        let end = self.end.ok_or_else(|| missing("end"))?;
        Ok(end.saturating_duration_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_requires_both_timestamps() {
        let mut record = Record::new("http");
        assert_eq!(
            record.duration(),
            Err(RecordError::InvalidState { record_type: "http", missing: "start" })
        );

        record.start();
        assert_eq!(
            record.duration(),
            Err(RecordError::InvalidState { record_type: "http", missing: "end" })
        );

        record.end();
        assert!(record.duration().is_ok());
    }

    #[test]
    fn duration_of_explicit_span() {
        let start = Instant::now();
        let mut record = Record::new("http");
        record.set_span(start, start + Duration::from_millis(42));
        assert_eq!(record.duration().unwrap(), Duration::from_millis(42));
    }

    #[test]
    fn outcome_follows_last_classification() {
        let mut record = Record::new("http");
        assert_eq!(record.outcome(), &Outcome::Unset);

        record.failed(TIMEOUT);
        assert_eq!(record.outcome(), &Outcome::Failed(TIMEOUT.into()));

        record.success();
        assert_eq!(record.outcome(), &Outcome::Success);
    }

    #[test]
    fn tags() {
        let mut record = Record::new("http");
        record.set("url", "http://localhost/");
        record.set("attempt", 2);
        assert_eq!(record.get("attempt"), Some(&Value::from(2)));

        record.del("attempt");
        assert_eq!(record.get("attempt"), None);
        assert!(record.get("url").is_some());

        record.clear();
        assert_eq!(record.get("url"), None);
    }
}
