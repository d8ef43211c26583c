//! Producer side of the aggregation pipeline.
//!
//! A [`Recorder`] is a cheap, cloneable handle on the aggregator's bounded
//! queue. Every virtual user holds one; none of them ever touch the counters.
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::mpsc::{self, error::TrySendError},
};

use crate::{error::RecorderError, record::Record};

/// Handle used by built-ins to forward terminal records to the aggregator.
#[derive(Debug, Clone)]
pub struct Recorder {
    tx: mpsc::Sender<Record>,
}

impl Recorder {
    pub(crate) fn new(tx: mpsc::Sender<Record>) -> Self {
        Self { tx }
    }

    /// Creates a new, empty record.
    pub fn new_record(&self, record_type: &'static str) -> Record {
        Record::new(record_type)
    }

    /// Enqueues a terminal record, blocking while the queue is full.
    ///
    /// Meant for synchronous contexts such as a virtual user thread; use
    /// [`Recorder::send`] from async code. On a multi-thread runtime a full
    /// queue blocks in place. On a current-thread runtime, where blocking
    /// would stall the consumer, a full queue is reported as
    /// [`RecorderError::WouldBlock`].
    pub fn record(&self, record: Record) -> Result<(), RecorderError> {
        record.duration()?;
        let record = match self.tx.try_send(record) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(RecorderError::QueueClosed),
            Err(TrySendError::Full(record)) => record,
        };

        let send = || self.tx.blocking_send(record).map_err(|_| RecorderError::QueueClosed);
        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Err(_) => send(),
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(send),
            Ok(_) => Err(RecorderError::WouldBlock),
        }
    }

    /// Enqueues a terminal record, waiting while the queue is full.
    pub async fn send(&self, record: Record) -> Result<(), RecorderError> {
        record.duration()?;
        self.tx.send(record).await.map_err(|_| RecorderError::QueueClosed)
    }

    /// Returns true once the aggregator no longer accepts records.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A finished record waiting for the script to classify it.
///
/// Every method consumes the handle, so a result can be sealed only once.
#[derive(Debug)]
#[must_use = "a result handle must be sealed or submitted to be counted"]
pub struct ResultHandle {
    record: Record,
    recorder: Recorder,
}

impl ResultHandle {
    /// Pairs a finished record with the recorder it will be sent to.
    pub fn new(record: Record, recorder: Recorder) -> Self {
        Self { record, recorder }
    }

    /// The pending record.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Classifies the record as a success and forwards it.
    pub fn success(mut self) -> Result<(), RecorderError> {
        self.record.success();
        self.submit()
    }

    /// Classifies the record as a failure and forwards it.
    pub fn fail(mut self, reason: impl Into<String>) -> Result<(), RecorderError> {
        self.record.failed(reason);
        self.submit()
    }

    /// Forwards the record with whatever outcome it currently has.
    pub fn submit(self) -> Result<(), RecorderError> {
        self.recorder.record(self.record)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::record::Outcome;

    fn finished() -> Record {
        let mut record = Record::new("http");
        let start = Instant::now();
        record.set_span(start, start + Duration::from_millis(5));
        record
    }

    #[test]
    fn rejects_incomplete_records() {
        let (tx, _rx) = mpsc::channel(1);
        let recorder = Recorder::new(tx);

        let mut record = recorder.new_record("http");
        record.start();
        assert!(matches!(recorder.record(record), Err(RecorderError::InvalidRecord(_))));
    }

    #[test]
    fn closed_queue_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        let recorder = Recorder::new(tx);
        drop(rx);

        assert!(recorder.is_closed());
        assert_eq!(recorder.record(finished()), Err(RecorderError::QueueClosed));
    }

    #[test]
    fn sealing_forwards_the_outcome() {
        let (tx, mut rx) = mpsc::channel(4);
        let recorder = Recorder::new(tx);

        ResultHandle::new(finished(), recorder.clone()).success().unwrap();
        ResultHandle::new(finished(), recorder.clone()).fail("bad status").unwrap();
        ResultHandle::new(finished(), recorder).submit().unwrap();

        assert_eq!(rx.try_recv().unwrap().outcome(), &Outcome::Success);
        assert_eq!(rx.try_recv().unwrap().outcome(), &Outcome::Failed("bad status".into()));
        assert_eq!(rx.try_recv().unwrap().outcome(), &Outcome::Unset);
    }

    #[tokio::test]
    async fn record_from_async_context_does_not_panic() {
        let (tx, mut rx) = mpsc::channel(1);
        let recorder = Recorder::new(tx);

        recorder.record(finished()).unwrap();
        assert_eq!(recorder.record(finished()), Err(RecorderError::WouldBlock));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn record_blocks_in_place_on_multi_thread_runtime() {
        let (tx, mut rx) = mpsc::channel(1);
        let recorder = Recorder::new(tx);
        let consumer = tokio::spawn(async move {
            let mut received = 0;
            while rx.recv().await.is_some() {
                received += 1;
            }
            received
        });

        for _ in 0..5 {
            recorder.record(finished()).unwrap();
        }
        drop(recorder);
        assert_eq!(consumer.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn async_send() {
        let (tx, mut rx) = mpsc::channel(1);
        let recorder = Recorder::new(tx);
        recorder.send(finished()).await.unwrap();
        assert!(rx.recv().await.is_some());
    }
}
