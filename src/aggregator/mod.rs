//! Single-consumer metrics aggregation.
//!
//! [`Aggregator::start`] spawns exactly one consumer task that owns the
//! [`AggregateCounters`]. Producers only hold a [`Recorder`] and send
//! records through a bounded queue, so the counters need no lock. Live
//! observers get periodic copies through a `watch` channel.
mod counters;

pub use counters::AggregateCounters;

use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{error::AggregatorError, record::Record, recorder::Recorder, snapshot::ResultSnapshot};

/// Default capacity of the record queue.
pub const QUEUE_CAPACITY: usize = 100;

/// Options for the aggregator.
#[derive(Clone, Debug)]
pub struct AggregatorOpts {
    /// Capacity of the record queue; producers block when it is full.
    pub capacity: usize,

    /// Number of distinct failure reasons kept before folding into `"other"`.
    pub max_failure_reasons: usize,

    /// How often live observers receive a fresh copy of the counters.
    pub publish_interval: Duration,
}

impl Default for AggregatorOpts {
    fn default() -> Self {
        Self { capacity: QUEUE_CAPACITY, max_failure_reasons: 64, publish_interval: Duration::from_secs(1) }
    }
}

/// The metrics aggregator.
pub struct Aggregator {
    tx: mpsc::Sender<Record>,
    shutdown: CancellationToken,
    consumer: Option<JoinHandle<AggregateCounters>>,
    live: watch::Receiver<AggregateCounters>,
}

impl Aggregator {
    /// Starts the consumer task. Must be called within a tokio runtime.
    pub fn start(opts: AggregatorOpts) -> Self {
        let (tx, rx) = mpsc::channel(opts.capacity.max(1));
        let counters = AggregateCounters::new(opts.max_failure_reasons);
        let (live_tx, live) = watch::channel(counters.clone());
        let shutdown = CancellationToken::new();

        let consumer = tokio::spawn(consume(rx, counters, live_tx, shutdown.clone(), opts.publish_interval));

        Self { tx, shutdown, consumer: Some(consumer), live }
    }

    /// A producer handle for the record queue.
    pub fn recorder(&self) -> Recorder {
        Recorder::new(self.tx.clone())
    }

    /// Closes the queue and waits until every queued record has been folded.
    ///
    /// Records whose `record` call returned `Ok` before this returns are all
    /// counted exactly once; later calls fail with
    /// [`RecorderError::QueueClosed`](crate::error::RecorderError::QueueClosed).
    pub async fn stop(&mut self) -> Result<(), AggregatorError> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };
        self.shutdown.cancel();
        consumer.await?;
        Ok(())
    }

    /// Returns true once [`Aggregator::stop`] has completed.
    pub fn is_stopped(&self) -> bool {
        self.consumer.is_none()
    }

    /// Snapshot of the latest counters.
    ///
    /// Exact once [`Aggregator::stop`] has returned; before that it reflects
    /// the last periodic publication and may lag behind.
    pub fn result(&self) -> ResultSnapshot {
        ResultSnapshot::from_counters(&self.live.borrow())
    }

    /// Subscribes to the periodic counter publications.
    pub fn subscribe(&self) -> watch::Receiver<AggregateCounters> {
        self.live.clone()
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Record>,
    mut counters: AggregateCounters,
    live: watch::Sender<AggregateCounters>,
    shutdown: CancellationToken,
    publish_interval: Duration,
) -> AggregateCounters {
    let mut ticker = tokio::time::interval(publish_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            r = rx.recv() => match r {
                Some(record) => counters += &record,
                None => break,
            },
            _ = ticker.tick() => {
                live.send_replace(counters.clone());
            }
        }
    }

    // refuse new records, then drain whatever made it into the queue
    rx.close();
    while let Some(record) = rx.recv().await {
        counters += &record;
    }

    counters.stop();
    tracing::debug!(total = counters.total_requests, "aggregator drained");
    live.send_replace(counters.clone());
    counters
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::error::RecorderError;

    fn finished(ms: u64, success: bool) -> Record {
        let mut record = Record::new("http");
        let start = Instant::now();
        record.set_span(start, start + Duration::from_millis(ms));
        if success {
            record.success();
        } else {
            record.failed("status 500");
        }
        record
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_record_is_lost_or_double_counted() {
        let mut aggregator = Aggregator::start(AggregatorOpts::default());

        let producers = (0..8)
            .map(|p| {
                let recorder = aggregator.recorder();
                tokio::task::spawn_blocking(move || {
                    for i in 0..125 {
                        recorder.record(finished(1, (p + i) % 2 == 0)).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for producer in producers {
            producer.await.unwrap();
        }

        aggregator.stop().await.unwrap();
        let result = aggregator.result();
        assert_eq!(result.total_requests, 1000);
        assert_eq!(result.total_success + result.total_failed, 1000);
        assert_eq!(result.failure_reasons.get("status 500"), Some(&result.total_failed));
    }

    #[tokio::test]
    async fn zero_records() {
        let mut aggregator = Aggregator::start(AggregatorOpts::default());
        aggregator.stop().await.unwrap();

        let result = aggregator.result();
        assert_eq!(result.total_requests, 0);
        assert_eq!(result.average_latency_ms, 0);
        assert_eq!(result.rps, 0.0);
    }

    #[tokio::test]
    async fn average_latency_is_floor_of_mean() {
        let mut aggregator = Aggregator::start(AggregatorOpts::default());
        let recorder = aggregator.recorder();
        for (ms, success) in [(3, true), (4, true), (4, false), (7, true)] {
            recorder.send(finished(ms, success)).await.unwrap();
        }

        aggregator.stop().await.unwrap();
        let result = aggregator.result();
        assert_eq!(result.total_requests, 4);
        assert_eq!(result.total_success, 3);
        assert_eq!(result.total_request_time_ms, 18);
        assert_eq!(result.average_latency_ms, 4);
        assert_eq!(result.average_success_latency_ms, 4);
        assert_eq!(result.average_failed_latency_ms, 4);
    }

    #[tokio::test]
    async fn record_after_stop_is_rejected() {
        let mut aggregator = Aggregator::start(AggregatorOpts::default());
        let recorder = aggregator.recorder();
        aggregator.stop().await.unwrap();

        assert!(aggregator.is_stopped());
        assert_eq!(recorder.send(finished(1, true)).await, Err(RecorderError::QueueClosed));

        let blocking = tokio::task::spawn_blocking(move || recorder.record(finished(1, true)));
        assert_eq!(blocking.await.unwrap(), Err(RecorderError::QueueClosed));

        // stopping twice is harmless
        aggregator.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_applies_backpressure() {
        let opts = AggregatorOpts { capacity: 1, ..Default::default() };
        let mut aggregator = Aggregator::start(opts);
        let recorder = aggregator.recorder();

        let producer = tokio::task::spawn_blocking(move || {
            for _ in 0..50 {
                recorder.record(finished(1, true)).unwrap();
            }
        });
        producer.await.unwrap();

        aggregator.stop().await.unwrap();
        assert_eq!(aggregator.result().total_requests, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn live_view_is_published_periodically() {
        let opts = AggregatorOpts { publish_interval: Duration::from_millis(100), ..Default::default() };
        let mut aggregator = Aggregator::start(opts);
        let mut live = aggregator.subscribe();
        let recorder = aggregator.recorder();

        recorder.send(finished(1, true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        live.changed().await.unwrap();
        assert_eq!(live.borrow_and_update().total_requests, 1);

        aggregator.stop().await.unwrap();
    }
}
