//! Shared harness for the worker integration tests.
//!
//! Wires a [`ResultConsumer`] to the in-memory broker, job store and
//! artifact store, with delays shortened so reconnect and requeue paths run
//! in milliseconds.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use territorium_core::artifact::{ArtifactStore, MemoryArtifactStore};
use territorium_db::store::{JobStore, MemoryJobStore};
use territorium_worker::broker::{Broker, MemoryBroker, RESULTS_QUEUE};
use territorium_worker::consumer::{ConsumerError, ConsumerSettings, ResultConsumer};
use territorium_worker::ingest::ResultIngestor;
use territorium_worker::metrics::IngestMetrics;
use territorium_worker::reconnect::ReconnectConfig;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn fast_settings() -> ConsumerSettings {
    ConsumerSettings {
        queue: RESULTS_QUEUE.to_string(),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_attempts: 5,
        },
        requeue_delay: Duration::from_millis(5),
        metrics_log_interval: Duration::from_secs(60),
    }
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub jobs: Arc<MemoryJobStore>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub metrics: Arc<IngestMetrics>,
    pub cancel: CancellationToken,
    settings: ConsumerSettings,
    handle: Option<JoinHandle<Result<(), ConsumerError>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: ConsumerSettings) -> Self {
        Self {
            broker: MemoryBroker::new(),
            jobs: Arc::new(MemoryJobStore::new()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            metrics: Arc::new(IngestMetrics::default()),
            cancel: CancellationToken::new(),
            settings,
            handle: None,
        }
    }

    /// Spawn the consumer against the harness stores.
    pub fn start(&mut self) {
        let jobs: Arc<dyn JobStore> = self.jobs.clone();
        self.start_with_jobs(jobs);
    }

    /// Spawn the consumer against a custom job store.
    pub fn start_with_jobs(&mut self, jobs: Arc<dyn JobStore>) {
        let artifacts: Arc<dyn ArtifactStore> = self.artifacts.clone();
        self.start_with_stores(jobs, artifacts);
    }

    /// Spawn the consumer against custom stores.
    pub fn start_with_stores(&mut self, jobs: Arc<dyn JobStore>, artifacts: Arc<dyn ArtifactStore>) {
        let broker: Arc<dyn Broker> = Arc::new(self.broker.clone());
        let consumer = ResultConsumer::new(
            broker,
            ResultIngestor::new(jobs, artifacts),
            self.settings.clone(),
            Arc::clone(&self.metrics),
        );
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move { consumer.run(cancel).await }));
    }

    pub async fn deliver(&self, message: serde_json::Value) {
        let body = serde_json::to_vec(&message).unwrap();
        self.deliver_raw(&body).await;
    }

    pub async fn deliver_raw(&self, body: &[u8]) {
        self.broker.publish(RESULTS_QUEUE, body).await.unwrap();
    }

    /// Wait until the results queue is empty with nothing in flight.
    pub async fn drain(&self) {
        assert!(
            self.broker.wait_until_drained(RESULTS_QUEUE, TIMEOUT).await,
            "results queue did not drain: ready={} unacked={}",
            self.broker.ready_count(RESULTS_QUEUE),
            self.broker.unacked_count(RESULTS_QUEUE),
        );
    }

    /// Cancel the consumer and return how it ended.
    pub async fn stop(mut self) -> Result<(), ConsumerError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the consumer to end on its own.
    pub async fn join(&mut self) -> Result<(), ConsumerError> {
        let handle = self.handle.take().expect("consumer was started");
        tokio::time::timeout(TIMEOUT, handle)
            .await
            .expect("consumer stopped in time")
            .expect("consumer task did not panic")
    }
}

/// Poll `condition` until it holds or `TIMEOUT` elapses.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
