//! Results-queue consumer.
//!
//! [`ResultConsumer::run`] subscribes to the results queue with a prefetch
//! of one, feeds every delivery to the [`ResultIngestor`] and settles it:
//!
//! - stored or dropped: ack;
//! - persistence failure: wait `requeue_delay`, then requeue;
//! - panic inside ingestion: log, count, ack.
//!
//! A failure on one message never stops the loop. When the subscription
//! drops, the consumer reconnects with bounded backoff and only returns an
//! error once reconnection is exhausted. A session that ends without
//! delivering anything counts against the same backoff budget as a failed
//! subscribe.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Delivery, Subscription, RESULTS_QUEUE};
use crate::ingest::{Disposition, IngestOutcome, ResultIngestor};
use crate::metrics::IngestMetrics;
use crate::reconnect::{pause, subscribe_with_backoff, Backoff, ReconnectConfig, ReconnectOutcome};

/// At most one unacknowledged result per consumer. Results carry whole
/// artifacts, so buffering more only costs memory.
pub const PREFETCH: u16 = 1;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub reconnect: ReconnectConfig,
    /// Pause before a message that hit a persistence failure is requeued.
    pub requeue_delay: Duration,
    pub metrics_log_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: RESULTS_QUEUE.to_string(),
            reconnect: ReconnectConfig::default(),
            requeue_delay: Duration::from_secs(1),
            metrics_log_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Gave up reconnecting to broker after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
}

/// How one subscription session ended.
enum SessionEnd {
    Cancelled,
    /// The subscription closed after `delivered` deliveries.
    Disconnected { delivered: u64 },
}

pub struct ResultConsumer {
    broker: Arc<dyn Broker>,
    ingestor: ResultIngestor,
    settings: ConsumerSettings,
    metrics: Arc<IngestMetrics>,
}

impl ResultConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        ingestor: ResultIngestor,
        settings: ConsumerSettings,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            broker,
            ingestor,
            settings,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// Consume until `cancel` fires or reconnection is exhausted.
    ///
    /// Cancellation is observed between messages; a message already being
    /// ingested is settled first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let queue = self.settings.queue.as_str();
        tracing::info!(queue, prefetch = PREFETCH, "Result consumer started");

        let mut backoff = Backoff::new(self.settings.reconnect.clone());
        let result = loop {
            let mut subscription = match subscribe_with_backoff(
                self.broker.as_ref(),
                queue,
                PREFETCH,
                &mut backoff,
                &cancel,
            )
            .await
            {
                ReconnectOutcome::Connected(subscription) => subscription,
                ReconnectOutcome::Cancelled => break Ok(()),
                ReconnectOutcome::Exhausted {
                    attempts,
                    last_error,
                } => break Err(self.give_up(attempts, last_error)),
            };

            tracing::info!(queue, "Consuming render results");

            let started = Instant::now();
            let end = self.consume(subscription.as_mut(), &cancel).await;
            subscription.close().await;

            let delivered = match end {
                SessionEnd::Cancelled => break Ok(()),
                SessionEnd::Disconnected { delivered } => delivered,
            };
            self.metrics.record_reconnect();

            // A session that did work, or stayed up longer than the longest
            // backoff step, is healthy.
            if delivered > 0 || started.elapsed() >= self.settings.reconnect.max_delay {
                backoff.reset();
                tracing::warn!(queue, delivered, "Broker subscription lost, reconnecting");
                continue;
            }

            let Some(delay) = backoff.fail() else {
                break Err(self.give_up(
                    backoff.failures(),
                    "subscription closed before any delivery".to_string(),
                ));
            };
            tracing::warn!(
                queue,
                attempt = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "Broker subscription closed immediately, backing off",
            );
            if !pause(delay, &cancel).await {
                break Ok(());
            }
        };

        self.metrics.log_snapshot();
        tracing::info!(queue, "Result consumer stopped");
        result
    }

    fn give_up(&self, attempts: u32, last_error: String) -> ConsumerError {
        tracing::error!(
            queue = self.settings.queue.as_str(),
            attempts,
            error = %last_error,
            "Broker unreachable, consumer stopping",
        );
        ConsumerError::ReconnectExhausted {
            attempts,
            last_error,
        }
    }

    async fn consume(
        &self,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut ticker = crate::skipping_interval(self.settings.metrics_log_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut delivered = 0u64;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = ticker.tick() => {
                    self.metrics.log_snapshot();
                    continue;
                }
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    delivered += 1;
                    self.handle(delivery).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Broker delivery error");
                    return SessionEnd::Disconnected { delivered };
                }
                None => return SessionEnd::Disconnected { delivered },
            }
        }
    }

    /// Ingest one delivery and settle it with the broker.
    async fn handle(&self, delivery: Box<dyn Delivery>) {
        let redelivered = delivery.redelivered();
        let result = AssertUnwindSafe(self.ingestor.ingest(delivery.body()))
            .catch_unwind()
            .await;

        let disposition = match result {
            Ok(result) => {
                let disposition = Disposition::for_result(&result);
                match result {
                    Ok(outcome) => {
                        self.metrics.record_outcome(&outcome);
                        if let IngestOutcome::Dropped { reason, job_id } = &outcome {
                            tracing::debug!(%reason, ?job_id, redelivered, "Result dropped");
                        }
                    }
                    Err(e) => {
                        self.metrics.record_persistence_failure();
                        tracing::error!(
                            job_id = e.job_id(),
                            redelivered,
                            error = %e,
                            "Failed to persist render result",
                        );
                    }
                }
                disposition
            }
            Err(panic) => {
                self.metrics.record_panic();
                tracing::error!(
                    redelivered,
                    panic = panic_message(panic.as_ref()),
                    "Result ingestion panicked, discarding message",
                );
                Disposition::Ack
            }
        };

        let settled = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue => {
                tokio::time::sleep(self.settings.requeue_delay).await;
                delivery.requeue().await
            }
        };

        // The broker redelivers anything we fail to settle once the channel
        // is gone.
        if let Err(e) = settled {
            tracing::warn!(?disposition, error = %e, "Failed to settle delivery");
        }
    }
}

/// Run `consumer` on its own task, restarting it if the task panics.
///
/// Returns when the consumer stops on its own: cleanly after `cancel`, or
/// with [`ConsumerError::ReconnectExhausted`].
pub async fn supervise(
    consumer: Arc<ResultConsumer>,
    cancel: CancellationToken,
) -> Result<(), ConsumerError> {
    loop {
        let task = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            let cancel = cancel.clone();
            async move { consumer.run(cancel).await }
        });

        match task.await {
            Ok(result) => return result,
            Err(e) if e.is_panic() => {
                consumer.metrics.record_panic();
                tracing::error!(error = %e, "Result consumer task panicked, restarting");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Result consumer task aborted");
                return Ok(());
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(consumer.settings.reconnect.initial_delay) => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
