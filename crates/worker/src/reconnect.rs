//! Bounded exponential-backoff subscription to the broker.
//!
//! When the results subscription cannot be opened, or drops mid-stream,
//! the consumer calls [`subscribe_with_backoff`] to keep retrying with
//! increasing delays until the subscription is restored, the attempt budget
//! runs out, or the [`CancellationToken`] is triggered.
//!
//! The [`Backoff`] state outlives a single call: a subscription that opens
//! and then closes without doing any work counts as another failed attempt.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Subscription};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt. The first attempt is immediate.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Consecutive failed attempts after which the consumer gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Backoff state shared by consecutive subscribe attempts and sessions.
///
/// Only [`Backoff::reset`] clears the failure count, so a broker that
/// accepts subscriptions and drops them at once still runs into
/// [`ReconnectConfig::max_attempts`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            delay: config.initial_delay,
            config,
            failures: 0,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
        self.failures = 0;
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once
    /// `max_attempts` consecutive attempts have failed.
    pub fn fail(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            return None;
        }
        let delay = self.delay;
        self.delay = next_delay(delay, &self.config);
        Some(delay)
    }
}

pub enum ReconnectOutcome {
    Connected(Box<dyn Subscription>),
    Cancelled,
    /// Every attempt failed; `last_error` is the final failure.
    Exhausted { attempts: u32, last_error: String },
}

impl std::fmt::Debug for ReconnectOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(_) => f.write_str("Connected"),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Exhausted {
                attempts,
                last_error,
            } => f
                .debug_struct("Exhausted")
                .field("attempts", attempts)
                .field("last_error", last_error)
                .finish(),
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Open a subscription on `queue`, retrying with exponential backoff.
///
/// A successful subscribe does not reset `backoff`; the caller does that
/// once the subscription has proven itself.
pub async fn subscribe_with_backoff(
    broker: &dyn Broker,
    queue: &str,
    prefetch: u16,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> ReconnectOutcome {
    loop {
        let attempt = backoff.failures() + 1;

        let last_error = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(queue, "Subscribe cancelled");
                return ReconnectOutcome::Cancelled;
            }
            result = broker.subscribe(queue, prefetch) => {
                match result {
                    Ok(subscription) => {
                        if attempt > 1 {
                            tracing::info!(queue, attempt, "Reconnected to broker");
                        }
                        return ReconnectOutcome::Connected(subscription);
                    }
                    Err(e) => {
                        tracing::warn!(
                            queue,
                            attempt,
                            max_attempts = backoff.config().max_attempts,
                            error = %e,
                            "Subscribe attempt {attempt} failed",
                        );
                        e.to_string()
                    }
                }
            }
        };

        let Some(delay) = backoff.fail() else {
            return ReconnectOutcome::Exhausted {
                attempts: backoff.failures(),
                last_error,
            };
        };

        tracing::info!(
            queue,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying broker subscribe",
        );

        if !pause(delay, cancel).await {
            return ReconnectOutcome::Cancelled;
        }
    }
}
