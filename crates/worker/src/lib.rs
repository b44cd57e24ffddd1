//! Render result ingestion worker.
//!
//! Consumes completion messages from the results queue, correlates each one
//! with its render job, stores the artifact and marks the job completed.
//! A separate retention task purges results older than the retention
//! window.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod ingest;
pub mod metrics;
pub mod publish;
pub mod reconnect;
pub mod retention;

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

/// An interval ticker that drops ticks missed while its owner was busy
/// instead of firing them back to back.
pub(crate) fn skipping_interval(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
