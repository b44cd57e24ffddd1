//! In-process broker with AMQP-like delivery semantics.
//!
//! Honors the prefetch limit, keeps unacknowledged deliveries out of the
//! ready queue, and puts them back (flagged redelivered) when they are
//! rejected or when the "connection" drops. Connection faults can be
//! injected with [`MemoryBroker::fail_next_connects`],
//! [`MemoryBroker::drop_next_sessions`] and [`MemoryBroker::disconnect`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Broker, BrokerError, Delivery, Subscription};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    /// Bumped on every disconnect; subscriptions and deliveries from an
    /// older epoch are dead.
    epoch: u64,
    failing_connects: u32,
    /// Subscriptions still to be handed out already closed.
    dropping_sessions: u32,
    connects: u32,
    closes: u32,
    next_tag: u64,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
}

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.shared)
    }

    /// Make the next `n` subscribe attempts fail with a connection error.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().failing_connects = n;
    }

    /// Make the next `n` subscribe attempts succeed with a subscription that
    /// is closed before its first delivery.
    pub fn drop_next_sessions(&self, n: u32) {
        self.state().dropping_sessions = n;
    }

    /// Subscriptions closed by their owner so far.
    pub fn close_count(&self) -> u32 {
        self.state().closes
    }

    /// Successful subscribe calls so far.
    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    /// Drop every open subscription. Unacknowledged deliveries go back to
    /// the front of their queue flagged as redelivered.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.epoch += 1;
        for queue in state.queues.values_mut() {
            let mut returned: Vec<(u64, Message)> = queue.unacked.drain().collect();
            returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, mut message) in returned {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting to be delivered on `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered on `queue` but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Poll until `queue` has nothing ready and nothing in flight.
    ///
    /// Returns `false` if that does not happen within `timeout`.
    pub async fn wait_until_drained(&self, queue: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.ready_count(queue) == 0 && self.unacked_count(queue) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Remove and return everything ready on `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared
        .state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut state = self.state();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Connection("connection refused".into()));
        }
        state.connects += 1;
        state.queues.entry(queue.to_string()).or_default();

        let dropped = state.dropping_sessions > 0;
        if dropped {
            state.dropping_sessions -= 1;
        }

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            prefetch: usize::from(prefetch.max(1)),
            epoch: state.epoch,
            dropped,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                body: body.to_vec(),
                redelivered: false,
            });
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    prefetch: usize,
    epoch: u64,
    dropped: bool,
    in_flight: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        if self.dropped {
            return None;
        }
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.shared);
                if state.epoch != self.epoch {
                    return None;
                }
                if self.in_flight.load(Ordering::SeqCst) < self.prefetch {
                    let tag = state.next_tag;
                    let queue = state.queues.entry(self.queue.clone()).or_default();
                    if let Some(message) = queue.ready.pop_front() {
                        queue.unacked.insert(tag, message.clone());
                        state.next_tag += 1;
                        self.in_flight.fetch_add(1, Ordering::SeqCst);
                        return Some(Ok(Box::new(MemoryDelivery {
                            shared: Arc::clone(&self.shared),
                            queue: self.queue.clone(),
                            epoch: self.epoch,
                            tag,
                            message,
                            in_flight: Arc::clone(&self.in_flight),
                        })));
                    }
                }
            }

            notified.await;
        }
    }

    async fn close(self: Box<Self>) {
        lock(&self.shared).closes += 1;
    }
}

struct MemoryDelivery {
    shared: Arc<Shared>,
    queue: String,
    epoch: u64,
    tag: u64,
    message: Message,
    in_flight: Arc<AtomicUsize>,
}

impl MemoryDelivery {
    /// Take this delivery out of the unacked set. Fails if the channel it
    /// arrived on has since been closed.
    fn settle(&self, requeue: bool) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        if state.epoch != self.epoch {
            return Err(BrokerError::Ack("channel closed".into()));
        }
        let queue = state.queues.entry(self.queue.clone()).or_default();
        let message = queue
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", self.tag)))?;
        if requeue {
            queue.ready.push_front(Message {
                redelivered: true,
                ..message
            });
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn requeue(self: Box<Self>) -> Result<(), BrokerError> {
        self.settle(true)
    }
}
