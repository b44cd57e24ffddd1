//! Render request publishing.
//!
//! The intake side hands each render request to the renderers by
//! publishing it, unchanged, on the requests queue. Requests are persistent
//! so they survive a broker restart.

use std::sync::Arc;

use crate::broker::{Broker, BrokerError, REQUESTS_QUEUE};

pub struct RenderRequestPublisher {
    broker: Arc<dyn Broker>,
    queue: String,
}

impl RenderRequestPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_queue(broker, REQUESTS_QUEUE)
    }

    pub fn with_queue(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Forward a raw render request body.
    pub async fn publish(&self, request: &[u8]) -> Result<(), BrokerError> {
        self.broker.publish(&self.queue, request).await?;
        tracing::info!(queue = %self.queue, bytes = request.len(), "Published render request");
        Ok(())
    }

    /// Serialize `request` as JSON and publish it.
    pub async fn publish_json<T: serde::Serialize + Sync>(
        &self,
        request: &T,
    ) -> Result<(), BrokerError> {
        let body =
            serde_json::to_vec(request).map_err(|e| BrokerError::Publish(e.to_string()))?;
        self.publish(&body).await
    }
}
