//! RabbitMQ broker over AMQP 0-9-1.
//!
//! Each [`AmqpBroker::subscribe`] call opens its own connection and channel;
//! [`Subscription::close`] shuts both down. Publishing opens a
//! short-lived connection per message, which is fine at render-request
//! volumes.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};

use super::{Broker, BrokerError, Delivery, Subscription};

/// AMQP `delivery-mode` value marking a message persistent.
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn connect(&self) -> Result<(Connection, Channel), BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok((connection, channel))
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let (connection, channel) = self.connect().await?;
        declare_queue(&channel, queue).await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        let consumer_tag = format!("territorium-worker-{}", uuid::Uuid::new_v4());
        // `no_ack` stays false: every delivery is acknowledged explicitly.
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        tracing::debug!(queue, prefetch, consumer_tag, "AMQP consumer registered");

        Ok(Box::new(AmqpSubscription {
            connection,
            channel,
            consumer,
        }))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let (connection, channel) = self.connect().await?;
        declare_queue(&channel, queue).await?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        if let Err(e) = connection.close(200, "OK").await {
            tracing::debug!(error = %e, "AMQP connection close after publish failed");
        }
        Ok(())
    }
}

struct AmqpSubscription {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        match self.consumer.next().await? {
            Ok(delivery) => Some(Ok(Box::new(AmqpDelivery { inner: delivery }))),
            Err(e) => Some(Err(BrokerError::Channel(e.to_string()))),
        }
    }

    async fn close(self: Box<Self>) {
        // Either may already be gone after a broker-side failure.
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "OK").await {
                tracing::debug!(error = %e, "AMQP channel close failed");
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "OK").await {
                tracing::debug!(error = %e, "AMQP connection close failed");
            }
        }
    }
}

struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn requeue(self: Box<Self>) -> Result<(), BrokerError> {
        self.inner
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
