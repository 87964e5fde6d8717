// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::BrokerError;
use crate::message::{Delivery, MessageProperties, QueueInfo, QueueOptions};

/// Callback fired when a connection or channel goes away unexpectedly.
pub type LossObserver = Box<dyn Fn(BrokerError) + Send + Sync + 'static>;

/// Deliveries pushed by the broker to one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One physical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Registers an observer for asynchronous connection failure.
    fn on_loss(&self, observer: LossObserver);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a [`BrokerConnection`].
///
/// Exchanges declared through this trait are always durable topic exchanges.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, BrokerError>;

    /// Passive declare: reports the queue without creating it.
    async fn inspect_queue(&self, name: &str) -> Result<QueueInfo, BrokerError>;

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Returns `false` when the message was buffered but the broker asked the
    /// publisher to slow down.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<bool, BrokerError>;

    /// Starts a consumer with explicit acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Returns the number of messages deleted with the queue.
    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError>;

    /// Returns the number of messages purged.
    async fn purge_queue(&self, name: &str) -> Result<u32, BrokerError>;

    fn on_loss(&self, observer: LossObserver);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}
