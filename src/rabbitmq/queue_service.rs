// src/rabbitmq/queue_service.rs
// Queue-level operations on top of the managed connection

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::amqp_client::BrokerChannel;
use super::connection::ConnectionManager;
use super::consumer::{spawn_consumer, AlwaysRequeue, FailurePolicy, Subscription};
use super::errors::{BrokerErrorKind, QueueError, Result};
use crate::message::{ConsumeOptions, PublishOptions, QueueInfo, QueueOptions};

/// Declares, publishes to, consumes from and inspects queues.
///
/// Every operation fetches the channel from the [`ConnectionManager`] at
/// call time, so a service outlives any number of reconnects.
///
/// Publish and bind re-assert their queue with the properties it was last
/// asserted or consumed with through this service, durable by default.
#[derive(Clone)]
pub struct QueueService {
    connection: ConnectionManager,
    failure_policy: Arc<dyn FailurePolicy>,
    declared: Arc<Mutex<HashMap<String, QueueOptions>>>,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(QueueError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

impl QueueService {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            failure_policy: Arc::new(AlwaysRequeue),
            declared: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replaces the policy applied to deliveries that fail in
    /// [`QueueService::consume_from_queue`].
    pub fn with_failure_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.failure_policy = Arc::new(policy);
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    fn queue_options(&self, queue: &str) -> QueueOptions {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    fn remember(&self, queue: &str, options: &QueueOptions) {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string(), options.clone());
    }

    fn forget(&self, queue: &str) {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue);
    }

    async fn publish_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.connection
            .get_channel()
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))
    }

    /// Declares `name`. Re-declaring with the same properties is a no-op;
    /// different properties fail with [`QueueError::QueueDeclaration`].
    #[instrument(skip(self, options))]
    pub async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo> {
        require(name, "queue name")?;
        let channel = self.connection.get_channel().await?;
        let info = channel.declare_queue(name, options).await?;
        self.remember(name, options);
        debug!(
            messages = info.message_count,
            consumers = info.consumer_count,
            "Queue asserted"
        );
        Ok(info)
    }

    /// Declares a durable topic exchange.
    #[instrument(skip(self))]
    pub async fn assert_exchange(&self, name: &str) -> Result<()> {
        require(name, "exchange name")?;
        let channel = self.connection.get_channel().await?;
        channel.declare_exchange(name).await?;
        Ok(())
    }

    /// Serializes `message` as JSON and publishes it to `queue` through the
    /// default exchange, asserting the queue first.
    ///
    /// Returns `false` when the broker applied back-pressure; the message was
    /// still handed over.
    pub async fn publish_to_queue<T>(
        &self,
        queue: &str,
        message: &T,
        options: &PublishOptions,
    ) -> Result<bool>
    where
        T: Serialize + ?Sized,
    {
        require(queue, "queue name")?;
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes_to_queue(queue, &payload, options).await
    }

    #[instrument(skip(self, payload, options), fields(bytes = payload.len()))]
    pub async fn publish_bytes_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool> {
        require(queue, "queue name")?;
        let channel = self.publish_channel().await?;
        channel
            .declare_queue(queue, &self.queue_options(queue))
            .await?;

        let accepted = channel
            .publish("", queue, payload, &options.to_properties())
            .await?;
        if !accepted {
            warn!("Broker applied back-pressure to publish");
        }
        Ok(accepted)
    }

    /// Serializes `message` as JSON and publishes it to the topic exchange
    /// `exchange` with `routing_key`, asserting the exchange first.
    pub async fn publish_to_exchange<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: &PublishOptions,
    ) -> Result<bool>
    where
        T: Serialize + ?Sized,
    {
        require(exchange, "exchange")?;
        require(routing_key, "routing key")?;
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes_to_exchange(exchange, routing_key, &payload, options)
            .await
    }

    #[instrument(skip(self, payload, options), fields(bytes = payload.len()))]
    pub async fn publish_bytes_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool> {
        require(exchange, "exchange")?;
        require(routing_key, "routing key")?;
        let channel = self.publish_channel().await?;
        channel.declare_exchange(exchange).await?;

        let accepted = channel
            .publish(exchange, routing_key, payload, &options.to_properties())
            .await?;
        if !accepted {
            warn!("Broker applied back-pressure to publish");
        }
        Ok(accepted)
    }

    /// Binds `queue` to the topic exchange `exchange`, asserting both.
    #[instrument(skip(self))]
    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        require(queue, "queue name")?;
        require(exchange, "exchange")?;
        require(routing_key, "routing key")?;
        let channel = self.connection.get_channel().await?;
        channel
            .declare_queue(queue, &self.queue_options(queue))
            .await?;
        channel.declare_exchange(exchange).await?;
        channel.bind_queue(queue, exchange, routing_key).await?;
        info!("Queue bound to exchange");
        Ok(())
    }

    /// Starts a consumer on `queue` that decodes each message as `T` and
    /// passes it to `callback`, returning the consumer tag.
    ///
    /// Successful callbacks ack; failures are logged and the delivery is
    /// settled according to the failure policy (requeue by default). A
    /// failing callback never stops the consumer.
    pub async fn consume_from_queue<T, F, Fut>(
        &self,
        queue: &str,
        callback: F,
        options: ConsumeOptions,
    ) -> Result<String>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let subscription = self.subscribe(queue, options).await?;
        let consumer_tag = subscription.consumer_tag().to_string();
        spawn_consumer(subscription, callback, self.failure_policy.clone());
        Ok(consumer_tag)
    }

    /// Starts a consumer on `queue` and returns its deliveries as a stream.
    /// The caller settles each delivery.
    #[instrument(skip(self, options))]
    pub async fn subscribe(&self, queue: &str, options: ConsumeOptions) -> Result<Subscription> {
        require(queue, "queue name")?;
        let channel = self.connection.get_channel().await?;
        channel.declare_queue(queue, &options.queue).await?;
        self.remember(queue, &options.queue);

        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));
        let deliveries = channel.consume(queue, &consumer_tag).await?;
        info!(consumer_tag = %consumer_tag, "Consumer registered");
        Ok(Subscription::new(queue.to_string(), consumer_tag, deliveries))
    }

    /// Deletes `queue`, returning the number of messages it held.
    #[instrument(skip(self))]
    pub async fn delete_queue(&self, queue: &str) -> Result<u32> {
        require(queue, "queue name")?;
        let channel = self.connection.get_channel().await?;
        let count = channel.delete_queue(queue).await?;
        self.forget(queue);
        info!(messages = count, "Queue deleted");
        Ok(count)
    }

    /// Removes all ready messages from `queue`, returning how many.
    #[instrument(skip(self))]
    pub async fn purge_queue(&self, queue: &str) -> Result<u32> {
        require(queue, "queue name")?;
        let channel = self.connection.get_channel().await?;
        let count = channel.purge_queue(queue).await?;
        info!(messages = count, "Queue purged");
        Ok(count)
    }

    #[instrument(skip(self))]
    pub async fn get_queue_info(&self, queue: &str) -> Result<QueueInfo> {
        require(queue, "queue name")?;
        let channel = self.connection.get_channel().await?;
        channel.inspect_queue(queue).await.map_err(|e| {
            if e.kind() == BrokerErrorKind::NotFound {
                QueueError::QueueNotFound(queue.to_string())
            } else {
                e.into()
            }
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}
