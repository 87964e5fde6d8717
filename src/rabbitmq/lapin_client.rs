// src/rabbitmq/lapin_client.rs
// lapin-backed implementation of the broker client traits

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::*,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};

use super::amqp_client::{
    Acker, BrokerChannel, BrokerClient, BrokerConnection, DeliveryStream, LossObserver,
};
use super::errors::{BrokerError, BrokerErrorKind};
use crate::message::{Delivery, MessageProperties, QueueInfo, QueueOptions};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ with lapin.
#[derive(Clone, Default)]
pub struct LapinClient {
    properties: ConnectionProperties,
}

impl LapinClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl BrokerClient for LapinClient {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(uri, self.properties.clone())
            .await
            .map_err(|e| BrokerError::new(BrokerErrorKind::Unreachable, e.to_string()))?;

        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    fn on_loss(&self, observer: LossObserver) {
        self.inner
            .on_error(move |error| observer(BrokerError::from(error)));
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "Normal shutdown").await?;
        Ok(())
    }
}

struct LapinChannel {
    inner: Channel,
}

fn queue_info(queue: &lapin::Queue) -> QueueInfo {
    QueueInfo {
        queue: queue.name().to_string(),
        message_count: queue.message_count(),
        consumer_count: queue.consumer_count(),
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(properties.content_type.clone().into())
        .with_message_id(properties.message_id.clone().into())
        .with_timestamp(properties.timestamp.max(0) as u64)
        .with_delivery_mode(if properties.persistent { 2 } else { 1 });

    if let Some(expiration) = properties.expiration {
        props = props.with_expiration(expiration.to_string().into());
    }
    if let Some(priority) = properties.priority {
        props = props.with_priority(priority);
    }
    props
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue_info(&queue))
    }

    async fn inspect_queue(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue_info(&queue))
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<bool, BrokerError> {
        // Without confirm mode the returned confirm resolves immediately;
        // a successful write into lapin's frame buffer counts as accepted.
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                basic_properties(properties),
            )
            .await?;
        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|result| {
            result.map_err(BrokerError::from).map(|delivery| {
                let message_id = delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.to_string());
                Delivery::new(
                    delivery.data,
                    delivery.exchange.to_string(),
                    delivery.routing_key.to_string(),
                    delivery.redelivered,
                    message_id,
                    delivery.delivery_tag,
                    Arc::new(LapinDeliveryAcker {
                        inner: delivery.acker,
                    }),
                )
            })
        });

        Ok(stream.boxed())
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError> {
        let count = self
            .inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(count)
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, BrokerError> {
        let count = self
            .inner
            .queue_purge(name, QueuePurgeOptions::default())
            .await?;
        Ok(count)
    }

    fn on_loss(&self, observer: LossObserver) {
        self.inner
            .on_error(move |error| observer(BrokerError::from(error)));
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "Normal shutdown").await?;
        Ok(())
    }
}

struct LapinDeliveryAcker {
    inner: LapinAcker,
}

#[async_trait]
impl Acker for LapinDeliveryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.inner.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_messages_use_delivery_mode_two() {
        let properties = MessageProperties {
            persistent: true,
            expiration: Some(1500),
            priority: Some(3),
            content_type: "application/json".to_string(),
            message_id: "m-1".to_string(),
            timestamp: 1_700_000_000,
        };

        let props = basic_properties(&properties);
        assert_eq!(*props.delivery_mode(), Some(2));
        assert_eq!(props.expiration().as_ref().map(|e| e.as_str()), Some("1500"));
        assert_eq!(*props.priority(), Some(3));
        assert_eq!(props.message_id().as_ref().map(|id| id.as_str()), Some("m-1"));
    }

    #[test]
    fn transient_messages_use_delivery_mode_one() {
        let properties = MessageProperties {
            persistent: false,
            expiration: None,
            priority: None,
            content_type: "text/plain".to_string(),
            message_id: "m-2".to_string(),
            timestamp: 0,
        };

        let props = basic_properties(&properties);
        assert_eq!(*props.delivery_mode(), Some(1));
        assert!(props.expiration().is_none());
    }
}
