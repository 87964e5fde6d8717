use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rabbitmq::amqp_client::Acker;
use crate::rabbitmq::errors::{QueueError, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Properties used when asserting a queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Per-message delivery options for a publish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublishOptions {
    /// Delivery mode 2 when set, so the message survives a broker restart.
    pub persistent: bool,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    pub priority: Option<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            expiration: None,
            priority: None,
            content_type: None,
            message_id: None,
        }
    }
}

impl PublishOptions {
    pub fn transient() -> Self {
        Self {
            persistent: false,
            ..Self::default()
        }
    }

    pub fn with_expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Resolves the options into the concrete properties sent with a message.
    pub fn to_properties(&self) -> MessageProperties {
        MessageProperties {
            persistent: self.persistent,
            expiration: self.expiration,
            priority: self.priority,
            content_type: self
                .content_type
                .clone()
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_string()),
            message_id: self
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Fully resolved message properties handed to a broker backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub expiration: Option<u64>,
    pub priority: Option<u8>,
    pub content_type: String,
    pub message_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

/// Options for registering a consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Properties used to assert the queue before consuming.
    pub queue: QueueOptions,
    /// Defaults to `consumer-<uuid>`.
    pub consumer_tag: Option<String>,
}

impl ConsumeOptions {
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

/// Depth and consumer count of a queue as reported by the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message received from a queue, carrying its own ack/nack handle.
///
/// A delivery must be settled exactly once; until then it counts against
/// the consumer's prefetch window.
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub delivery_tag: u64,
    acker: Arc<dyn Acker>,
    settled: AtomicBool,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        message_id: Option<String>,
        delivery_tag: u64,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            body,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            message_id,
            delivery_tag,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Positive acknowledgment: the broker removes the message.
    pub async fn ack(&self) -> Result<()> {
        self.mark_settled()?;
        self.acker.ack().await.map_err(QueueError::from)
    }

    /// Negative acknowledgment. With `requeue` the message goes back to the
    /// head of its queue for redelivery; without it the broker drops it.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.mark_settled()?;
        self.acker.nack(requeue).await.map_err(QueueError::from)
    }

    fn mark_settled(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(QueueError::InvalidArgument(format!(
                "delivery {} was already acknowledged",
                self.delivery_tag
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("delivery_tag", &self.delivery_tag)
            .field("bytes", &self.body.len())
            .finish()
    }
}
