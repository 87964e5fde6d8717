//! Request and response types for the broker control surface, and the
//! operations behind them. An HTTP layer maps its routes onto
//! [`ControlSurface`] one to one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::message::{PublishOptions, QueueInfo, QueueOptions};
use crate::rabbitmq::{QueueError, QueueService, Result};

/// Publish either to `queue`, or to `exchange` with `routing_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    pub message: Value,
    #[serde(default)]
    pub options: PublishOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateQueueRequest {
    pub queue: String,
    #[serde(default)]
    pub options: QueueOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

pub type BindResponse = BindRequest;

/// `{ queue, messageCount, consumerCount }`
pub type QueueInfoResponse = QueueInfo;

/// Result of a delete or purge: how many messages were removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCountResponse {
    pub queue: String,
    pub message_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub connected: bool,
}

/// HTTP status an adapter should answer with for `error`.
pub fn status_code(error: &QueueError) -> u16 {
    match error {
        QueueError::InvalidArgument(_) | QueueError::Serialization(_) => 400,
        QueueError::QueueNotFound(_) => 404,
        QueueError::QueueDeclaration(_) => 409,
        QueueError::Connection(_)
        | QueueError::ChannelUnavailable(_)
        | QueueError::Publish(_)
        | QueueError::Timeout(_) => 503,
        QueueError::ConsumerCallback(_) | QueueError::Broker(_) => 500,
    }
}

#[derive(Clone)]
pub struct ControlSurface {
    service: QueueService,
}

impl ControlSurface {
    pub fn new(service: QueueService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &QueueService {
        &self.service
    }

    /// A queue target wins over an exchange target when both are given.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishResponse> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let published = match (
            non_empty(&request.queue),
            non_empty(&request.exchange),
            non_empty(&request.routing_key),
        ) {
            (Some(queue), _, _) => {
                self.service
                    .publish_to_queue(&queue, &request.message, &request.options)
                    .await?
            }
            (None, Some(exchange), Some(routing_key)) => {
                self.service
                    .publish_to_exchange(&exchange, &routing_key, &request.message, &request.options)
                    .await?
            }
            _ => {
                return Err(QueueError::InvalidArgument(
                    "either queue or exchange and routingKey are required".to_string(),
                ))
            }
        };

        Ok(PublishResponse { published })
    }

    pub async fn create_queue(&self, request: CreateQueueRequest) -> Result<QueueInfoResponse> {
        let info = self
            .service
            .assert_queue(&request.queue, &request.options)
            .await?;
        info!(queue = %request.queue, "Queue created");
        Ok(info)
    }

    pub async fn bind(&self, request: BindRequest) -> Result<BindResponse> {
        self.service
            .bind_queue(&request.queue, &request.exchange, &request.routing_key)
            .await?;
        Ok(request)
    }

    pub async fn get_queue_info(&self, queue: &str) -> Result<QueueInfoResponse> {
        self.service.get_queue_info(queue).await
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<QueueCountResponse> {
        let message_count = self.service.delete_queue(queue).await?;
        Ok(QueueCountResponse {
            queue: queue.to_string(),
            message_count,
        })
    }

    pub async fn purge_queue(&self, queue: &str) -> Result<QueueCountResponse> {
        let message_count = self.service.purge_queue(queue).await?;
        Ok(QueueCountResponse {
            queue: queue.to_string(),
            message_count,
        })
    }

    pub fn health(&self) -> HealthResponse {
        let connected = self.service.is_connected();
        HealthResponse {
            status: if connected {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            connected,
        }
    }
}
