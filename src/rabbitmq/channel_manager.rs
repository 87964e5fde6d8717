use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::amqp_client::{BrokerChannel, BrokerConnection};
use super::errors::{BrokerError, QueueError};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to open channel: {0}")]
    OpenFailed(#[source] BrokerError),

    #[error("Failed to configure channel: {0}")]
    ConfigurationFailed(String),
}

impl From<ChannelError> for QueueError {
    fn from(error: ChannelError) -> Self {
        QueueError::ChannelUnavailable(error.to_string())
    }
}

/// Configuration options for the managed channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages a consumer may hold (0 means unlimited)
    pub prefetch_count: u16,

    /// Channel identifier for logging (defaults to a short UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn with_prefetch(prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            ..Self::default()
        }
    }
}

/// Opens a channel on `connection` and applies QoS from `config`.
pub(crate) async fn open_channel(
    connection: &dyn BrokerConnection,
    config: &ChannelConfig,
) -> Result<Arc<dyn BrokerChannel>, ChannelError> {
    debug!(channel_id = %config.id, "Creating new channel");
    let channel = connection
        .create_channel()
        .await
        .map_err(ChannelError::OpenFailed)?;

    if config.prefetch_count > 0 {
        debug!("Setting channel QoS to {}", config.prefetch_count);
        channel
            .set_prefetch(config.prefetch_count)
            .await
            .map_err(|e| ChannelError::ConfigurationFailed(format!("Failed to set QoS: {}", e)))?;
    }

    info!(
        channel_id = %config.id,
        prefetch = config.prefetch_count,
        "Channel created and configured"
    );
    Ok(channel)
}
