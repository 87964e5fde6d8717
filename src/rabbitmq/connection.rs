use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::amqp_client::{BrokerChannel, BrokerClient, BrokerConnection};
use super::channel_manager::{open_channel, ChannelConfig};
use super::errors::{BrokerError, QueueError, Result};
use crate::env::{redact_url, Config};

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Owns one broker connection and one channel derived from it, and keeps
/// them alive: lost connections are re-established after a fixed delay,
/// forever, until [`ConnectionManager::close`] is called.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    uri: String,
    client: Arc<dyn BrokerClient>,
    channel_config: ChannelConfig,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
}

#[derive(Default)]
struct Inner {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    connecting: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    // Loss observers may run on a broker I/O thread outside the runtime.
    runtime: Option<Handle>,
    shutdown: bool,
    // Bumped whenever the connection or channel is replaced so that
    // observers installed on old handles are ignored.
    connection_epoch: u64,
    channel_epoch: u64,
}

impl ConnectionManager {
    pub fn new(config: &Config, client: Arc<dyn BrokerClient>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            shared: Arc::new(Shared {
                uri: config.amqp_url.clone(),
                client,
                channel_config: ChannelConfig::with_prefetch(config.prefetch_count),
                reconnect_delay: config.reconnect_delay,
                connect_timeout: config.connect_timeout,
                inner: Mutex::new(Inner::default()),
                state,
            }),
        }
    }

    /// Connects unless already connected or a connection attempt is in flight.
    ///
    /// The attempt runs on its own task, so dropping this future (for example
    /// under `tokio::time::timeout`) does not abandon it. A failed attempt
    /// schedules a reconnect and returns the error to this caller only.
    pub async fn connect(&self) -> Result<()> {
        self.start_attempt(true).await
    }

    /// Reconnect path used by the timer; never overrides a `close()`.
    async fn reconnect(&self) -> Result<()> {
        self.start_attempt(false).await
    }

    async fn start_attempt(&self, explicit: bool) -> Result<()> {
        let existing = {
            let mut inner = self.shared.lock();
            inner.prune_dead_handles();

            if inner.connection.is_some() && inner.channel.is_some() {
                return Ok(());
            }
            if inner.connecting {
                debug!("Connection attempt already in flight");
                return Ok(());
            }
            if inner.shutdown && !explicit {
                debug!("Manager closed, skipping reconnect");
                return Ok(());
            }

            inner.connecting = true;
            inner.shutdown = false;
            if inner.runtime.is_none() {
                inner.runtime = Handle::try_current().ok();
            }
            self.shared.state.send_replace(ConnectionState::Connecting);
            inner.connection.clone()
        };

        let manager = self.clone();
        let attempt = tokio::spawn(async move {
            let guard = AttemptGuard {
                shared: manager.shared.clone(),
            };
            let result = manager.run_attempt(existing).await;
            drop(guard);
            result
        });

        match attempt.await {
            Ok(result) => result,
            Err(e) => Err(QueueError::Connection(format!(
                "connection attempt aborted: {e}"
            ))),
        }
    }

    async fn run_attempt(&self, existing: Option<Arc<dyn BrokerConnection>>) -> Result<()> {
        match self.establish(existing).await {
            Ok(()) => Ok(()),
            Err(err) => {
                {
                    let mut inner = self.shared.lock();
                    inner.connecting = false;
                    if !inner.shutdown {
                        self.shared.state.send_replace(ConnectionState::Disconnected);
                    }
                }
                error!(error = %err, "Failed to connect to RabbitMQ");
                Shared::schedule_reconnect(&self.shared);
                Err(err)
            }
        }
    }

    async fn establish(&self, existing: Option<Arc<dyn BrokerConnection>>) -> Result<()> {
        let connection = match existing {
            Some(connection) => {
                debug!("Connection alive, re-deriving channel");
                connection
            }
            None => {
                info!(
                    "Attempting to connect to RabbitMQ at {}",
                    redact_url(&self.shared.uri)
                );
                let connection = timeout(
                    self.shared.connect_timeout,
                    self.shared.client.connect(&self.shared.uri),
                )
                .await
                .map_err(|_| {
                    QueueError::Timeout(format!(
                        "no connection after {:?}",
                        self.shared.connect_timeout
                    ))
                })?
                .map_err(|e| QueueError::Connection(e.message().to_string()))?;

                let epoch = {
                    let mut inner = self.shared.lock();
                    inner.connection_epoch += 1;
                    inner.connection = Some(connection.clone());
                    inner.connection_epoch
                };
                let weak = Arc::downgrade(&self.shared);
                connection.on_loss(Box::new(move |err| {
                    Shared::on_connection_lost(&weak, epoch, err)
                }));
                connection
            }
        };

        let channel = open_channel(&*connection, &self.shared.channel_config).await?;

        let channel_epoch = {
            let mut inner = self.shared.lock();
            inner.connecting = false;
            if inner.shutdown {
                None
            } else {
                inner.channel_epoch += 1;
                inner.channel = Some(channel.clone());
                self.shared.state.send_replace(ConnectionState::Connected);
                Some(inner.channel_epoch)
            }
        };

        let Some(channel_epoch) = channel_epoch else {
            // close() ran while we were connecting
            let _ = channel.close().await;
            let _ = connection.close().await;
            return Err(QueueError::Connection(
                "connection closed while connecting".to_string(),
            ));
        };

        let weak = Arc::downgrade(&self.shared);
        channel.on_loss(Box::new(move |err| {
            Shared::on_channel_lost(&weak, channel_epoch, err)
        }));

        info!("Successfully connected to RabbitMQ");
        Ok(())
    }

    /// Returns the ready channel, connecting first if there is none.
    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(channel) = self.ready_channel() {
            return Ok(channel);
        }

        self.connect()
            .await
            .map_err(|e| QueueError::ChannelUnavailable(e.to_string()))?;
        self.wait_until_settled().await;

        self.ready_channel().ok_or_else(|| {
            QueueError::ChannelUnavailable("broker connection is not established".to_string())
        })
    }

    fn ready_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut inner = self.shared.lock();
        inner.prune_dead_handles();
        inner.channel.clone()
    }

    async fn wait_until_settled(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await;
    }

    /// Cancels any pending reconnect and closes the channel, then the
    /// connection. Handles that are already gone are not an error.
    pub async fn close(&self) -> Result<()> {
        let (channel, connection, timer) = {
            let mut inner = self.shared.lock();
            inner.shutdown = true;
            inner.connection_epoch += 1;
            inner.channel_epoch += 1;
            self.shared.state.send_replace(ConnectionState::Closing);
            (
                inner.channel.take(),
                inner.connection.take(),
                inner.reconnect_timer.take(),
            )
        };

        if let Some(timer) = timer {
            debug!("Cancelling pending reconnect");
            timer.abort();
        }

        let mut close_error: Option<BrokerError> = None;
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                if !e.is_closed() {
                    warn!(error = %e, "Error closing RabbitMQ channel");
                    close_error.get_or_insert(e);
                }
            }
        }
        if let Some(connection) = connection {
            info!("Closing RabbitMQ connection gracefully");
            if let Err(e) = connection.close().await {
                if !e.is_closed() {
                    warn!(error = %e, "Error closing RabbitMQ connection");
                    close_error.get_or_insert(e);
                }
            }
        }

        {
            let inner = self.shared.lock();
            if inner.shutdown {
                self.shared.state.send_replace(ConnectionState::Disconnected);
            }
        }

        match close_error {
            Some(e) => Err(QueueError::Connection(format!(
                "error during close: {}",
                e.message()
            ))),
            None => Ok(()),
        }
    }

    /// True iff both the connection and the channel handles are present.
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.lock();
        inner.connection.is_some() && inner.channel.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.shared.lock().reconnect_timer.is_some()
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.shared.reconnect_delay
    }
}

/// Clears the in-flight flag if an attempt task ends without settling it,
/// which only happens when it panics or its runtime shuts down.
struct AttemptGuard {
    shared: Arc<Shared>,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if inner.connecting {
            inner.connecting = false;
            self.shared.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

impl Inner {
    fn prune_dead_handles(&mut self) {
        if self.connection.as_ref().is_some_and(|c| !c.is_open()) {
            self.connection = None;
            self.channel = None;
        }
        if self.channel.as_ref().is_some_and(|c| !c.is_open()) {
            self.channel = None;
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_connection_lost(weak: &Weak<Shared>, epoch: u64, err: BrokerError) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        {
            let mut inner = shared.lock();
            if inner.connection_epoch != epoch || inner.connection.is_none() {
                return;
            }
            warn!(error = %err, "RabbitMQ connection lost");
            inner.connection = None;
            inner.channel = None;
            if inner.shutdown {
                return;
            }
            if !inner.connecting {
                shared.state.send_replace(ConnectionState::Disconnected);
            }
        }
        Shared::schedule_reconnect(&shared);
    }

    fn on_channel_lost(weak: &Weak<Shared>, epoch: u64, err: BrokerError) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        if inner.channel_epoch != epoch || inner.channel.is_none() {
            return;
        }
        warn!(error = %err, "RabbitMQ channel closed");
        inner.channel = None;
        if !inner.connecting && !inner.shutdown {
            shared.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Schedules one reconnect attempt unless one is already pending or the
    /// manager was closed.
    fn schedule_reconnect(shared: &Arc<Shared>) {
        let mut inner = shared.lock();
        if inner.shutdown || inner.reconnect_timer.is_some() {
            return;
        }

        let Some(runtime) = Handle::try_current().ok().or_else(|| inner.runtime.clone()) else {
            error!("No async runtime available to schedule a reconnect");
            return;
        };

        let delay = shared.reconnect_delay;
        info!("Waiting {}ms before next reconnect attempt", delay.as_millis());

        let weak = Arc::downgrade(shared);
        inner.reconnect_timer = Some(runtime.spawn(async move {
            sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = shared.lock();
                inner.reconnect_timer = None;
                if inner.shutdown {
                    return;
                }
            }
            let manager = ConnectionManager { shared };
            if let Err(e) = manager.reconnect().await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        }));
    }
}
