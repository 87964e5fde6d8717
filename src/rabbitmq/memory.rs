//! In-process broker implementing the broker client traits.
//!
//! Models the parts of RabbitMQ this crate relies on: durable queue
//! declarations with property checks, durable topic exchanges, the default
//! exchange, per-consumer prefetch with round-robin dispatch, ack/nack with
//! requeue, and return of unacknowledged messages when a channel closes.
//! Soft errors (404, 406) close the offending channel as the real broker
//! does. Test hooks simulate an unreachable broker, connection loss,
//! restarts and publisher flow control.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use tracing::debug;

use super::amqp_client::{
    Acker, BrokerChannel, BrokerClient, BrokerConnection, DeliveryStream, LossObserver,
};
use super::errors::{BrokerError, BrokerErrorKind};
use super::topic;
use crate::message::{Delivery, MessageProperties, QueueInfo, QueueOptions};

type Observer = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct State {
    handle: Weak<Mutex<State>>,
    reachable: bool,
    flow_active: bool,
    connect_latency: Duration,
    connect_attempts: usize,
    next_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, Vec<Binding>>,
    // observers to fire once the lock is released
    pending: Vec<(Observer, BrokerError)>,
}

// Entries exist only while open; closing removes them.
struct ConnectionEntry {
    observers: Vec<Observer>,
}

struct ChannelEntry {
    connection: u64,
    prefetch: u16,
    observers: Vec<Observer>,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    message_id: Option<String>,
    persistent: bool,
    expires_at: Option<Instant>,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    consumer_tag: String,
    channel: u64,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    prefetch: u16,
    in_flight: usize,
    sender: UnboundedSender<Result<Delivery, BrokerError>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    fn drop_expired(&mut self) {
        let now = Instant::now();
        self.ready
            .retain(|message| message.expires_at.map_or(true, |at| at > now));
    }
}

fn inequivalent_field(existing: &QueueOptions, requested: &QueueOptions) -> Option<&'static str> {
    if existing.durable != requested.durable {
        Some("durable")
    } else if existing.exclusive != requested.exclusive {
        Some("exclusive")
    } else if existing.auto_delete != requested.auto_delete {
        Some("auto_delete")
    } else {
        None
    }
}

impl State {
    fn new(handle: Weak<Mutex<State>>) -> Self {
        Self {
            handle,
            reachable: true,
            flow_active: true,
            connect_latency: Duration::ZERO,
            connect_attempts: 0,
            next_id: 0,
            next_delivery_tag: 0,
            connections: HashMap::new(),
            channels: HashMap::new(),
            queues: HashMap::new(),
            exchanges: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, channel: u64) -> Result<(), BrokerError> {
        match self.channels.get(&channel) {
            Some(_) => Ok(()),
            None => Err(BrokerError::new(
                BrokerErrorKind::ChannelClosed,
                format!("channel {channel} is closed"),
            )),
        }
    }

    /// Closes `channel` with a soft error and returns that error.
    fn soft_error(&mut self, channel: u64, kind: BrokerErrorKind, message: String) -> BrokerError {
        let error = BrokerError::new(kind, message);
        self.close_channel(channel, Some(error.clone()));
        error
    }

    fn close_channel(&mut self, channel: u64, reason: Option<BrokerError>) {
        let Some(entry) = self.channels.remove(&channel) else {
            return;
        };
        if let Some(error) = reason {
            for observer in &entry.observers {
                self.pending.push((observer.clone(), error.clone()));
            }
        }
        self.release_consumers(channel);
    }

    fn close_connection(&mut self, connection: u64, reason: Option<BrokerError>) {
        let Some(entry) = self.connections.remove(&connection) else {
            return;
        };
        if let Some(error) = &reason {
            for observer in &entry.observers {
                self.pending.push((observer.clone(), error.clone()));
            }
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel, reason.clone());
        }
    }

    /// Drops the consumers of a closed channel and returns their
    /// unacknowledged messages to the head of their queues.
    fn release_consumers(&mut self, channel: u64) {
        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let had_consumers = !queue.consumers.is_empty();
            queue.consumers.retain(|consumer| consumer.channel != channel);

            let mut returned: Vec<(u64, StoredMessage)> = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.channel == channel)
                .map(|(tag, unacked)| (*tag, unacked.message.clone()))
                .collect();
            queue.unacked.retain(|_, unacked| unacked.channel != channel);
            returned.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }

            if had_consumers && queue.consumers.is_empty() && queue.options.auto_delete {
                emptied.push(name.clone());
            }
        }

        for name in emptied {
            debug!(queue = %name, "Auto-deleting queue after last consumer left");
            self.remove_queue(&name);
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn remove_queue(&mut self, name: &str) -> Option<QueueState> {
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|binding| binding.queue != name);
        }
        self.queues.remove(name)
    }

    /// Pushes ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        queue.drop_expired();

        loop {
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                break;
            }
            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let slot = &mut queue.consumers[index];
            let delivery = Delivery::new(
                message.body.clone(),
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.message_id.clone(),
                tag,
                Arc::new(MemoryAcker {
                    state: self.handle.clone(),
                    queue: name.to_owned(),
                    tag,
                    channel: slot.channel,
                }),
            );

            if slot.sender.unbounded_send(Ok(delivery)).is_err() {
                // the consumer's stream was dropped
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            slot.in_flight += 1;
            let consumer_tag = slot.tag.clone();
            let channel = slot.channel;
            queue.unacked.insert(
                tag,
                Unacked {
                    message,
                    consumer_tag,
                    channel,
                },
            );
            queue.next_consumer = (index + 1) % count;
        }
    }

    fn settle(
        &mut self,
        queue_name: &str,
        tag: u64,
        channel: u64,
        requeue: Option<bool>,
    ) -> Result<(), BrokerError> {
        self.ensure_open(channel)?;
        let unknown_tag = || {
            BrokerError::new(
                BrokerErrorKind::PreconditionFailed,
                format!("PRECONDITION_FAILED - unknown delivery tag {tag}"),
            )
        };
        let queue = self.queues.get_mut(queue_name).ok_or_else(unknown_tag)?;
        let unacked = queue.unacked.remove(&tag).ok_or_else(unknown_tag)?;

        if let Some(slot) = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer_tag && c.channel == channel)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        if requeue == Some(true) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        self.dispatch(queue_name);
        Ok(())
    }

    fn queue_info(&mut self, name: &str) -> Option<QueueInfo> {
        let queue = self.queues.get_mut(name)?;
        queue.drop_expired();
        Some(QueueInfo {
            queue: name.to_owned(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    fn missing_queue(&mut self, channel: u64, name: &str) -> BrokerError {
        self.soft_error(
            channel,
            BrokerErrorKind::NotFound,
            format!("NOT_FOUND - no queue '{name}' in vhost '/'"),
        )
    }

    fn declare_queue(
        &mut self,
        channel: u64,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, BrokerError> {
        self.ensure_open(channel)?;
        let mismatch = self
            .queues
            .get(name)
            .map(|queue| inequivalent_field(&queue.options, options));

        match mismatch {
            Some(Some(field)) => {
                return Err(self.soft_error(
                    channel,
                    BrokerErrorKind::PreconditionFailed,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg '{field}' for queue '{name}' in vhost '/'"
                    ),
                ));
            }
            Some(None) => {}
            None => {
                debug!(queue = %name, "Creating queue");
                self.queues
                    .insert(name.to_owned(), QueueState::new(options.clone()));
            }
        }

        self.queue_info(name)
            .ok_or_else(|| self.missing_queue(channel, name))
    }

    fn inspect_queue(&mut self, channel: u64, name: &str) -> Result<QueueInfo, BrokerError> {
        self.ensure_open(channel)?;
        match self.queue_info(name) {
            Some(info) => Ok(info),
            None => Err(self.missing_queue(channel, name)),
        }
    }

    fn bind_queue(
        &mut self,
        channel: u64,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open(channel)?;
        if !self.queues.contains_key(queue) {
            return Err(self.missing_queue(channel, queue));
        }
        let Some(bindings) = self.exchanges.get_mut(exchange) else {
            return Err(self.soft_error(
                channel,
                BrokerErrorKind::NotFound,
                format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'"),
            ));
        };

        let binding = Binding {
            queue: queue.to_owned(),
            pattern: pattern.to_owned(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    fn publish(
        &mut self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<bool, BrokerError> {
        self.ensure_open(channel)?;

        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let Some(bindings) = self.exchanges.get(exchange) else {
                return Err(self.soft_error(
                    channel,
                    BrokerErrorKind::NotFound,
                    format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'"),
                ));
            };
            let mut targets: Vec<String> = bindings
                .iter()
                .filter(|binding| topic::matches(&binding.pattern, routing_key))
                .map(|binding| binding.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "Unroutable message dropped");
        }

        let message = StoredMessage {
            body: payload.to_vec(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message_id: Some(properties.message_id.clone()),
            persistent: properties.persistent,
            expires_at: properties
                .expiration
                .map(|millis| Instant::now() + Duration::from_millis(millis)),
            redelivered: false,
        };
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(&name);
        }

        Ok(self.flow_active)
    }

    fn consume(
        &mut self,
        channel: u64,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open(channel)?;
        let prefetch = self.channels.get(&channel).map_or(0, |entry| entry.prefetch);
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Err(self.missing_queue(channel, queue_name));
        };

        let (sender, receiver) = mpsc::unbounded();
        queue.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_owned(),
            channel,
            prefetch,
            in_flight: 0,
            sender,
        });
        self.dispatch(queue_name);
        Ok(receiver.boxed())
    }

    fn delete_queue(&mut self, channel: u64, name: &str) -> Result<u32, BrokerError> {
        self.ensure_open(channel)?;
        Ok(self
            .remove_queue(name)
            .map_or(0, |queue| queue.ready.len() as u32))
    }

    fn purge_queue(&mut self, channel: u64, name: &str) -> Result<u32, BrokerError> {
        self.ensure_open(channel)?;
        let Some(queue) = self.queues.get_mut(name) else {
            return Err(self.missing_queue(channel, name));
        };
        let purged = queue.ready.len() as u32;
        queue.ready.clear();
        Ok(purged)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new_cyclic(|handle| Mutex::new(State::new(handle.clone()))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the broker lock, then fires any loss observers it queued.
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let (result, pending) = {
            let mut state = self.lock();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.pending))
        };
        for (observer, error) in pending {
            observer(error);
        }
        result
    }

    /// Number of connection attempts made, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// When unreachable, every connection attempt is refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Delay applied to every connection attempt.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.lock().connect_latency = latency;
    }

    /// With flow inactive publishes are still queued but report back-pressure.
    pub fn set_flow(&self, active: bool) {
        self.lock().flow_active = active;
    }

    /// Severs every open connection, as a network failure would.
    pub fn drop_connections(&self) {
        self.with_state(|state| {
            let open: Vec<u64> = state.connections.keys().copied().collect();
            for id in open {
                state.close_connection(
                    id,
                    Some(BrokerError::new(
                        BrokerErrorKind::ConnectionClosed,
                        "connection reset by peer",
                    )),
                );
            }
        });
    }

    /// Drops all connections, then everything that does not survive a
    /// restart: non-durable queues and transient messages.
    pub fn restart(&self) {
        self.drop_connections();
        self.with_state(|state| {
            state.queues.retain(|_, queue| queue.options.durable);
            for queue in state.queues.values_mut() {
                queue.ready.retain(|message| message.persistent);
            }
            let queues: Vec<String> = state.queues.keys().cloned().collect();
            for bindings in state.exchanges.values_mut() {
                bindings.retain(|binding| queues.contains(&binding.queue));
            }
        });
    }

    /// Ready (undelivered) messages in a queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.with_state(|state| state.queue_info(name).map(|info| info.message_count as usize))
    }

    /// Delivered but not yet acknowledged messages in a queue.
    pub fn unacked_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|queue| queue.unacked.len())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let latency = self.with_state(|state| {
            state.connect_attempts += 1;
            state.connect_latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let id = self.with_state(|state| {
            if !state.reachable {
                return Err(BrokerError::new(
                    BrokerErrorKind::Unreachable,
                    "connection refused",
                ));
            }
            let id = state.next_id();
            state.connections.insert(
                id,
                ConnectionEntry {
                    observers: Vec::new(),
                },
            );
            Ok(id)
        })?;

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let id = self.broker.with_state(|state| {
            if !state.connections.contains_key(&self.id) {
                return Err(BrokerError::new(
                    BrokerErrorKind::ConnectionClosed,
                    "connection is closed",
                ));
            }
            let id = state.next_id();
            state.channels.insert(
                id,
                ChannelEntry {
                    connection: self.id,
                    prefetch: 0,
                    observers: Vec::new(),
                },
            );
            Ok(id)
        })?;

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn on_loss(&self, observer: LossObserver) {
        if let Some(entry) = self.broker.lock().connections.get_mut(&self.id) {
            entry.observers.push(Arc::from(observer));
        }
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.with_state(|state| {
            if !state.connections.contains_key(&self.id) {
                return Err(BrokerError::new(
                    BrokerErrorKind::ConnectionClosed,
                    "connection is already closed",
                ));
            }
            state.close_connection(self.id, None);
            Ok(())
        })
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.broker.with_state(|state| {
            state.ensure_open(self.id)?;
            if let Some(entry) = state.channels.get_mut(&self.id) {
                entry.prefetch = count;
            }
            Ok(())
        })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, BrokerError> {
        self.broker
            .with_state(|state| state.declare_queue(self.id, name, options))
    }

    async fn inspect_queue(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        self.broker
            .with_state(|state| state.inspect_queue(self.id, name))
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.broker.with_state(|state| {
            state.ensure_open(self.id)?;
            state.exchanges.entry(name.to_owned()).or_default();
            Ok(())
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.broker
            .with_state(|state| state.bind_queue(self.id, queue, exchange, routing_key))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<bool, BrokerError> {
        self.broker.with_state(|state| {
            state.publish(self.id, exchange, routing_key, payload, properties)
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.broker
            .with_state(|state| state.consume(self.id, queue, consumer_tag))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError> {
        self.broker
            .with_state(|state| state.delete_queue(self.id, name))
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, BrokerError> {
        self.broker
            .with_state(|state| state.purge_queue(self.id, name))
    }

    fn on_loss(&self, observer: LossObserver) {
        if let Some(entry) = self.broker.lock().channels.get_mut(&self.id) {
            entry.observers.push(Arc::from(observer));
        }
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.with_state(|state| {
            state.ensure_open(self.id)?;
            state.close_channel(self.id, None);
            Ok(())
        })
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    tag: u64,
    channel: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let Some(state) = self.state.upgrade() else {
            return Err(BrokerError::new(
                BrokerErrorKind::ConnectionClosed,
                "broker is gone",
            ));
        };
        MemoryBroker { state }
            .with_state(|state| state.settle(&self.queue, self.tag, self.channel, requeue))
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PublishOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("amqp://test").await.unwrap();
        connection.create_channel().await.unwrap()
    }

    fn props() -> MessageProperties {
        PublishOptions::default().to_properties()
    }

    #[tokio::test]
    async fn declaring_with_other_properties_closes_the_channel() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        let durable = QueueOptions::default();

        channel.declare_queue("orders", &durable).await.unwrap();
        channel.declare_queue("orders", &durable).await.unwrap();

        let transient = QueueOptions {
            durable: false,
            ..QueueOptions::default()
        };
        let err = channel.declare_queue("orders", &transient).await.unwrap_err();
        assert_eq!(err.kind(), BrokerErrorKind::PreconditionFailed);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn topic_exchange_routes_by_pattern() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        for queue in ["single", "multi"] {
            channel
                .declare_queue(queue, &QueueOptions::default())
                .await
                .unwrap();
        }
        channel.declare_exchange("orders").await.unwrap();
        channel.bind_queue("single", "orders", "orders.*").await.unwrap();
        channel.bind_queue("multi", "orders", "orders.#").await.unwrap();

        for key in ["orders.created", "payments.created", "orders.created.europe"] {
            channel.publish("orders", key, b"{}", &props()).await.unwrap();
        }

        assert_eq!(broker.queue_depth("single"), Some(1));
        assert_eq!(broker.queue_depth("multi"), Some(2));
    }

    #[tokio::test]
    async fn prefetch_limits_unacknowledged_deliveries() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.set_prefetch(1).await.unwrap();
        channel
            .declare_queue("work", &QueueOptions::default())
            .await
            .unwrap();
        for n in 0..3 {
            let body = format!("{n}");
            channel.publish("", "work", body.as_bytes(), &props()).await.unwrap();
        }

        let mut stream = channel.consume("work", "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"0");
        assert_eq!(broker.unacked_count("work"), Some(1));
        assert_eq!(broker.queue_depth("work"), Some(2));

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"1");
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_at_the_head() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.set_prefetch(1).await.unwrap();
        channel
            .declare_queue("work", &QueueOptions::default())
            .await
            .unwrap();
        channel.publish("", "work", b"a", &props()).await.unwrap();
        channel.publish("", "work", b"b", &props()).await.unwrap();

        let mut stream = channel.consume("work", "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.nack(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
        again.nack(false).await.unwrap();

        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.body, b"b");
        assert!(!next.redelivered);
    }

    #[tokio::test]
    async fn closing_a_channel_returns_unacked_messages() {
        let broker = MemoryBroker::new();
        let consumer_channel = channel(&broker).await;
        consumer_channel
            .declare_queue("work", &QueueOptions::default())
            .await
            .unwrap();
        consumer_channel
            .publish("", "work", b"x", &props())
            .await
            .unwrap();

        let mut stream = consumer_channel.consume("work", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("work"), Some(0));

        consumer_channel.close().await.unwrap();
        assert_eq!(broker.queue_depth("work"), Some(1));
        assert!(stream.next().await.is_none());
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn dropping_connections_notifies_observers() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://test").await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        let losses = Arc::new(AtomicUsize::new(0));
        let counter = losses.clone();
        connection.on_loss(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = losses.clone();
        channel.on_loss(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        broker.drop_connections();
        assert_eq!(losses.load(Ordering::SeqCst), 2);
        assert!(!connection.is_open());
        assert!(!channel.is_open());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn closed_handles_are_forgotten() {
        let broker = MemoryBroker::new();
        for _ in 0..5 {
            let connection = broker.connect("amqp://test").await.unwrap();
            connection.create_channel().await.unwrap();
            connection.create_channel().await.unwrap();
            broker.drop_connections();
        }
        let connection = broker.connect("amqp://test").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.close().await.unwrap();
        connection.close().await.unwrap();

        let state = broker.lock();
        assert!(state.connections.is_empty());
        assert!(state.channels.is_empty());
    }

    #[tokio::test]
    async fn restart_keeps_durable_queues_and_persistent_messages() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue("durable", &QueueOptions::default())
            .await
            .unwrap();
        channel
            .declare_queue(
                "scratch",
                &QueueOptions {
                    durable: false,
                    ..QueueOptions::default()
                },
            )
            .await
            .unwrap();
        channel.publish("", "durable", b"keep", &props()).await.unwrap();
        channel
            .publish(
                "",
                "durable",
                b"lose",
                &PublishOptions::transient().to_properties(),
            )
            .await
            .unwrap();

        broker.restart();

        assert_eq!(broker.queue_depth("durable"), Some(1));
        assert_eq!(broker.queue_depth("scratch"), None);
    }

    #[tokio::test]
    async fn expired_messages_are_not_delivered() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue("ttl", &QueueOptions::default())
            .await
            .unwrap();
        let expiring = PublishOptions::default().with_expiration(10).to_properties();
        channel.publish("", "ttl", b"old", &expiring).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.queue_depth("ttl"), Some(0));
    }
}
