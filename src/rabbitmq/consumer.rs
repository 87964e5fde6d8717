// src/rabbitmq/consumer.rs

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::amqp_client::DeliveryStream;
use super::errors::QueueError;
use crate::message::Delivery;

/// What to do with a delivery that could not be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return it to the head of the queue for redelivery.
    Requeue,
    /// Drop it, or dead-letter it when the queue is configured to.
    Reject,
}

/// Decides the fate of deliveries whose decode or callback failed.
pub trait FailurePolicy: Send + Sync {
    fn on_failure(&self, delivery: &Delivery, error: &QueueError) -> Disposition;

    /// Called after a delivery was processed successfully.
    fn on_success(&self, _delivery: &Delivery) {}
}

/// Requeues every failed delivery, forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRequeue;

impl FailurePolicy for AlwaysRequeue {
    fn on_failure(&self, _delivery: &Delivery, _error: &QueueError) -> Disposition {
        Disposition::Requeue
    }
}

/// Rejects a message once it has failed `max_failures` times.
///
/// Failures are counted per message id. Messages without an id cannot be
/// tracked and are always requeued.
#[derive(Debug, Default)]
pub struct MaxRedeliveries {
    max_failures: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl MaxRedeliveries {
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn failures_for(&self, message_id: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }
}

impl FailurePolicy for MaxRedeliveries {
    fn on_failure(&self, delivery: &Delivery, _error: &QueueError) -> Disposition {
        let Some(id) = delivery.message_id.as_deref() else {
            return Disposition::Requeue;
        };

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.max_failures {
            failures.remove(id);
            Disposition::Reject
        } else {
            Disposition::Requeue
        }
    }

    fn on_success(&self, delivery: &Delivery) {
        if let Some(id) = delivery.message_id.as_deref() {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id);
        }
    }
}

/// Deliveries from one consumer on one queue.
///
/// Every item must be settled with [`Delivery::ack`] or [`Delivery::nack`].
/// The stream ends when the consumer's channel goes away; dropping it
/// stops local processing only.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    deliveries: DeliveryStream,
}

impl Subscription {
    pub(crate) fn new(queue: String, consumer_tag: String, deliveries: DeliveryStream) -> Self {
        Self {
            queue,
            consumer_tag,
            deliveries,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.deliveries.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(delivery))) => return Poll::Ready(Some(delivery)),
                Poll::Ready(Some(Err(e))) => {
                    warn!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Error receiving message: {}", e);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Drives `subscription` on a background task, decoding each delivery as
/// `T` and handing it to `callback`.
///
/// Success acks the delivery. A decode error, a callback error or a panic
/// in the callback is handed to `policy`, and the delivery is nacked
/// accordingly. The loop only ends with the subscription.
pub(crate) fn spawn_consumer<T, F, Fut>(
    mut subscription: Subscription,
    callback: F,
    policy: Arc<dyn FailurePolicy>,
) -> JoinHandle<()>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        info!(queue = %subscription.queue, consumer_tag = %subscription.consumer_tag, "Started consuming");
        while let Some(delivery) = subscription.next().await {
            process_delivery(&delivery, &callback, policy.as_ref()).await;
            // a requeued message can be redelivered without any I/O in between
            tokio::task::yield_now().await;
        }
        info!(queue = %subscription.queue, consumer_tag = %subscription.consumer_tag, "Consumer stopped");
    })
}

async fn process_delivery<T, F, Fut>(delivery: &Delivery, callback: &F, policy: &dyn FailurePolicy)
where
    T: DeserializeOwned,
    F: Fn(T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let outcome = match delivery.json::<T>() {
        Ok(message) => {
            let handled = AssertUnwindSafe(async { callback(message).await })
                .catch_unwind()
                .await;
            match handled {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(QueueError::ConsumerCallback(format!("{e:#}"))),
                Err(_) => Err(QueueError::ConsumerCallback(
                    "callback panicked".to_string(),
                )),
            }
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            policy.on_success(delivery);
            if let Err(e) = delivery.ack().await {
                error!("Failed to acknowledge message: {}", e);
            } else {
                debug!(delivery_tag = delivery.delivery_tag, "Message acknowledged");
            }
        }
        Err(err) => {
            let disposition = policy.on_failure(delivery, &err);
            warn!(
                routing_key = %delivery.routing_key,
                redelivered = delivery.redelivered,
                ?disposition,
                "Error processing message: {}",
                err
            );
            if let Err(e) = delivery.nack(disposition == Disposition::Requeue).await {
                error!("Failed to negatively acknowledge message: {}", e);
            }
        }
    }
}
