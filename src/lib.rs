//! Message-broker client for a marketplace backend: one self-healing
//! RabbitMQ connection and the queue operations built on it.

pub mod control;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use env::Config;
pub use message::{ConsumeOptions, Delivery, PublishOptions, QueueInfo, QueueOptions};
pub use rabbitmq::{ConnectionManager, QueueError, QueueService};
