// src/rabbitmq/mod.rs
// RabbitMQ connection management, queue operations and broker backends

pub mod amqp_client;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod memory;
pub mod queue_service;
pub mod topic;

mod channel_manager;
mod lapin_client;

pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{AlwaysRequeue, Disposition, FailurePolicy, MaxRedeliveries, Subscription};
pub use errors::{BrokerError, BrokerErrorKind, QueueError, Result};
pub use lapin_client::LapinClient;
pub use memory::MemoryBroker;
pub use queue_service::QueueService;
