//! fileproc worker – task queue client, broker adapters and the dispatcher.
//!
//! Producers enqueue typed payloads through [`TaskClient`]. The [`Dispatcher`]
//! claims deliveries from a [`QueueBroker`], routes them through a
//! [`HandlerRegistry`] and reports each outcome back to the broker, which owns
//! the retry and dead-letter policy.

pub mod broker;
pub mod client;
pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod handlers;
pub mod memory;
pub mod postgres;
pub mod registry;

pub use broker::{
    can_retry, compute_retry_backoff_seconds, AckToken, BrokerError, Delivery, EnqueueRequest,
    FailOutcome, QueueBroker, TaskHandle,
};
pub use client::{EnqueueError, TaskClient, DEFAULT_MAX_RETRY, DEFAULT_TASK_TIMEOUT};
pub use context::TaskContext;
pub use dispatcher::{Dispatcher, JobOutcome, UnroutableTask};
pub use envelope::{decode, DecodeError, Task};
pub use handlers::default_registry;
pub use memory::{DeadLetter, MemoryQueue};
pub use postgres::PgTaskQueue;
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, RegistryError, TaskHandler};
