//! Queue broker contract shared by the task client and the dispatcher.
//!
//! Delivery is at-least-once: a claimed task that is neither acknowledged,
//! failed nor dead-lettered before its visibility deadline is handed out again.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Maximum delay in seconds before retrying a failed task. Caps exponential backoff
/// so that high retry counts do not produce excessively long delays.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Slack added to a task's timeout before its claim is considered abandoned.
pub const VISIBILITY_GRACE: Duration = Duration::from_secs(30);

/// Computes backoff in seconds for a given retry count (exponential with cap).
#[inline]
pub fn compute_retry_backoff_seconds(retry_count: u32) -> u64 {
    2_u64
        .checked_pow(retry_count)
        .unwrap_or(u64::MAX)
        .min(MAX_RETRY_BACKOFF_SECS)
}

/// Whether a task that has already been retried `retry_count` times gets another go.
#[inline]
pub fn can_retry(retry_count: u32, max_retry: u32) -> bool {
    retry_count < max_retry
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    /// Wire kind, e.g. `image:resize`.
    pub kind: String,
    /// Serialized payload, stored and delivered byte for byte.
    pub payload: Vec<u8>,
    pub max_retry: u32,
    pub timeout: Duration,
}

/// Broker-assigned identity of an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: Uuid,
    pub kind: String,
}

/// Proof of a claim. Reports made with a lapsed claim are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken {
    pub task_id: Uuid,
    pub claim: Uuid,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub kind: String,
    pub payload: Vec<u8>,
    pub token: AckToken,
    /// Retries already consumed; 0 on the first execution.
    pub retry_count: u32,
    pub max_retry: u32,
    pub timeout: Duration,
}

impl Delivery {
    pub fn task_id(&self) -> Uuid {
        self.token.task_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled again after `delay`; `retry_count` is the new count.
    Retrying { retry_count: u32, delay: Duration },
    DeadLettered,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("claim on task {0} is no longer held")]
    StaleClaim(Uuid),

    #[error("queue rejected task: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskHandle, BrokerError>;

    /// Claim the next ready task, if any.
    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, token: &AckToken) -> Result<(), BrokerError>;

    /// Count a failed attempt; the broker re-schedules or dead-letters.
    async fn fail(&self, token: &AckToken, reason: &str) -> Result<FailOutcome, BrokerError>;

    /// Park the task permanently, regardless of remaining retries.
    async fn dead_letter(&self, token: &AckToken, reason: &str) -> Result<(), BrokerError>;

    /// Treat lapsed claims as failed attempts. Returns how many were found.
    async fn requeue_expired(&self) -> Result<u64, BrokerError>;
}
