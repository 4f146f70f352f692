//! Producer side of the task queue.

use fileproc_core::models::TaskPayload;
use fileproc_core::TaskQueueConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{BrokerError, EnqueueRequest, QueueBroker, TaskHandle};

pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("failed to serialize {kind} payload: {source}")]
    Serialization {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to submit {kind} task: {source}")]
    Submission {
        kind: &'static str,
        #[source]
        source: BrokerError,
    },
}

/// Wraps typed payloads and hands them to the broker with the configured
/// retry and timeout policy.
#[derive(Clone)]
pub struct TaskClient {
    broker: Arc<dyn QueueBroker>,
    max_retry: u32,
    timeout: Duration,
}

impl TaskClient {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            broker,
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_config(broker: Arc<dyn QueueBroker>, config: &TaskQueueConfig) -> Self {
        Self {
            broker,
            max_retry: config.max_retry,
            timeout: config.task_timeout,
        }
    }

    /// Serialize `payload` and submit it. Returns once the broker has accepted
    /// the task; execution happens later on some worker.
    pub async fn enqueue<P: TaskPayload>(&self, payload: &P) -> Result<TaskHandle, EnqueueError> {
        let kind = P::KIND.as_str();
        let bytes = serde_json::to_vec(payload)
            .map_err(|source| EnqueueError::Serialization { kind, source })?;
        let payload_size = bytes.len();

        let handle = self
            .broker
            .enqueue(EnqueueRequest {
                kind: kind.to_string(),
                payload: bytes,
                max_retry: self.max_retry,
                timeout: self.timeout,
            })
            .await
            .map_err(|source| {
                tracing::error!(task.kind = kind, error = %source, "Failed to enqueue task");
                EnqueueError::Submission { kind, source }
            })?;

        tracing::info!(
            task.id = %handle.id,
            task.kind = kind,
            payload_size = payload_size,
            max_retry = self.max_retry,
            "Task enqueued"
        );

        Ok(handle)
    }
}
