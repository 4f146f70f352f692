use fileproc_core::models::TaskKind;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-execution context handed to a handler alongside its task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub kind: TaskKind,
    /// Retries already consumed; 0 on the first execution.
    pub retry_count: u32,
    pub max_retry: u32,
    /// Cancelled on shutdown or when the task times out.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// A recoverable failure now dead-letters the task instead of re-scheduling it.
    pub fn is_final_attempt(&self) -> bool {
        self.retry_count >= self.max_retry
    }
}
