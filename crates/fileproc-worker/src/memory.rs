use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{
    can_retry, compute_retry_backoff_seconds, AckToken, BrokerError, Delivery, EnqueueRequest,
    FailOutcome, QueueBroker, TaskHandle, VISIBILITY_GRACE,
};

/// A task the queue gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub task_id: Uuid,
    pub kind: String,
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
enum JobState {
    Pending { run_at: Instant },
    Running { claim: Uuid, claimed_until: Instant },
}

#[derive(Debug)]
struct Job {
    kind: String,
    payload: Vec<u8>,
    retry_count: u32,
    max_retry: u32,
    timeout: Duration,
    state: JobState,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// Pending task ids in enqueue / re-schedule order.
    ready: VecDeque<Uuid>,
    dead: Vec<DeadLetter>,
    completed: u64,
}

/// In-process broker with the same retry and visibility rules as `PgTaskQueue`.
///
/// Nothing survives the process; meant for tests and single-node development.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    backoff_base: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Scale the exponential retry delay. `Duration::ZERO` re-queues immediately.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tasks still owned by the queue (pending or claimed).
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    /// Number of acknowledged tasks.
    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.backoff_base
            .saturating_mul(compute_retry_backoff_seconds(retry_count) as u32)
    }

    /// Remove a job held under `token`, rejecting stale claims.
    fn take_claimed(inner: &mut Inner, token: &AckToken) -> Result<Job, BrokerError> {
        match inner.jobs.get(&token.task_id).map(|job| job.state) {
            Some(JobState::Running { claim, .. }) if claim == token.claim => inner
                .jobs
                .remove(&token.task_id)
                .ok_or(BrokerError::StaleClaim(token.task_id)),
            _ => Err(BrokerError::StaleClaim(token.task_id)),
        }
    }

    fn bury(inner: &mut Inner, task_id: Uuid, job: Job, reason: &str) {
        tracing::warn!(
            task.id = %task_id,
            task.kind = %job.kind,
            retry_count = job.retry_count,
            reason = %reason,
            "Task dead-lettered"
        );
        inner.dead.push(DeadLetter {
            task_id,
            kind: job.kind,
            payload: job.payload,
            retry_count: job.retry_count,
            reason: reason.to_string(),
        });
    }

    fn record_failure(&self, inner: &mut Inner, task_id: Uuid, mut job: Job, reason: &str) -> FailOutcome {
        if !can_retry(job.retry_count, job.max_retry) {
            Self::bury(inner, task_id, job, reason);
            return FailOutcome::DeadLettered;
        }

        let delay = self.backoff(job.retry_count);
        job.retry_count += 1;
        job.state = JobState::Pending {
            run_at: Instant::now() + delay,
        };
        let retry_count = job.retry_count;
        inner.jobs.insert(task_id, job);
        inner.ready.push_back(task_id);

        FailOutcome::Retrying { retry_count, delay }
    }
}

#[async_trait]
impl QueueBroker for MemoryQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskHandle, BrokerError> {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        inner.jobs.insert(
            id,
            Job {
                kind: request.kind.clone(),
                payload: request.payload,
                retry_count: 0,
                max_retry: request.max_retry,
                timeout: request.timeout,
                state: JobState::Pending {
                    run_at: Instant::now(),
                },
            },
        );
        inner.ready.push_back(id);
        Ok(TaskHandle {
            id,
            kind: request.kind,
        })
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        let now = Instant::now();
        let mut inner = self.lock();

        let position = inner.ready.iter().position(|id| {
            matches!(
                inner.jobs.get(id).map(|job| job.state),
                Some(JobState::Pending { run_at }) if run_at <= now
            )
        });
        let Some(position) = position else {
            return Ok(None);
        };
        let Some(task_id) = inner.ready.remove(position) else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&task_id) else {
            return Ok(None);
        };

        let claim = Uuid::new_v4();
        job.state = JobState::Running {
            claim,
            claimed_until: now + job.timeout + VISIBILITY_GRACE,
        };

        Ok(Some(Delivery {
            kind: job.kind.clone(),
            payload: job.payload.clone(),
            token: AckToken { task_id, claim },
            retry_count: job.retry_count,
            max_retry: job.max_retry,
            timeout: job.timeout,
        }))
    }

    async fn ack(&self, token: &AckToken) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        Self::take_claimed(&mut inner, token)?;
        inner.completed += 1;
        Ok(())
    }

    async fn fail(&self, token: &AckToken, reason: &str) -> Result<FailOutcome, BrokerError> {
        let mut inner = self.lock();
        let job = Self::take_claimed(&mut inner, token)?;
        Ok(self.record_failure(&mut inner, token.task_id, job, reason))
    }

    async fn dead_letter(&self, token: &AckToken, reason: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let job = Self::take_claimed(&mut inner, token)?;
        Self::bury(&mut inner, token.task_id, job, reason);
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, BrokerError> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired: Vec<Uuid> = inner
            .jobs
            .iter()
            .filter_map(|(id, job)| match job.state {
                JobState::Running { claimed_until, .. } if claimed_until < now => Some(*id),
                _ => None,
            })
            .collect();

        for task_id in &expired {
            if let Some(job) = inner.jobs.remove(task_id) {
                self.record_failure(&mut inner, *task_id, job, "visibility timeout expired");
            }
        }

        Ok(expired.len() as u64)
    }
}
