//! Worker pool pulling deliveries from a broker and routing them to handlers.

use fileproc_core::models::TaskKind;
use fileproc_core::DispatcherConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{AckToken, BrokerError, Delivery, FailOutcome, QueueBroker};
use crate::context::TaskContext;
use crate::envelope::decode;
use crate::registry::HandlerRegistry;

/// How a single delivery ended, from the dispatcher's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Acknowledged,
    RetryScheduled,
    DeadLettered,
}

/// How long abandoned jobs get to unwind once their tokens have fired.
const ABANDON_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
#[error("no handler registered for task kind {0}")]
pub struct UnroutableTask(pub TaskKind);

#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn QueueBroker>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            broker,
            registry: Arc::new(registry),
            config,
        }
    }

    /// Claim and execute deliveries until `shutdown` is cancelled.
    ///
    /// On shutdown no new work is claimed; in-flight jobs get
    /// `shutdown_grace_period` to finish. After that their cancellation tokens
    /// fire, they are dropped without acking or failing, and their claims are
    /// left to lapse. `run` returns once they have unwound.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            max_workers = self.config.max_workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            handlers = ?self.registry.kinds(),
            "Dispatcher started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let tracker = TaskTracker::new();
        let jobs = CancellationToken::new();
        let reaper = self.spawn_reaper(shutdown.clone());

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }

            match self.broker.dequeue().await {
                Ok(Some(delivery)) => {
                    let this = self.clone();
                    let abandon = jobs.clone();
                    let job_cancel = jobs.child_token();
                    tracker.spawn(async move {
                        let _permit = permit;
                        let task_id = delivery.task_id();
                        tokio::select! {
                            biased;
                            _ = abandon.cancelled() => {
                                tracing::warn!(task.id = %task_id, "Task abandoned; claim left to lapse");
                            }
                            result = this.execute(delivery, job_cancel) => {
                                if let Err(e) = result {
                                    tracing::error!(task.id = %task_id, error = %e, "Failed to report task result");
                                }
                            }
                        }
                    });
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    tracing::trace!("No tasks available in queue");
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim task from queue");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(in_flight = tracker.len(), "Dispatcher draining");
        tracker.close();

        if tokio::time::timeout(self.config.shutdown_grace_period, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                abandoned = tracker.len(),
                "Shutdown grace period elapsed; abandoning in-flight tasks"
            );
            jobs.cancel();
            if tokio::time::timeout(ABANDON_WAIT, tracker.wait()).await.is_err() {
                tracing::error!(remaining = tracker.len(), "Abandoned tasks did not unwind");
            }
        }

        if let Err(e) = reaper.await {
            tracing::error!(error = %e, "Reaper task panicked");
        }
        tracing::info!("Dispatcher stopped");
    }

    fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let reap_interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = broker.requeue_expired().await {
                            tracing::error!(error = %e, "Expired claim reaper failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Claim and execute a single delivery inline. `None` when nothing is ready.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, BrokerError> {
        let Some(delivery) = self.broker.dequeue().await? else {
            return Ok(None);
        };
        self.execute(delivery, CancellationToken::new())
            .await
            .map(Some)
    }

    #[tracing::instrument(skip_all, fields(
        task.id = %delivery.task_id(),
        task.kind = %delivery.kind,
        retry_count = delivery.retry_count
    ))]
    async fn execute(
        &self,
        delivery: Delivery,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, BrokerError> {
        let token = delivery.token;

        let task = match decode(&delivery) {
            Ok(task) => task,
            Err(e) => return self.bury(&token, &e.to_string()).await,
        };
        let kind = task.kind();
        let Some(handler) = self.registry.get(kind) else {
            return self.bury(&token, &UnroutableTask(kind).to_string()).await;
        };

        let ctx = TaskContext {
            task_id: token.task_id,
            kind,
            retry_count: delivery.retry_count,
            max_retry: delivery.max_retry,
            cancel: cancel.clone(),
        };

        tracing::debug!("Executing task");
        match tokio::time::timeout(delivery.timeout, handler.handle(task, ctx)).await {
            Ok(Ok(())) => {
                self.broker.ack(&token).await?;
                tracing::info!("Task completed");
                Ok(JobOutcome::Acknowledged)
            }
            Ok(Err(err)) if err.is_recoverable() => {
                tracing::warn!(error = %err, "Task failed");
                self.report_failure(&token, &err.to_string()).await
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Task failed with unrecoverable error");
                self.bury(&token, &err.to_string()).await
            }
            Err(_) => {
                cancel.cancel();
                let reason = format!("timed out after {}s", delivery.timeout.as_secs());
                tracing::warn!(reason = %reason, "Task timed out");
                self.report_failure(&token, &reason).await
            }
        }
    }

    async fn report_failure(&self, token: &AckToken, reason: &str) -> Result<JobOutcome, BrokerError> {
        match self.broker.fail(token, reason).await? {
            FailOutcome::Retrying { retry_count, delay } => {
                tracing::info!(
                    retry_count = retry_count,
                    delay_secs = delay.as_secs(),
                    "Task scheduled for retry"
                );
                Ok(JobOutcome::RetryScheduled)
            }
            FailOutcome::DeadLettered => {
                tracing::error!(reason = %reason, "Task exhausted its retries");
                Ok(JobOutcome::DeadLettered)
            }
        }
    }

    async fn bury(&self, token: &AckToken, reason: &str) -> Result<JobOutcome, BrokerError> {
        tracing::warn!(reason = %reason, "Dead-lettering task");
        self.broker.dead_letter(token, reason).await?;
        Ok(JobOutcome::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EnqueueRequest;
    use crate::envelope::Task;
    use crate::memory::MemoryQueue;
    use crate::registry::TaskHandler;
    use async_trait::async_trait;
    use fileproc_core::TaskError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    enum Behaviour {
        Succeed,
        Unrecoverable,
        Sleep(Duration),
        Hang,
    }

    struct Scripted {
        behaviour: Behaviour,
        calls: AtomicUsize,
        last_cancel: Mutex<Option<CancellationToken>>,
    }

    impl Scripted {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicUsize::new(0),
                last_cancel: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn handle(&self, _task: Task, ctx: TaskContext) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_cancel.lock().unwrap() = Some(ctx.cancel.clone());
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Unrecoverable => {
                    Err(TaskError::unrecoverable(anyhow::anyhow!("bad input")))
                }
                Behaviour::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(())
                }
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    fn metadata_request(timeout: Duration) -> EnqueueRequest {
        let body = serde_json::json!({
            "file_id": Uuid::new_v4(),
            "storage_path": "/srv",
            "filename": "clip.mp4",
        });
        EnqueueRequest {
            kind: "video:extract-metadata".to_string(),
            payload: serde_json::to_vec(&body).unwrap(),
            max_retry: 3,
            timeout,
        }
    }

    fn dispatcher(queue: &MemoryQueue, handler: Arc<Scripted>) -> Dispatcher {
        dispatcher_with_grace(queue, handler, Duration::from_secs(5))
    }

    fn dispatcher_with_grace(
        queue: &MemoryQueue,
        handler: Arc<Scripted>,
        grace: Duration,
    ) -> Dispatcher {
        let registry = HandlerRegistry::builder()
            .register(TaskKind::VideoExtractMetadata, handler)
            .unwrap()
            .build();
        Dispatcher::new(
            Arc::new(queue.clone()),
            registry,
            DispatcherConfig {
                max_workers: 4,
                poll_interval: Duration::from_millis(10),
                shutdown_grace_period: grace,
                reap_interval: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn unrecoverable_error_skips_retries() {
        let queue = MemoryQueue::new().with_backoff_base(Duration::ZERO);
        let handler = Scripted::new(Behaviour::Unrecoverable);
        let dispatcher = dispatcher(&queue, handler.clone());
        queue.enqueue(metadata_request(Duration::from_secs(60))).await.unwrap();

        assert_eq!(
            dispatcher.process_next().await.unwrap(),
            Some(JobOutcome::DeadLettered)
        );
        assert_eq!(dispatcher.process_next().await.unwrap(), None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dead_letters()[0].reason, "bad input");
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered() {
        let queue = MemoryQueue::new();
        let handler = Scripted::new(Behaviour::Succeed);
        let dispatcher = dispatcher(&queue, handler.clone());
        queue
            .enqueue(EnqueueRequest {
                kind: "video:extract-metadata".to_string(),
                payload: b"not json".to_vec(),
                max_retry: 3,
                timeout: Duration::from_secs(60),
            })
            .await
            .unwrap();

        assert_eq!(
            dispatcher.process_next().await.unwrap(),
            Some(JobOutcome::DeadLettered)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_handler_and_schedules_retry() {
        let queue = MemoryQueue::new();
        let handler = Scripted::new(Behaviour::Hang);
        let dispatcher = dispatcher(&queue, handler.clone());
        queue.enqueue(metadata_request(Duration::from_secs(2))).await.unwrap();

        assert_eq!(
            dispatcher.process_next().await.unwrap(),
            Some(JobOutcome::RetryScheduled)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let cancel = handler.last_cancel.lock().unwrap().clone().unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(queue.len(), 1);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn run_drains_queue_and_stops_on_cancel() {
        let queue = MemoryQueue::new();
        let handler = Scripted::new(Behaviour::Succeed);
        let dispatcher = dispatcher(&queue, handler.clone());
        for _ in 0..6 {
            queue.enqueue(metadata_request(Duration::from_secs(60))).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.completed() < 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
    }

    fn start(dispatcher: &Dispatcher, shutdown: &CancellationToken) -> JoinHandle<()> {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    }

    async fn wait_for_first_call(handler: &Scripted) {
        while handler.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_task_within_grace() {
        let queue = MemoryQueue::new();
        let handler = Scripted::new(Behaviour::Sleep(Duration::from_secs(2)));
        let dispatcher = dispatcher_with_grace(&queue, handler.clone(), Duration::from_secs(5));
        queue.enqueue(metadata_request(Duration::from_secs(60))).await.unwrap();

        let shutdown = CancellationToken::new();
        let running = start(&dispatcher, &shutdown);
        wait_for_first_call(&handler).await;

        let stopping = tokio::time::Instant::now();
        shutdown.cancel();
        running.await.unwrap();

        assert!(stopping.elapsed() >= Duration::from_secs(1));
        assert!(stopping.elapsed() < Duration::from_secs(5));
        assert_eq!(queue.completed(), 1);
        assert!(queue.is_empty());
        let cancel = handler.last_cancel.lock().unwrap().clone().unwrap();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn task_outliving_grace_is_cancelled_and_left_claimed() {
        let queue = MemoryQueue::new();
        let handler = Scripted::new(Behaviour::Hang);
        let dispatcher = dispatcher_with_grace(&queue, handler.clone(), Duration::from_secs(5));
        queue.enqueue(metadata_request(Duration::from_secs(600))).await.unwrap();

        let shutdown = CancellationToken::new();
        let running = start(&dispatcher, &shutdown);
        wait_for_first_call(&handler).await;

        let stopping = tokio::time::Instant::now();
        shutdown.cancel();
        running.await.unwrap();

        // Grace plus the bounded unwind wait, well short of the task timeout.
        assert!(stopping.elapsed() >= Duration::from_secs(5));
        assert!(stopping.elapsed() <= Duration::from_secs(5) + ABANDON_WAIT);

        let cancel = handler.last_cancel.lock().unwrap().clone().unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(queue.completed(), 0);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.len(), 1);
        // Still claimed, so not visible to another worker yet.
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
