//! Distributed task queue: priority-lane weighted round-robin scheduling,
//! at-least-once delivery via visibility timeout, exponential backoff retry,
//! and a dead-letter set.

mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::repository::TaskRepository;
use crate::task::{Task, TaskFilter, TaskResult};

pub use scheduler::LaneScheduler;

/// A handler registered for one task type tag. Handlers MUST validate their
/// own payloads and return a typed error; undecodable payloads fail without
/// retry (the queue treats that the same as any other handler error, since
/// payload validation is the handler's responsibility, not the queue's).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task, cancel: CancelToken) -> TaskResult;
}

pub struct Queue {
    config: QueueConfig,
    tasks: Arc<dyn TaskRepository>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    concurrency: Arc<Semaphore>,
    scheduler: LaneScheduler,
    stop_requested: Arc<std::sync::atomic::AtomicBool>,
    in_flight: Arc<tokio::sync::Mutex<HashMap<Uuid, CancelToken>>>,
}

impl Queue {
    pub fn new(config: QueueConfig, tasks: Arc<dyn TaskRepository>) -> Self {
        let scheduler = LaneScheduler::new(config.lane_weights.clone());
        Self {
            concurrency: Arc::new(Semaphore::new(config.concurrency)),
            config,
            tasks,
            handlers: RwLock::new(HashMap::new()),
            scheduler,
            stop_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            in_flight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub async fn enqueue(&self, task: Task) -> Result<Task> {
        self.tasks.create(task).await
    }

    /// Passthrough for inspection surfaces (the admin control surface); the
    /// queue owns the task repository handle, so callers that only need
    /// read access go through here rather than holding their own reference.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.tasks.list(filter).await
    }

    pub async fn register_handler(&self, type_tag: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.insert(type_tag.into(), handler);
    }

    /// Drive the consumer loop until [`Queue::stop`] is called. Intended to
    /// run as a background task; `worker_id` is stamped on every claim.
    pub async fn start(self: Arc<Self>, worker_id: String) {
        loop {
            if self.stop_requested.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }

            let pending = match self.tasks.get_next_pending().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(error = %e, "failed to poll pending tasks");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    continue;
                }
            };

            let by_lane = self.scheduler.group_by_lane(pending);
            let Some(task) = self.scheduler.next(&by_lane) else {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            };

            let Ok(permit) = self.concurrency.clone().acquire_owned().await else {
                return;
            };

            let claimed = match self
                .tasks
                .mark_processing(task.id, &worker_id, self.config.visibility_timeout_ms)
                .await
            {
                Ok(t) => t,
                Err(_) => continue, // already claimed by a racing worker
            };

            let handlers = self.handlers.read().await;
            let Some(handler) = handlers.get(&claimed.type_tag).cloned() else {
                drop(handlers);
                warn!(task = %claimed.id, type_tag = %claimed.type_tag, "no handler registered");
                let _ = self
                    .tasks
                    .mark_failed(claimed.id, "no handler registered", self.config.retry_base_backoff_ms, self.config.retry_backoff_cap_ms)
                    .await;
                continue;
            };
            drop(handlers);

            let cancel = CancelToken::new();
            self.in_flight.lock().await.insert(claimed.id, cancel.clone());

            let tasks_repo = self.tasks.clone();
            let base_backoff = self.config.retry_base_backoff_ms;
            let backoff_cap = self.config.retry_backoff_cap_ms;
            let in_flight = self.in_flight.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let result = handler.handle(&claimed, cancel).await;

                // If `stop()` already reclaimed this task (shutdown grace
                // period elapsed while the handler was still running), the
                // entry is gone from `in_flight` and the claim has already
                // been released; writing a result here would race that
                // release and could double-count a retry.
                if in_flight.lock().await.remove(&claimed.id).is_none() {
                    return;
                }

                if result.success {
                    let _ = tasks_repo.mark_completed(claimed.id, result.result).await;
                } else {
                    let _ = tasks_repo
                        .mark_failed(claimed.id, result.error.as_deref().unwrap_or("handler failed"), base_backoff, backoff_cap)
                        .await;
                }
            });
        }
    }

    /// Stop accepting new claims, wait for in-flight handlers up to
    /// `grace_period`, then cancel remaining handlers. Cancelled claims
    /// return to pending with retry_count unchanged (recoverable after the
    /// visibility timeout, not re-enqueued immediately, to avoid
    /// double-execution).
    pub async fn stop(&self, grace_period: std::time::Duration) {
        self.stop_requested.store(true, std::sync::atomic::Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + grace_period;
        loop {
            if self.in_flight.lock().await.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        // Claim every remaining entry under the lock before cancelling: the
        // completion task in `start()` treats a missing `in_flight` entry as
        // "already reclaimed here" and skips writing its own result, so
        // draining the map first is what makes the release authoritative.
        let remaining: Vec<_> = self.in_flight.lock().await.drain().collect();
        for (id, cancel) in &remaining {
            cancel.cancel();
            if let Err(e) = self.tasks.release_claim_for_recovery(*id).await {
                warn!(task = %id, error = %e, "failed to release in-flight claim at shutdown");
            }
        }
        info!(count = remaining.len(), "released remaining in-flight claims at shutdown");
    }
}
