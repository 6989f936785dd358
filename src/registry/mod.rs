//! Worker registry & heartbeat: tracks pool membership, TTL-based eviction,
//! and a change feed for `Joined`/`Updated`/`Left` events.
//!
//! Grounded on the `repository` module's trait-boundary pattern: a narrow
//! async trait plus an in-memory implementation, so a future etcd/Consul
//! collaborator can be swapped in without touching callers. The real
//! distributed store is an external collaborator per the component design,
//! so only the in-memory implementation lives here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::repository::WorkerRepository;
use crate::worker::{ResourceInventory, Worker, WorkerEvent, WorkerFilter, WorkerStatus};

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(&self, worker: Worker) -> Result<Worker>;
    async fn heartbeat(&self, id: &str) -> Result<Worker>;
    async fn update_resources(&self, id: &str, resources: ResourceInventory) -> Result<Worker>;
    async fn update_status(&self, id: &str, status: WorkerStatus) -> Result<Worker>;
    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>>;
    async fn deregister(&self, id: &str) -> Result<()>;
    /// Subscribe to membership changes. Lagging subscribers drop the oldest
    /// events rather than block publishers (broadcast semantics).
    fn watch(&self) -> broadcast::Receiver<WorkerEvent>;
    /// Periodic sweep: evict workers silent past TTL + deregister-after.
    /// Intended to run on a timer from the worker core.
    async fn evict_stale(&self, now_ms: u64) -> Result<Vec<String>>;
}

pub struct InMemoryWorkerRegistry {
    workers: Arc<dyn WorkerRepository>,
    events: broadcast::Sender<WorkerEvent>,
    ttl_ms: u64,
    deregister_after_ms: u64,
}

impl InMemoryWorkerRegistry {
    pub fn new(workers: Arc<dyn WorkerRepository>, ttl_ms: u64, deregister_after_ms: u64) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { workers, events, ttl_ms, deregister_after_ms }
    }

    fn publish(&self, event: WorkerEvent) {
        // No subscribers is a normal state (e.g. before the admin CLI
        // attaches), not an error.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(&self, worker: Worker) -> Result<Worker> {
        if worker.id.is_empty() {
            return Err(Error::PayloadInvalid("worker id must not be empty".into()));
        }
        let saved = self.workers.create(worker).await?;
        info!(worker = %saved.id, zone = %saved.zone, "worker joined");
        self.publish(WorkerEvent::Joined(saved.clone()));
        Ok(saved)
    }

    async fn heartbeat(&self, id: &str) -> Result<Worker> {
        self.workers.update_last_seen(id).await
    }

    async fn update_resources(&self, id: &str, resources: ResourceInventory) -> Result<Worker> {
        let updated = self.workers.update_resources(id, resources).await?;
        self.publish(WorkerEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn update_status(&self, id: &str, status: WorkerStatus) -> Result<Worker> {
        let updated = self.workers.update_status(id, status).await?;
        self.publish(WorkerEvent::Updated(updated.clone()));
        if status == WorkerStatus::Left {
            self.publish(WorkerEvent::Left(id.to_string()));
        }
        Ok(updated)
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>> {
        self.workers.list(filter).await
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.workers.delete(id).await?;
        self.publish(WorkerEvent::Left(id.to_string()));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Workers whose last heartbeat exceeds TTL + deregister-after are
    /// marked `Left` and evicted, their VMs left for the orphan reaper to
    /// reclaim.
    async fn evict_stale(&self, now_ms: u64) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        for worker in self.workers.list_active().await? {
            if worker.is_stale(now_ms, self.ttl_ms, self.deregister_after_ms) {
                warn!(worker = %worker.id, last_seen_ms = worker.last_seen_ms, "evicting stale worker");
                self.workers.delete(&worker.id).await?;
                self.publish(WorkerEvent::Left(worker.id.clone()));
                evicted.push(worker.id);
            }
        }
        Ok(evicted)
    }
}
