//! Narrow persistence surface for the core's entities.
//!
//! Grounded on the teacher's `persistence::PersistenceProvider` /
//! `provider_from_env`: each entity gets its own narrow trait (matching the
//! "Repository Interface" surface) plus an in-memory implementation used by
//! default and by tests, and a disk-backed JSON implementation (one file per
//! entity, one directory per collection) so a worker survives a restart
//! without requiring an external relational store. The real store behind
//! these interfaces is an external collaborator; the core must not be inert
//! without one.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::execution::Execution;
use crate::task::{Task, TaskFilter, TaskStatus};
use crate::vm::{Vm, VmFilter, VmState};
use crate::worker::{Worker, WorkerFilter, WorkerMetric, WorkerStatus};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn create(&self, vm: Vm) -> Result<Vm>;
    async fn get(&self, id: Uuid) -> Result<Vm>;
    async fn get_by_name(&self, name: &str) -> Result<Vm>;
    async fn list(&self, filter: &VmFilter) -> Result<Vec<Vm>>;
    async fn update(&self, vm: Vm) -> Result<Vm>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: Task) -> Result<Task>;
    async fn get(&self, id: Uuid) -> Result<Task>;
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;
    async fn update(&self, task: Task) -> Result<Task>;
    /// Next claimable task across all pending/expired-claim tasks, chosen by
    /// the caller's lane-weighted scheduler (the repository itself is
    /// lane-agnostic; see `queue::Queue`).
    async fn get_next_pending(&self) -> Result<Vec<Task>>;
    async fn mark_processing(&self, id: Uuid, worker_id: &str, visibility_timeout_ms: u64) -> Result<Task>;
    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<Task>;
    async fn mark_failed(&self, id: Uuid, error: &str, base_backoff_ms: u64, backoff_cap_ms: u64) -> Result<Task>;
    /// Return a claimed task to `Pending` without consuming a retry, used
    /// when shutdown cancels a handler before it could report a result.
    async fn release_claim_for_recovery(&self, id: Uuid) -> Result<Task>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, execution: Execution) -> Result<Execution>;
    async fn get(&self, id: Uuid) -> Result<Execution>;
    async fn list_by_vm(&self, vm_id: Uuid) -> Result<Vec<Execution>>;
}

#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn create(&self, worker: Worker) -> Result<Worker>;
    async fn get(&self, id: &str) -> Result<Worker>;
    async fn list(&self, filter: &WorkerFilter) -> Result<Vec<Worker>>;
    async fn update(&self, worker: Worker) -> Result<Worker>;
    async fn update_resources(&self, id: &str, resources: crate::worker::ResourceInventory) -> Result<Worker>;
    async fn update_status(&self, id: &str, status: WorkerStatus) -> Result<Worker>;
    async fn update_last_seen(&self, id: &str) -> Result<Worker>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_by_zone(&self, zone: &str) -> Result<Vec<Worker>>;
    async fn list_active(&self) -> Result<Vec<Worker>>;
}

#[async_trait]
pub trait WorkerMetricRepository: Send + Sync {
    async fn create(&self, metric: WorkerMetric) -> Result<()>;
    async fn list_by_worker(&self, worker_id: &str, limit: usize) -> Result<Vec<WorkerMetric>>;
    async fn list_in_range(&self, from_ms: u64, to_ms: u64) -> Result<Vec<WorkerMetric>>;
    async fn delete_older_than(&self, cutoff_ms: u64) -> Result<u64>;
}

// ---------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryVmRepository {
    vms: RwLock<HashMap<Uuid, Vm>>,
}

impl InMemoryVmRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VmRepository for InMemoryVmRepository {
    async fn create(&self, vm: Vm) -> Result<Vm> {
        let mut vms = self.vms.write().unwrap();
        if vms.values().any(|existing| existing.name == vm.name) {
            return Err(Error::PayloadInvalid(format!(
                "a VM named {:?} already exists",
                vm.name
            )));
        }
        vms.insert(vm.id, vm.clone());
        Ok(vm)
    }

    async fn get(&self, id: Uuid) -> Result<Vm> {
        self.vms
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("vm {id}")))
    }

    async fn get_by_name(&self, name: &str) -> Result<Vm> {
        self.vms
            .read()
            .unwrap()
            .values()
            .find(|v| v.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("vm named {name}")))
    }

    async fn list(&self, filter: &VmFilter) -> Result<Vec<Vm>> {
        Ok(self
            .vms
            .read()
            .unwrap()
            .values()
            .filter(|v| {
                filter
                    .owning_worker_id
                    .as_ref()
                    .is_none_or(|w| &v.owning_worker_id == w)
                    && filter.state.is_none_or(|s| v.state == s)
            })
            .cloned()
            .collect())
    }

    async fn update(&self, vm: Vm) -> Result<Vm> {
        let mut vms = self.vms.write().unwrap();
        if !vms.contains_key(&vm.id) {
            return Err(Error::NotFound(format!("vm {}", vm.id)));
        }
        vms.insert(vm.id, vm.clone());
        Ok(vm)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.vms
            .write()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("vm {id}")))
    }
}

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: Task) -> Result<Task> {
        self.tasks.write().unwrap().insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Task> {
        self.tasks
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .unwrap()
            .values()
            .filter(|t| {
                filter.type_tag.as_ref().is_none_or(|tag| &t.type_tag == tag)
                    && filter.status.is_none_or(|s| t.status == s)
                    && filter.lane.is_none_or(|l| t.lane == l)
            })
            .cloned()
            .collect())
    }

    async fn update(&self, task: Task) -> Result<Task> {
        let mut tasks = self.tasks.write().unwrap();
        if !tasks.contains_key(&task.id) {
            return Err(Error::NotFound(format!("task {}", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_next_pending(&self) -> Result<Vec<Task>> {
        let now = now_ms();
        Ok(self
            .tasks
            .read()
            .unwrap()
            .values()
            .filter(|t| {
                (t.status == TaskStatus::Pending && t.scheduled_at_ms <= now)
                    || (t.status == TaskStatus::Processing && t.is_claim_expired(now))
            })
            .cloned()
            .collect())
    }

    async fn mark_processing(&self, id: Uuid, worker_id: &str, visibility_timeout_ms: u64) -> Result<Task> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks.get_mut(&id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        task.mark_processing(worker_id, visibility_timeout_ms);
        Ok(task.clone())
    }

    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<Task> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks.get_mut(&id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        task.mark_completed(result);
        Ok(task.clone())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, base_backoff_ms: u64, backoff_cap_ms: u64) -> Result<Task> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks.get_mut(&id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        task.mark_failed(error, base_backoff_ms, backoff_cap_ms);
        Ok(task.clone())
    }

    async fn release_claim_for_recovery(&self, id: Uuid) -> Result<Task> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks.get_mut(&id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        task.release_claim_for_recovery();
        Ok(task.clone())
    }
}

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create(&self, execution: Execution) -> Result<Execution> {
        self.executions.write().unwrap().insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get(&self, id: Uuid) -> Result<Execution> {
        self.executions
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("execution {id}")))
    }

    async fn list_by_vm(&self, vm_id: Uuid) -> Result<Vec<Execution>> {
        Ok(self
            .executions
            .read()
            .unwrap()
            .values()
            .filter(|e| e.vm_id == vm_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryWorkerRepository {
    workers: RwLock<HashMap<String, Worker>>,
}

impl InMemoryWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRepository for InMemoryWorkerRepository {
    async fn create(&self, worker: Worker) -> Result<Worker> {
        self.workers.write().unwrap().insert(worker.id.clone(), worker.clone());
        Ok(worker)
    }

    async fn get(&self, id: &str) -> Result<Worker> {
        self.workers
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))
    }

    async fn list(&self, filter: &WorkerFilter) -> Result<Vec<Worker>> {
        Ok(self
            .workers
            .read()
            .unwrap()
            .values()
            .filter(|w| {
                filter.zone.as_ref().is_none_or(|z| &w.zone == z)
                    && filter
                        .label
                        .as_ref()
                        .is_none_or(|(k, v)| w.labels.get(k).is_some_and(|lv| lv == v))
                    && filter.capability.as_ref().is_none_or(|c| w.capabilities.iter().any(|cap| cap == c))
                    && filter.status.is_none_or(|s| w.status == s)
            })
            .cloned()
            .collect())
    }

    async fn update(&self, worker: Worker) -> Result<Worker> {
        let mut workers = self.workers.write().unwrap();
        if !workers.contains_key(&worker.id) {
            return Err(Error::NotFound(format!("worker {}", worker.id)));
        }
        workers.insert(worker.id.clone(), worker.clone());
        Ok(worker)
    }

    async fn update_resources(&self, id: &str, resources: crate::worker::ResourceInventory) -> Result<Worker> {
        let mut workers = self.workers.write().unwrap();
        let worker = workers.get_mut(id).ok_or_else(|| Error::NotFound(format!("worker {id}")))?;
        worker.resources = resources;
        worker.touch();
        Ok(worker.clone())
    }

    async fn update_status(&self, id: &str, status: WorkerStatus) -> Result<Worker> {
        let mut workers = self.workers.write().unwrap();
        let worker = workers.get_mut(id).ok_or_else(|| Error::NotFound(format!("worker {id}")))?;
        worker.status = status;
        worker.touch();
        Ok(worker.clone())
    }

    async fn update_last_seen(&self, id: &str) -> Result<Worker> {
        let mut workers = self.workers.write().unwrap();
        let worker = workers.get_mut(id).ok_or_else(|| Error::NotFound(format!("worker {id}")))?;
        worker.touch();
        Ok(worker.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.workers
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))
    }

    async fn list_by_zone(&self, zone: &str) -> Result<Vec<Worker>> {
        self.list(&WorkerFilter {
            zone: Some(zone.to_string()),
            ..Default::default()
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<Worker>> {
        self.list(&WorkerFilter {
            status: Some(WorkerStatus::Active),
            ..Default::default()
        })
        .await
    }
}

#[derive(Default)]
pub struct InMemoryWorkerMetricRepository {
    metrics: RwLock<Vec<WorkerMetric>>,
}

impl InMemoryWorkerMetricRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerMetricRepository for InMemoryWorkerMetricRepository {
    async fn create(&self, metric: WorkerMetric) -> Result<()> {
        self.metrics.write().unwrap().push(metric);
        Ok(())
    }

    async fn list_by_worker(&self, worker_id: &str, limit: usize) -> Result<Vec<WorkerMetric>> {
        let metrics = self.metrics.read().unwrap();
        let mut out: Vec<WorkerMetric> = metrics
            .iter()
            .filter(|m| m.worker_id == worker_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| std::cmp::Reverse(m.recorded_at_ms));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_in_range(&self, from_ms: u64, to_ms: u64) -> Result<Vec<WorkerMetric>> {
        Ok(self
            .metrics
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.recorded_at_ms >= from_ms && m.recorded_at_ms <= to_ms)
            .cloned()
            .collect())
    }

    async fn delete_older_than(&self, cutoff_ms: u64) -> Result<u64> {
        let mut metrics = self.metrics.write().unwrap();
        let before = metrics.len();
        metrics.retain(|m| m.recorded_at_ms >= cutoff_ms);
        Ok((before - metrics.len()) as u64)
    }
}

// ---------------------------------------------------------------------
// Disk-backed JSON implementation (VM / Task / Execution collections)
// ---------------------------------------------------------------------

/// One JSON file per entity under `<state_dir>/<collection>/<id>.json`,
/// matching `persistence::DiskPersistenceProvider`'s layout.
pub struct DiskCollection<T> {
    dir: PathBuf,
    cache: RwLock<HashMap<String, T>>,
}

impl<T> DiskCollection<T>
where
    T: Clone + serde::Serialize + for<'de> serde::Deserialize<'de>,
{
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| Error::Config(format!("failed to create {}: {e}", dir.display())))?;
        let mut cache = HashMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::Config(format!("failed to read {}: {e}", dir.display())))? {
            let entry = entry.map_err(|e| Error::Config(format!("read_dir entry error: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read_to_string(&path).map_err(|e| Error::Config(format!("failed reading {}: {e}", path.display())))?;
            let value: T = serde_json::from_str(&data).map_err(|e| Error::Config(format!("invalid file {}: {e}", path.display())))?;
            let key = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
            cache.insert(key, value);
        }
        Ok(Self { dir, cache: RwLock::new(cache) })
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.cache.read().unwrap().get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.cache.read().unwrap().values().cloned().collect()
    }

    pub fn put(&self, key: &str, value: T) -> Result<()> {
        let path = self.dir.join(format!("{key}.json"));
        let data = serde_json::to_vec_pretty(&value)?;
        fs::write(&path, data).map_err(|e| Error::Config(format!("failed writing {}: {e}", path.display())))?;
        self.cache.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.dir.join(format!("{key}.json"));
        let _ = fs::remove_file(&path);
        self.cache.write().unwrap().remove(key);
        Ok(())
    }
}

pub struct DiskVmRepository {
    collection: DiskCollection<Vm>,
}

impl DiskVmRepository {
    pub fn new(state_dir: &PathBuf) -> Result<Self> {
        Ok(Self {
            collection: DiskCollection::open(state_dir.join("vms"))?,
        })
    }
}

#[async_trait]
impl VmRepository for DiskVmRepository {
    async fn create(&self, vm: Vm) -> Result<Vm> {
        if self.collection.list().iter().any(|v| v.name == vm.name) {
            return Err(Error::PayloadInvalid(format!("a VM named {:?} already exists", vm.name)));
        }
        self.collection.put(&vm.id.to_string(), vm.clone())?;
        Ok(vm)
    }

    async fn get(&self, id: Uuid) -> Result<Vm> {
        self.collection.get(&id.to_string()).ok_or_else(|| Error::NotFound(format!("vm {id}")))
    }

    async fn get_by_name(&self, name: &str) -> Result<Vm> {
        self.collection
            .list()
            .into_iter()
            .find(|v| v.name == name)
            .ok_or_else(|| Error::NotFound(format!("vm named {name}")))
    }

    async fn list(&self, filter: &VmFilter) -> Result<Vec<Vm>> {
        Ok(self
            .collection
            .list()
            .into_iter()
            .filter(|v| {
                filter.owning_worker_id.as_ref().is_none_or(|w| &v.owning_worker_id == w)
                    && filter.state.is_none_or(|s| v.state == s)
            })
            .collect())
    }

    async fn update(&self, vm: Vm) -> Result<Vm> {
        if self.collection.get(&vm.id.to_string()).is_none() {
            return Err(Error::NotFound(format!("vm {}", vm.id)));
        }
        self.collection.put(&vm.id.to_string(), vm.clone())?;
        Ok(vm)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.collection.remove(&id.to_string())
    }
}

pub struct DiskTaskRepository {
    collection: DiskCollection<Task>,
}

impl DiskTaskRepository {
    pub fn new(state_dir: &PathBuf) -> Result<Self> {
        Ok(Self {
            collection: DiskCollection::open(state_dir.join("tasks"))?,
        })
    }
}

#[async_trait]
impl TaskRepository for DiskTaskRepository {
    async fn create(&self, task: Task) -> Result<Task> {
        self.collection.put(&task.id.to_string(), task.clone())?;
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Task> {
        self.collection.get(&id.to_string()).ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self
            .collection
            .list()
            .into_iter()
            .filter(|t| {
                filter.type_tag.as_ref().is_none_or(|tag| &t.type_tag == tag)
                    && filter.status.is_none_or(|s| t.status == s)
                    && filter.lane.is_none_or(|l| t.lane == l)
            })
            .collect())
    }

    async fn update(&self, task: Task) -> Result<Task> {
        if self.collection.get(&task.id.to_string()).is_none() {
            return Err(Error::NotFound(format!("task {}", task.id)));
        }
        self.collection.put(&task.id.to_string(), task.clone())?;
        Ok(task)
    }

    async fn get_next_pending(&self) -> Result<Vec<Task>> {
        let now = now_ms();
        Ok(self
            .collection
            .list()
            .into_iter()
            .filter(|t| {
                (t.status == TaskStatus::Pending && t.scheduled_at_ms <= now)
                    || (t.status == TaskStatus::Processing && t.is_claim_expired(now))
            })
            .collect())
    }

    async fn mark_processing(&self, id: Uuid, worker_id: &str, visibility_timeout_ms: u64) -> Result<Task> {
        let mut task = self.get(id).await?;
        task.mark_processing(worker_id, visibility_timeout_ms);
        self.update(task).await
    }

    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<Task> {
        let mut task = self.get(id).await?;
        task.mark_completed(result);
        self.update(task).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str, base_backoff_ms: u64, backoff_cap_ms: u64) -> Result<Task> {
        let mut task = self.get(id).await?;
        task.mark_failed(error, base_backoff_ms, backoff_cap_ms);
        self.update(task).await
    }

    async fn release_claim_for_recovery(&self, id: Uuid) -> Result<Task> {
        let mut task = self.get(id).await?;
        task.release_claim_for_recovery();
        self.update(task).await
    }
}

pub struct DiskExecutionRepository {
    collection: DiskCollection<Execution>,
}

impl DiskExecutionRepository {
    pub fn new(state_dir: &PathBuf) -> Result<Self> {
        Ok(Self {
            collection: DiskCollection::open(state_dir.join("executions"))?,
        })
    }
}

#[async_trait]
impl ExecutionRepository for DiskExecutionRepository {
    async fn create(&self, execution: Execution) -> Result<Execution> {
        self.collection.put(&execution.id.to_string(), execution.clone())?;
        Ok(execution)
    }

    async fn get(&self, id: Uuid) -> Result<Execution> {
        self.collection.get(&id.to_string()).ok_or_else(|| Error::NotFound(format!("execution {id}")))
    }

    async fn list_by_vm(&self, vm_id: Uuid) -> Result<Vec<Execution>> {
        Ok(self.collection.list().into_iter().filter(|e| e.vm_id == vm_id).collect())
    }
}

// ---------------------------------------------------------------------
// Factories, mirroring `persistence::provider_from_env`
// ---------------------------------------------------------------------

fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ORCVM_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/orcvm");
    }
    PathBuf::from("/tmp/orcvm-state")
}

fn persistence_kind_from_env() -> String {
    std::env::var("ORCVM_PERSISTENCE_PROVIDER")
        .unwrap_or_else(|_| "memory".to_string())
        .to_ascii_lowercase()
}

pub fn vm_repository_from_env() -> Result<Arc<dyn VmRepository>> {
    match persistence_kind_from_env().as_str() {
        "disk" => Ok(Arc::new(DiskVmRepository::new(&default_state_dir())?)),
        _ => Ok(Arc::new(InMemoryVmRepository::new())),
    }
}

pub fn task_repository_from_env() -> Result<Arc<dyn TaskRepository>> {
    match persistence_kind_from_env().as_str() {
        "disk" => Ok(Arc::new(DiskTaskRepository::new(&default_state_dir())?)),
        _ => Ok(Arc::new(InMemoryTaskRepository::new())),
    }
}

pub fn execution_repository_from_env() -> Result<Arc<dyn ExecutionRepository>> {
    match persistence_kind_from_env().as_str() {
        "disk" => Ok(Arc::new(DiskExecutionRepository::new(&default_state_dir())?)),
        _ => Ok(Arc::new(InMemoryExecutionRepository::new())),
    }
}

/// The worker registry is a distributed collaborator per the spec's
/// non-goals; only the in-memory adapter ships here (see `registry` module).
pub fn worker_repository_from_env() -> Arc<dyn WorkerRepository> {
    Arc::new(InMemoryWorkerRepository::new())
}

pub fn worker_metric_repository_from_env() -> Arc<dyn WorkerMetricRepository> {
    Arc::new(InMemoryWorkerMetricRepository::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::BackendKind;

    #[tokio::test]
    async fn in_memory_vm_repository_rejects_duplicate_name() {
        let repo = InMemoryVmRepository::new();
        let vm1 = Vm::new("dup", BackendKind::Type1, "w1");
        let vm2 = Vm::new("dup", BackendKind::Type1, "w1");
        repo.create(vm1).await.unwrap();
        let err = repo.create(vm2).await.unwrap_err();
        assert!(matches!(err, Error::PayloadInvalid(_)));
    }

    #[tokio::test]
    async fn disk_vm_repository_round_trips_via_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DiskVmRepository::new(&dir.path().to_path_buf()).unwrap();
        let vm = Vm::new("v1", BackendKind::Container, "w1");
        let id = vm.id;
        repo.create(vm).await.unwrap();

        let reopened = DiskVmRepository::new(&dir.path().to_path_buf()).unwrap();
        let loaded = reopened.get(id).await.unwrap();
        assert_eq!(loaded.name, "v1");
    }

    #[tokio::test]
    async fn task_repository_next_pending_includes_expired_claims() {
        let repo = InMemoryTaskRepository::new();
        let mut task = Task::new(crate::task::type_tags::VM_EXECUTE, crate::task::Lane::Default, serde_json::Value::Null);
        task.mark_processing("w1", 0); // deadline already in the past
        let id = task.id;
        repo.create(task).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let pending = repo.get_next_pending().await.unwrap();
        assert!(pending.iter().any(|t| t.id == id));
    }
}
