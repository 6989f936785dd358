//! Worker core: composes the orchestrator, task queue, and registry client
//! into the running worker process — startup sequence, the three built-in
//! task handlers, and the background timers (heartbeat, idle-VM reaper).

pub mod reaper;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

use crate::backend::create_backend;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;
use crate::orchestrator::Orchestrator;
use crate::queue::{Queue, TaskHandler};
use crate::registry::{InMemoryWorkerRegistry, WorkerRegistry};
use crate::repository::{
    execution_repository_from_env, task_repository_from_env, vm_repository_from_env,
    worker_repository_from_env,
};
use crate::task::{type_tags, Task, TaskResult};
use crate::vm::{BackendKind, Vm};
use crate::worker::{ResourceInventory, Worker, WorkerStatus};

pub struct WorkerCore {
    pub config: Config,
    pub worker_id: String,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<Queue>,
    pub registry: Arc<dyn WorkerRegistry>,
}

impl WorkerCore {
    /// Resolve config, construct the backend, build the orchestrator/queue/
    /// registry, register with the pool, and install the three core
    /// handlers. Does not start the background loops; call [`WorkerCore::run`]
    /// for that.
    pub async fn bootstrap(config: Config) -> crate::error::Result<Self> {
        let backend_kind = match config.backend.selection {
            crate::config::BackendSelection::Type1 => BackendKind::Type1,
            crate::config::BackendSelection::Container => BackendKind::Container,
        };
        let backend = Arc::from(create_backend(&config.backend));

        let vms = vm_repository_from_env()?;
        let executions = execution_repository_from_env()?;
        let tasks = task_repository_from_env()?;
        let workers = worker_repository_from_env();

        let orchestrator = Arc::new(Orchestrator::new(backend, vms, executions));
        let queue = Arc::new(Queue::new(config.queue.clone(), tasks));
        let registry = Arc::new(InMemoryWorkerRegistry::new(workers, config.registry.ttl_ms, config.registry.deregister_after_ms));

        let worker_id = config.worker.id.clone().unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let mut worker = Worker::new(worker_id.clone(), config.worker.hostname.clone(), config.worker.address.clone());
        worker.zone = config.worker.zone.clone();
        worker.capabilities = config.worker.capabilities.clone();
        worker.max_vms = config.worker.max_vms;
        worker.labels = config.worker.labels.iter().cloned().collect();
        worker.resources = ResourceInventory {
            total_cpu_millis: config.worker.cpu_millis_cap,
            total_mem_mb: config.worker.mem_mb_cap,
            total_disk_mb: config.worker.disk_mb_cap,
            ..Default::default()
        };
        registry.register(worker).await?;
        info!(worker = %worker_id, zone = %config.worker.zone, "worker registered");

        let core = Self {
            config,
            worker_id,
            orchestrator,
            queue,
            registry,
        };
        core.install_handlers(backend_kind).await;
        Ok(core)
    }

    async fn install_handlers(&self, backend_kind: BackendKind) {
        self.queue
            .register_handler(
                type_tags::VM_CREATE,
                Arc::new(CreateVmHandler {
                    orchestrator: self.orchestrator.clone(),
                    worker_id: self.worker_id.clone(),
                    backend_kind,
                }),
            )
            .await;
        self.queue
            .register_handler(
                type_tags::VM_EXECUTE,
                Arc::new(ExecuteCommandHandler {
                    orchestrator: self.orchestrator.clone(),
                }),
            )
            .await;
        self.queue
            .register_handler(
                type_tags::VM_DELETE,
                Arc::new(DeleteVmHandler {
                    orchestrator: self.orchestrator.clone(),
                }),
            )
            .await;
    }

    /// Run the queue consumer, heartbeat timer, and idle-VM reaper until
    /// `shutdown` fires, then drain in-flight handlers gracefully.
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        let queue_task = tokio::spawn(self.queue.clone().start(self.worker_id.clone()));

        let heartbeat = {
            let registry = self.registry.clone();
            let worker_id = self.worker_id.clone();
            let shutdown = shutdown.clone();
            let interval_ms = self.config.registry.ttl_ms / 3;
            tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    if let Err(e) = registry.heartbeat(&worker_id).await {
                        error!(error = %e, "heartbeat failed");
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(interval_ms.max(1000))).await;
                }
            })
        };

        let idle_reaper = {
            let orchestrator = self.orchestrator.clone();
            let reaper_config = self.config.reaper.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                reaper::run(orchestrator, reaper_config, shutdown).await;
            })
        };

        let eviction_sweep = {
            let registry = self.registry.clone();
            let shutdown = shutdown.clone();
            let interval_ms = self.config.registry.ttl_ms / 3;
            tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    if let Err(e) = registry.evict_stale(crate::vm::now_ms()).await {
                        error!(error = %e, "eviction sweep failed");
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(interval_ms.max(1000))).await;
                }
            })
        };

        shutdown.cancelled().await;
        self.queue.stop(std::time::Duration::from_secs(30)).await;
        queue_task.abort();
        heartbeat.abort();
        idle_reaper.abort();
        eviction_sweep.abort();
        let _ = self.registry.update_status(&self.worker_id, WorkerStatus::Left).await;
    }

    /// Trigger one idle-VM reaper sweep outside of its normal timer, for the
    /// admin control surface.
    pub async fn reap_now(&self) -> crate::error::Result<usize> {
        reaper::sweep(&self.orchestrator, &self.config.reaper).await
    }
}

#[derive(Debug, Deserialize)]
struct CreateVmPayload {
    name: String,
    #[serde(default)]
    vcpus: Option<u32>,
    #[serde(default)]
    memory_mb: Option<u64>,
}

struct CreateVmHandler {
    orchestrator: Arc<Orchestrator>,
    worker_id: String,
    backend_kind: BackendKind,
}

#[async_trait]
impl TaskHandler for CreateVmHandler {
    async fn handle(&self, task: &Task, cancel: CancelToken) -> TaskResult {
        let started = crate::vm::now_ms();
        let outcome = async {
            let payload: CreateVmPayload = serde_json::from_value(task.payload.clone())
                .map_err(|e| Error::PayloadInvalid(format!("vm:create payload: {e}")))?;
            let mut vm = Vm::new(payload.name, self.backend_kind, self.worker_id.clone());
            if let Some(vcpus) = payload.vcpus {
                vm.vcpus = vcpus;
            }
            if let Some(memory_mb) = payload.memory_mb {
                vm.memory_mb = memory_mb;
            }
            let vm = self.orchestrator.create_vm(vm).await?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.orchestrator.start_vm(vm.id).await
        }
        .await;

        to_task_result(outcome.map(|vm| serde_json::json!({"vm_id": vm.id})), started)
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteCommandPayload {
    vm_id: uuid::Uuid,
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    transient_secrets: Vec<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

struct ExecuteCommandHandler {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl TaskHandler for ExecuteCommandHandler {
    async fn handle(&self, task: &Task, cancel: CancelToken) -> TaskResult {
        let started = crate::vm::now_ms();
        let outcome = async {
            let payload: ExecuteCommandPayload = serde_json::from_value(task.payload.clone())
                .map_err(|e| Error::PayloadInvalid(format!("vm:execute payload: {e}")))?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (output, _execution) = self
                .orchestrator
                .execute_command(
                    payload.vm_id,
                    payload.program,
                    payload.args,
                    payload.env,
                    payload.transient_secrets,
                    payload.timeout_secs,
                )
                .await?;
            Ok::<_, Error>(serde_json::json!({
                "exit_code": output.exit_code,
                "stdout": output.stdout_str(),
                "stderr": output.stderr_str(),
            }))
        }
        .await;

        to_task_result(outcome, started)
    }
}

#[derive(Debug, Deserialize)]
struct DeleteVmPayload {
    vm_id: uuid::Uuid,
}

struct DeleteVmHandler {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl TaskHandler for DeleteVmHandler {
    async fn handle(&self, task: &Task, cancel: CancelToken) -> TaskResult {
        let started = crate::vm::now_ms();
        let outcome = async {
            let payload: DeleteVmPayload = serde_json::from_value(task.payload.clone())
                .map_err(|e| Error::PayloadInvalid(format!("vm:delete payload: {e}")))?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.orchestrator.delete_vm(payload.vm_id).await?;
            Ok::<_, Error>(serde_json::json!({"vm_id": payload.vm_id}))
        }
        .await;

        to_task_result(outcome, started)
    }
}

fn to_task_result(outcome: Result<serde_json::Value, Error>, started_at_ms: u64) -> TaskResult {
    let duration_ms = crate::vm::now_ms().saturating_sub(started_at_ms);
    match outcome {
        Ok(result) => TaskResult {
            success: true,
            result,
            error: None,
            duration_ms,
            started_at_ms,
        },
        Err(e) => TaskResult {
            success: false,
            result: serde_json::Value::Null,
            error: Some(e.to_string()),
            duration_ms,
            started_at_ms,
        },
    }
}
