//! End-to-end: a task-driven VM lifecycle through the queue, orchestrator,
//! and registry together, the same composition `WorkerCore` wires up
//! internally but exercised here against a fake backend so the test needs
//! no real hypervisor or container runtime on the host.

#[path = "../common/mod.rs"]
mod common;

use async_trait::async_trait;
use common::fake_backend;
use orcvm::cancel::CancelToken;
use orcvm::config::QueueConfig;
use orcvm::orchestrator::Orchestrator;
use orcvm::queue::{Queue, TaskHandler};
use orcvm::registry::{InMemoryWorkerRegistry, WorkerRegistry};
use orcvm::repository::{InMemoryExecutionRepository, InMemoryTaskRepository, InMemoryVmRepository, InMemoryWorkerRepository};
use orcvm::task::{type_tags, Lane, Task, TaskResult, TaskStatus};
use orcvm::vm::{BackendKind, Vm, VmState};
use orcvm::worker::Worker;
use std::sync::Arc;
use std::time::Duration;

struct CreateHandler(Arc<Orchestrator>);

#[async_trait]
impl TaskHandler for CreateHandler {
    async fn handle(&self, task: &Task, _cancel: CancelToken) -> TaskResult {
        let started = orcvm::vm::now_ms();
        let name = task.payload["name"].as_str().unwrap_or("unnamed").to_string();
        let outcome = async {
            let vm = self.0.create_vm(Vm::new(name, BackendKind::Type1, "worker-a")).await?;
            self.0.start_vm(vm.id).await
        }
        .await;
        match outcome {
            Ok(vm) => TaskResult { success: true, result: serde_json::json!({"vm_id": vm.id}), error: None, duration_ms: 0, started_at_ms: started },
            Err(e) => TaskResult { success: false, result: serde_json::Value::Null, error: Some(e.to_string()), duration_ms: 0, started_at_ms: started },
        }
    }
}

struct DeleteHandler(Arc<Orchestrator>);

#[async_trait]
impl TaskHandler for DeleteHandler {
    async fn handle(&self, task: &Task, _cancel: CancelToken) -> TaskResult {
        let started = orcvm::vm::now_ms();
        let vm_id: uuid::Uuid = serde_json::from_value(task.payload["vm_id"].clone()).unwrap();
        match self.0.delete_vm(vm_id).await {
            Ok(()) => TaskResult { success: true, result: serde_json::Value::Null, error: None, duration_ms: 0, started_at_ms: started },
            Err(e) => TaskResult { success: false, result: serde_json::Value::Null, error: Some(e.to_string()), duration_ms: 0, started_at_ms: started },
        }
    }
}

#[tokio::test]
async fn queue_driven_create_and_delete_reaches_orchestrator_state() {
    let orchestrator = Arc::new(Orchestrator::new(
        fake_backend(),
        Arc::new(InMemoryVmRepository::new()),
        Arc::new(InMemoryExecutionRepository::new()),
    ));
    let registry = Arc::new(InMemoryWorkerRegistry::new(Arc::new(InMemoryWorkerRepository::new()), 30_000, 0));
    registry.register(Worker::new("worker-a", "host-a", "10.0.0.1:9000")).await.unwrap();

    let queue = Arc::new(Queue::new(QueueConfig { concurrency: 2, ..QueueConfig::default() }, Arc::new(InMemoryTaskRepository::new())));
    queue.register_handler(type_tags::VM_CREATE, Arc::new(CreateHandler(orchestrator.clone()))).await;
    queue.register_handler(type_tags::VM_DELETE, Arc::new(DeleteHandler(orchestrator.clone()))).await;

    let create_task = Task::new(type_tags::VM_CREATE, Lane::High, serde_json::json!({"name": "e2e-vm"}));
    let create_id = create_task.id;
    queue.enqueue(create_task).await.unwrap();

    let consumer = tokio::spawn(queue.clone().start("worker-a".to_string()));

    let vm_id = wait_for(Duration::from_secs(2), || async {
        let vms = orchestrator.list_vms().await.unwrap();
        vms.iter().find(|v| v.name == "e2e-vm" && v.state == VmState::Running).map(|v| v.id)
    })
    .await
    .expect("vm never reached Running");

    let created = queue.list_tasks(&Default::default()).await.unwrap().into_iter().find(|t| t.id == create_id).unwrap();
    assert_eq!(created.status, TaskStatus::Completed);

    let delete_task = Task::new(type_tags::VM_DELETE, Lane::High, serde_json::json!({"vm_id": vm_id}));
    queue.enqueue(delete_task).await.unwrap();

    wait_for(Duration::from_secs(2), || async { orchestrator.get_vm(vm_id).await.err().map(|_| ()) })
        .await
        .expect("vm was never deleted");

    queue.stop(Duration::from_secs(1)).await;
    consumer.abort();
}

async fn wait_for<F, Fut, T>(timeout: Duration, mut poll: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(v) = poll().await {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .ok()
}
