//! Orchestration contract: the VM lifecycle state machine and error taxonomy
//! behave correctly when driven entirely through the public `orcvm` API,
//! independent of any specific backend implementation.

mod common;

use common::fake_backend;
use orcvm::error::{ApiError, ApiErrorCode, Error};
use orcvm::orchestrator::Orchestrator;
use orcvm::repository::{InMemoryExecutionRepository, InMemoryVmRepository};
use orcvm::vm::{BackendKind, Vm, VmState};
use std::sync::Arc;

fn orchestrator() -> Orchestrator {
    Orchestrator::new(fake_backend(), Arc::new(InMemoryVmRepository::new()), Arc::new(InMemoryExecutionRepository::new()))
}

#[tokio::test]
async fn full_lifecycle_create_start_execute_stop_delete() {
    let orch = orchestrator();
    let vm = orch.create_vm(Vm::new("contract-vm", BackendKind::Type1, "worker-a")).await.unwrap();
    assert_eq!(vm.state, VmState::Created);

    let vm = orch.start_vm(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Running);

    let (output, execution) = orch
        .execute_command(vm.id, "echo".into(), vec!["hi".into()], vec![], vec![], None)
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(execution.vm_id, vm.id);

    let vm = orch.stop_vm(vm.id, false).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);

    orch.delete_vm(vm.id).await.unwrap();
    let err = orch.get_vm(vm.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn not_found_error_maps_to_non_retryable_api_error() {
    let orch = orchestrator();
    let err = orch.get_vm(uuid::Uuid::now_v7()).await.unwrap_err();
    let api: ApiError = (&err).into();
    assert_eq!(api.code, ApiErrorCode::NotFound);
    assert!(!api.retryable);
}

#[tokio::test]
async fn health_reports_vms_whose_backend_died() {
    use common::FakeBackend;
    use std::sync::atomic::Ordering;

    let backend = Arc::new(FakeBackend::new());
    let orch = Orchestrator::new(
        backend.clone(),
        Arc::new(InMemoryVmRepository::new()),
        Arc::new(InMemoryExecutionRepository::new()),
    );
    let vm = orch.create_vm(Vm::new("v1", BackendKind::Type1, "worker-a")).await.unwrap();
    let vm = orch.start_vm(vm.id).await.unwrap();

    assert!(orch.health().await.unwrap().is_empty());

    backend.alive.store(false, Ordering::SeqCst);
    let unhealthy = orch.health().await.unwrap();
    assert_eq!(unhealthy, vec![vm.id]);
}

#[tokio::test]
async fn concurrent_duplicate_name_create_only_one_wins() {
    let orch = orchestrator();
    let a = Vm::new("dup", BackendKind::Type1, "worker-a");
    let b = Vm::new("dup", BackendKind::Type1, "worker-a");
    let (r1, r2) = tokio::join!(orch.create_vm(a), orch.create_vm(b));
    assert_eq!([r1.is_ok(), r2.is_ok()].into_iter().filter(|ok| *ok).count(), 1);
}
