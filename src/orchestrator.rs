//! Orchestrator registry: in-memory index of VMs owned by the current
//! worker, protected by a reader/writer lock with per-VM mutexes so
//! concurrent operations on *different* VMs never block each other.
//!
//! Grounded on `backend::kvm`'s pattern of guarding a single backend handle
//! behind `Arc<Mutex<_>>`/`Arc<RwLock<_>>`, generalized from one VM to a
//! keyed map.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::backend::{ExecuteParams, VmBackend};
use crate::error::{Error, Result};
use crate::execution::Execution;
use crate::repository::{ExecutionRepository, VmRepository};
use crate::vm::{Vm, VmFilter, VmState};
use crate::ExecOutput;

/// A per-VM lock guarding mutation of that VM's fields, keyed by id.
struct VmEntry {
    lock: Arc<Mutex<()>>,
}

pub struct Orchestrator {
    index: RwLock<HashMap<Uuid, VmEntry>>,
    backend: Arc<dyn VmBackend>,
    vms: Arc<dyn VmRepository>,
    executions: Arc<dyn ExecutionRepository>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn VmBackend>, vms: Arc<dyn VmRepository>, executions: Arc<dyn ExecutionRepository>) -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            backend,
            vms,
            executions,
        }
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut index = self.index.write().await;
        index
            .entry(id)
            .or_insert_with(|| VmEntry { lock: Arc::new(Mutex::new(())) })
            .lock
            .clone()
    }

    pub async fn create_vm(&self, mut vm: Vm) -> Result<Vm> {
        let per_vm_lock = self.lock_for(vm.id).await;
        let _guard = per_vm_lock.lock().await;

        if let Err(e) = self.backend.create(&mut vm).await {
            self.index.write().await.remove(&vm.id);
            return Err(e);
        }

        let mut for_rollback = vm.clone();
        match self.vms.create(vm).await {
            Ok(vm) => Ok(vm),
            Err(e) => {
                // The repository insert lost the race (e.g. duplicate name);
                // the backend already staged real artifacts for this attempt
                // (rootfs clone, control socket path) and they must not leak.
                if let Err(rollback_err) = self.backend.delete(&mut for_rollback).await {
                    tracing::warn!(vm = %for_rollback.id, error = %rollback_err, "failed to roll back backend artifacts after duplicate create");
                }
                self.index.write().await.remove(&for_rollback.id);
                Err(e)
            }
        }
    }

    pub async fn start_vm(&self, id: Uuid) -> Result<Vm> {
        let per_vm_lock = self.lock_for(id).await;
        let _guard = per_vm_lock.lock().await;

        let mut vm = self.vms.get(id).await?;
        if vm.state == VmState::Running {
            return Ok(vm); // idempotent start
        }
        vm.transition(VmState::Starting)?;
        self.vms.update(vm.clone()).await?;

        match self.backend.start(&mut vm).await {
            Ok(()) => {
                vm.transition(VmState::Running)?;
                self.vms.update(vm).await
            }
            Err(e) => {
                // partial VM is torn down; the error surfaces as the backend's own kind.
                let _ = self.backend.delete(&mut vm).await;
                vm.transition(VmState::Failed)?;
                let _ = self.vms.update(vm).await;
                Err(e)
            }
        }
    }

    pub async fn stop_vm(&self, id: Uuid, force: bool) -> Result<Vm> {
        let per_vm_lock = self.lock_for(id).await;
        let _guard = per_vm_lock.lock().await;

        let mut vm = self.vms.get(id).await?;
        vm.transition(VmState::Stopping)?;
        self.vms.update(vm.clone()).await?;

        // Force stop MUST succeed even if graceful stop previously errored.
        if let Err(e) = self.backend.stop(&mut vm, force).await {
            if !force {
                return Box::pin(self.stop_vm(id, true)).await;
            }
            return Err(e);
        }
        vm.transition(VmState::Stopped)?;
        self.vms.update(vm).await
    }

    pub async fn delete_vm(&self, id: Uuid) -> Result<()> {
        let per_vm_lock = self.lock_for(id).await;
        let _guard = per_vm_lock.lock().await;

        let mut vm = self.vms.get(id).await?;
        if vm.state == VmState::Running {
            self.backend.stop(&mut vm, true).await.ok();
            // Reflect the stop locally so `backend.delete` doesn't see a
            // stale `Running` state and re-issue a second stop against
            // backend-owned resources the first call already tore down
            // (e.g. a container runtime's forced delete is not idempotent).
            vm.state = VmState::Stopped;
        }
        self.backend.delete(&mut vm).await?;
        self.vms.delete(id).await?;
        self.index.write().await.remove(&id);
        Ok(())
    }

    pub async fn get_vm(&self, id: Uuid) -> Result<Vm> {
        self.vms.get(id).await
    }

    pub async fn list_vms(&self) -> Result<Vec<Vm>> {
        self.vms.list(&VmFilter::default()).await
    }

    /// Health snapshot: VMs marked Running whose backend process/container
    /// is no longer alive.
    pub async fn health(&self) -> Result<Vec<Uuid>> {
        let mut unhealthy = Vec::new();
        for vm in self.vms.list(&VmFilter { state: Some(VmState::Running), ..Default::default() }).await? {
            if !self.backend.is_alive(&vm).await {
                unhealthy.push(vm.id);
            }
        }
        Ok(unhealthy)
    }

    /// Open a transport connection, send one request, await one reply,
    /// close — persisting an Execution record with env but never the
    /// transient secrets.
    pub async fn execute_command(
        &self,
        id: Uuid,
        program: String,
        args: Vec<String>,
        env: Vec<String>,
        transient_secrets: Vec<String>,
        timeout_secs: Option<u64>,
    ) -> Result<(ExecOutput, Execution)> {
        let vm = self.vms.get(id).await?;

        let mut merged_env = env.clone();
        merged_env.extend(transient_secrets.iter().cloned());

        let mut execution = Execution::new(id, program.clone(), args.clone());
        execution.record_env(env, !transient_secrets.is_empty());

        let output = self
            .backend
            .execute(
                &vm,
                execution.id,
                ExecuteParams {
                    program,
                    args,
                    env: merged_env,
                    timeout_secs,
                },
            )
            .await?;

        execution.finish(output.exit_code, output.stdout_str(), output.stderr_str());
        let saved = self.executions.create(execution).await?;

        let mut vm = vm;
        vm.touch();
        let _ = self.vms.update(vm).await;

        Ok((output, saved))
    }
}
