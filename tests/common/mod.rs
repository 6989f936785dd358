//! Shared test doubles for the integration suite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use orcvm::backend::{ExecuteParams, VmBackend};
use orcvm::error::Result;
use orcvm::vm::Vm;
use orcvm::ExecOutput;
use uuid::Uuid;

/// A backend that never touches the filesystem or spawns a process, so the
/// suite can exercise orchestrator/queue/registry wiring without a real
/// hypervisor or container runtime present.
pub struct FakeBackend {
    pub fail_start: AtomicBool,
    pub alive: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self { fail_start: AtomicBool::new(false), alive: AtomicBool::new(true) }
    }
}

#[async_trait]
impl VmBackend for FakeBackend {
    async fn create(&self, _vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _vm: &mut Vm) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(orcvm::error::Error::BackendFailure("simulated boot failure".into()));
        }
        Ok(())
    }

    async fn stop(&self, _vm: &mut Vm, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _vm: &Vm, _id: Uuid, params: ExecuteParams) -> Result<ExecOutput> {
        Ok(ExecOutput::new(format!("ran {}\n", params.program).into_bytes(), Vec::new(), 0))
    }

    async fn is_alive(&self, _vm: &Vm) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub fn fake_backend() -> Arc<dyn VmBackend> {
    Arc::new(FakeBackend::new())
}
