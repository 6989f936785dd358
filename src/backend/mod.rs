//! Backend abstraction for VM execution.
//!
//! Defines the [`VmBackend`] trait implemented by the two backend kinds
//! named in the component design: a type-1 microVM backend fronted by a
//! REST-over-UDS control socket ([`microvm`]), and an OCI container runtime
//! backend driven via CLI ([`container`]). Both expose the same lifecycle
//! contract so the orchestrator registry is backend-agnostic.

pub mod container;
pub mod microvm;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::vm::Vm;
use crate::ExecOutput;

/// Per-call execution parameters, independent of transport details.
#[derive(Debug, Clone, Default)]
pub struct ExecuteParams {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Trait implemented by every VM backend. Each method corresponds to one
/// orchestrator-registry operation; the backend owns the mechanics of
/// realizing it (spawning a hypervisor, driving a container runtime CLI).
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Allocate backend-specific resources (sockets, rootfs clone) and
    /// persist them on `vm`, without starting anything. Leaves `vm.state`
    /// at `Created`.
    async fn create(&self, vm: &mut Vm) -> Result<()>;

    /// Boot the VM. Idempotent when `vm` is already `Running`.
    async fn start(&self, vm: &mut Vm) -> Result<()>;

    /// Stop the VM. `force = false` attempts a graceful shutdown first;
    /// `force = true` always proceeds to killing the backend process.
    /// Forced stop MUST succeed even if a prior graceful attempt errored.
    async fn stop(&self, vm: &mut Vm, force: bool) -> Result<()>;

    /// Stop (if running) and remove every backend-owned artifact.
    async fn delete(&self, vm: &mut Vm) -> Result<()>;

    /// Execute one command inside the VM and wait for the result.
    async fn execute(&self, vm: &Vm, id: Uuid, params: ExecuteParams) -> Result<ExecOutput>;

    /// Whether the backend still considers the VM's process/container alive.
    async fn is_alive(&self, vm: &Vm) -> bool;
}

/// Per-process resource limits applied in the guest, shared across backends.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub max_virtual_memory: u64,
    pub max_open_files: u64,
    pub max_processes: u64,
    pub max_file_size: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_virtual_memory: 4 * 1024 * 1024 * 1024,
            max_open_files: 1024,
            max_processes: 512,
            max_file_size: 100 * 1024 * 1024,
        }
    }
}

/// Construct the backend named by [`crate::config::BackendConfig::selection`].
pub fn create_backend(config: &crate::config::BackendConfig) -> Box<dyn VmBackend> {
    match config.selection {
        crate::config::BackendSelection::Type1 => Box::new(microvm::MicrovmBackend::new(config.clone())),
        crate::config::BackendSelection::Container => Box::new(container::ContainerBackend::new(config.clone())),
    }
}
