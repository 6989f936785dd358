//! orcvm: a distributed microVM orchestration platform.
//!
//! A worker-side runtime that creates, starts, executes commands in, and
//! tears down short-lived microVMs (or OCI containers) on demand, driven by
//! a priority-lane task queue and coordinated across a pool of workers via
//! a TTL-heartbeat registry.
//!
//! # Example: driving a VM directly through the orchestrator
//!
//! ```no_run
//! use orcvm::backend::create_backend;
//! use orcvm::config::BackendConfig;
//! use orcvm::orchestrator::Orchestrator;
//! use orcvm::repository::{InMemoryExecutionRepository, InMemoryVmRepository};
//! use orcvm::vm::{BackendKind, Vm};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::from(create_backend(&BackendConfig::default()));
//!     let orchestrator = Orchestrator::new(
//!         backend,
//!         Arc::new(InMemoryVmRepository::new()),
//!         Arc::new(InMemoryExecutionRepository::new()),
//!     );
//!
//!     let vm = orchestrator.create_vm(Vm::new("demo", BackendKind::Type1, "worker-a")).await?;
//!     let vm = orchestrator.start_vm(vm.id).await?;
//!     let (output, _execution) = orchestrator
//!         .execute_command(vm.id, "echo".into(), vec!["hello".into()], vec![], vec![], None)
//!         .await?;
//!     println!("stdout: {}", output.stdout_str());
//!     orchestrator.delete_vm(vm.id).await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod execution;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod task;
pub mod transport;
pub mod vm;
pub mod worker;
pub mod worker_core;

pub use error::{Error, Result};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::config::Config;
    pub use crate::error::{ApiError, Error, Result};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::queue::{Queue, TaskHandler};
    pub use crate::registry::{InMemoryWorkerRegistry, WorkerRegistry};
    pub use crate::task::{Lane, Task, TaskResult};
    pub use crate::vm::{BackendKind, Vm, VmState};
    pub use crate::worker::Worker;
    pub use crate::worker_core::WorkerCore;
    pub use crate::ExecOutput;
}

/// Output of one command executed inside a VM.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32) -> Self {
        Self { stdout, stderr, exit_code }
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_reports_success_on_zero_exit() {
        let output = ExecOutput::new(b"hello\n".to_vec(), Vec::new(), 0);
        assert!(output.success());
        assert_eq!(output.stdout_str(), "hello\n");
    }

    #[test]
    fn exec_output_reports_failure_on_nonzero_exit() {
        let output = ExecOutput::new(Vec::new(), b"failed\n".to_vec(), 1);
        assert!(!output.success());
        assert_eq!(output.stderr_str(), "failed\n");
    }
}
