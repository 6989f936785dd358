//! OCI container runtime backend: implements the same lifecycle contract as
//! [`super::microvm::MicrovmBackend`] but backed by an OCI runtime CLI
//! (`runc`/`crun`-shaped) instead of a hypervisor control socket. No guest
//! agent is involved — `execute` drives the runtime's native `exec`
//! subcommand directly, per the component design.

use std::path::PathBuf;

use async_trait::async_trait;
use orcvm_oci::runtime::{ContainerHandle, ProcessSpec};
use orcvm_oci::OciClient;
use uuid::Uuid;

use crate::backend::{ExecuteParams, VmBackend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::vm::{Vm, VmState};
use crate::ExecOutput;

pub struct ContainerBackend {
    config: BackendConfig,
    oci: OciClient,
}

impl ContainerBackend {
    pub fn new(config: BackendConfig) -> Self {
        let cache_dir = config.socket_dir.join("oci-cache");
        Self {
            oci: OciClient::new(cache_dir),
            config,
        }
    }

    fn bundle_dir(&self, vm_id: Uuid) -> PathBuf {
        self.config.socket_dir.join(format!("ctr-{vm_id}/bundle"))
    }

    fn state_dir(&self, vm_id: Uuid) -> PathBuf {
        self.config.socket_dir.join(format!("ctr-{vm_id}/state"))
    }

    fn handle(&self, vm_id: Uuid) -> ContainerHandle {
        ContainerHandle::new(
            self.config.container_runtime_binary.clone(),
            vm_id.to_string(),
            self.bundle_dir(vm_id),
            self.state_dir(vm_id),
        )
    }
}

#[async_trait]
impl VmBackend for ContainerBackend {
    async fn create(&self, vm: &mut Vm) -> Result<()> {
        let rootfs = self.oci.resolve_rootfs(&self.config.container_image).await?;
        let bundle_dir = self.bundle_dir(vm.id);
        let state_dir = self.state_dir(vm.id);
        std::fs::create_dir_all(&state_dir).map_err(|e| Error::BackendFailure(format!("create state dir: {e}")))?;

        orcvm_oci::runtime::write_bundle_config(
            &bundle_dir,
            &rootfs.to_string_lossy(),
            &ProcessSpec {
                args: vec!["/bin/sleep".to_string(), "infinity".to_string()],
                env: Vec::new(),
                cwd: "/".to_string(),
            },
            &vm.name,
        )?;

        vm.rootfs_path = Some(rootfs);
        vm.control_socket_path = None;
        Ok(())
    }

    async fn start(&self, vm: &mut Vm) -> Result<()> {
        if vm.state == VmState::Running {
            return Ok(());
        }
        let handle = self.handle(vm.id);
        handle.create().await?;
        handle.start().await?;
        Ok(())
    }

    async fn stop(&self, vm: &mut Vm, _force: bool) -> Result<()> {
        // runc's delete --force doubles as a forced stop; a graceful stop
        // has no separate primitive in the runtime CLI contract, so both
        // paths converge on delete during `stop`, matching the container
        // backend's "same state machine" requirement without leaving a
        // container running that `Vm::state` claims is Stopped.
        let handle = self.handle(vm.id);
        handle.delete().await?;
        Ok(())
    }

    async fn delete(&self, vm: &mut Vm) -> Result<()> {
        if vm.state == VmState::Running {
            self.stop(vm, true).await?;
        }
        let _ = tokio::fs::remove_dir_all(self.bundle_dir(vm.id).parent().unwrap_or(&self.bundle_dir(vm.id))).await;
        Ok(())
    }

    async fn execute(&self, vm: &Vm, _id: Uuid, params: ExecuteParams) -> Result<ExecOutput> {
        let handle = self.handle(vm.id);
        let mut args = vec![params.program.clone()];
        args.extend(params.args.clone());
        let output = handle
            .exec(&ProcessSpec {
                args,
                env: params.env.clone(),
                cwd: "/".to_string(),
            })
            .await?;
        Ok(ExecOutput::new(output.stdout, output.stderr, output.exit_code))
    }

    async fn is_alive(&self, vm: &Vm) -> bool {
        let state_dir = self.state_dir(vm.id);
        state_dir.exists()
    }
}
