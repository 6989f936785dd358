//! Type-1 microVM backend: spawns a Firecracker-shaped hypervisor process
//! and configures it over a REST-over-UDS control socket.
//!
//! Grounded on the Firecracker spawn/control pattern (`FirecrackerVM` /
//! `FirecrackerApiClient` in the pack): spawn the binary with `--api-sock
//! <path>`, poll for the socket to become connectable, then PUT
//! configuration resources before issuing `InstanceStart`.
//!
//! The PUT bodies are sent over a hand-rolled minimal HTTP/1.1-over-UDS
//! writer (see [`uds_http::put_json`]) rather than a new HTTP-over-UDS crate
//! dependency — logged as the one ambient-seam substitution in `DESIGN.md`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{ExecuteParams, VmBackend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::vm::{Vm, VmState};
use crate::ExecOutput;

mod uds_http;

struct ProcessState {
    child: Option<Child>,
}

/// Mandatory boot args per the component design: serial console on ttyS0,
/// `reboot=k`, `panic=1`, `pci=off`.
const MANDATORY_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

pub struct MicrovmBackend {
    config: BackendConfig,
    processes: Arc<AsyncMutex<HashMap<Uuid, ProcessState>>>,
}

impl MicrovmBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            processes: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    fn control_socket_path(&self, vm_id: Uuid) -> PathBuf {
        self.config.socket_dir.join(format!("vm-{vm_id}.sock"))
    }

    fn vsock_device_path(&self, vm_id: Uuid) -> PathBuf {
        self.config.socket_dir.join(format!("vm-{vm_id}.sock.vsock"))
    }

    fn rootfs_clone_path(&self, vm_id: Uuid) -> PathBuf {
        self.config.socket_dir.join(format!("vm-{vm_id}.rootfs"))
    }

    async fn wait_for_socket(path: &PathBuf, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if path.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::TimeoutExceeded(format!(
            "control socket {} did not appear within {:?}",
            path.display(),
            deadline
        )))
    }
}

#[async_trait]
impl VmBackend for MicrovmBackend {
    async fn create(&self, vm: &mut Vm) -> Result<()> {
        std::fs::create_dir_all(&self.config.socket_dir)
            .map_err(|e| Error::BackendFailure(format!("failed to create socket dir: {e}")))?;

        let control_socket = self.control_socket_path(vm.id);
        let rootfs_clone = self.rootfs_clone_path(vm.id);
        std::fs::copy(&self.config.rootfs_template, &rootfs_clone)
            .map_err(|e| Error::BackendFailure(format!("failed to stage rootfs clone: {e}")))?;

        vm.control_socket_path = Some(control_socket);
        vm.rootfs_path = Some(rootfs_clone);
        vm.kernel_path = Some(self.config.kernel_path.clone());
        vm.tcp_fallback_addr = self
            .config
            .tap_ip
            .as_ref()
            .map(|ip| format!("{ip}:{}", orcvm_protocol::GUEST_AGENT_PORT));
        if vm.vcpus == 0 {
            vm.vcpus = self.config.default_vcpus;
        }
        if vm.memory_mb == 0 {
            vm.memory_mb = self.config.default_memory_mb;
        }
        // state stays Created; caller (orchestrator) drives the transition.
        Ok(())
    }

    async fn start(&self, vm: &mut Vm) -> Result<()> {
        if vm.state == VmState::Running {
            return Ok(()); // idempotent start
        }

        let control_socket = vm
            .control_socket_path
            .clone()
            .ok_or_else(|| Error::InvalidState("VM has no control socket; call create first".into()))?;
        let _ = std::fs::remove_file(&control_socket);

        let child = Command::new(&self.config.hypervisor_binary)
            .arg("--api-sock")
            .arg(&control_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::BackendFailure(format!("failed to spawn hypervisor: {e}")))?;

        if let Err(e) = Self::wait_for_socket(&control_socket, Duration::from_secs(5)).await {
            let _ = std::fs::remove_file(&control_socket);
            return Err(e);
        }

        let rootfs = vm
            .rootfs_path
            .clone()
            .ok_or_else(|| Error::InvalidState("VM has no rootfs".into()))?;
        let kernel = vm
            .kernel_path
            .clone()
            .ok_or_else(|| Error::InvalidState("VM has no kernel".into()))?;

        let configure = async {
            uds_http::put_json(
                &control_socket,
                "/machine-config",
                &json!({ "vcpu_count": vm.vcpus, "mem_size_mib": vm.memory_mb }),
            )
            .await?;
            uds_http::put_json(
                &control_socket,
                "/boot-source",
                &json!({ "kernel_image_path": kernel, "boot_args": MANDATORY_BOOT_ARGS }),
            )
            .await?;
            uds_http::put_json(
                &control_socket,
                "/drives/rootfs",
                &json!({ "drive_id": "rootfs", "path_on_host": rootfs, "is_root_device": true, "is_read_only": false }),
            )
            .await?;
            uds_http::put_json(
                &control_socket,
                "/vsock",
                &json!({ "guest_cid": vm.guest_cid, "uds_path": self.vsock_device_path(vm.id) }),
            )
            .await?;
            uds_http::put_json(&control_socket, "/actions", &json!({ "action_type": "InstanceStart" })).await
        }
        .await;

        if let Err(e) = configure {
            let mut child = child;
            let _ = child.kill().await;
            let _ = std::fs::remove_file(&control_socket);
            return Err(Error::BackendFailure(format!("start failed: {e}")));
        }

        {
            let mut processes = self.processes.lock().await;
            processes.insert(vm.id, ProcessState { child: Some(child) });
        }

        self.spawn_reaper(vm.id);
        Ok(())
    }

    async fn stop(&self, vm: &mut Vm, force: bool) -> Result<()> {
        if let Some(control_socket) = vm.control_socket_path.clone() {
            if !force {
                if let Err(e) = uds_http::put_json(&control_socket, "/actions", &json!({ "action_type": "SendCtrlAltDel" })).await {
                    warn!(vm = %vm.id, error = %e, "graceful shutdown failed, will force if requested");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        let mut processes = self.processes.lock().await;
        if let Some(state) = processes.get_mut(&vm.id) {
            if let Some(mut child) = state.child.take() {
                let _ = child.kill().await;
            }
        }
        Ok(())
    }

    async fn delete(&self, vm: &mut Vm) -> Result<()> {
        if vm.state == VmState::Running {
            self.stop(vm, true).await?;
        }
        self.processes.lock().await.remove(&vm.id);

        if let Some(path) = &vm.control_socket_path {
            let _ = std::fs::remove_file(path);
        }
        if let Some(path) = &vm.rootfs_path {
            let _ = std::fs::remove_file(path);
        }
        let _ = std::fs::remove_file(self.vsock_device_path(vm.id));
        Ok(())
    }

    async fn execute(&self, vm: &Vm, id: Uuid, params: ExecuteParams) -> Result<ExecOutput> {
        let deadline = Duration::from_secs(params.timeout_secs.unwrap_or(30));
        let mut transport =
            Transport::connect(vm.guest_cid, orcvm_protocol::GUEST_AGENT_PORT, vm.tcp_fallback_addr.as_deref(), deadline).await?;
        let request = orcvm_protocol::AgentRequest::new(params.program.clone())
            .with_args(params.args.clone())
            .with_env(params.env.clone());
        info!(vm = %vm.id, execution = %id, cmd = %params.program, "executing command in guest");
        let response = transport.roundtrip(&request)?;
        Ok(ExecOutput::new(
            response.stdout.into_bytes(),
            response.stderr.into_bytes(),
            response.exit_code,
        ))
    }

    async fn is_alive(&self, vm: &Vm) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(&vm.id) {
            Some(state) => match &mut state.child {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            },
            None => false,
        }
    }
}

impl MicrovmBackend {
    /// Asynchronously wait for the hypervisor child: on unexpected exit the
    /// caller (orchestrator) observes `is_alive() == false` on its next
    /// health probe and flips the VM to `Failed`; this task's only job is to
    /// reap the exited child so it does not linger as a zombie.
    fn spawn_reaper(&self, vm_id: Uuid) {
        let processes = self.processes.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let mut processes = processes.lock().await;
                let Some(state) = processes.get_mut(&vm_id) else {
                    return;
                };
                let Some(child) = state.child.as_mut() else {
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!(vm = %vm_id, ?status, "hypervisor process exited unexpectedly");
                        state.child = None;
                        return;
                    }
                    Ok(None) => continue,
                    Err(_) => return,
                }
            }
        });
    }
}
