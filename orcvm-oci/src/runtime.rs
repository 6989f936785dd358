//! Drives an OCI-compatible container runtime CLI (runc/crun-shaped) as a
//! child process.
//!
//! Unlike the type-1 microVM backend, which configures a running hypervisor
//! over a long-lived REST-over-UDS control socket, OCI runtimes expose a
//! CLI + on-disk state-dir contract: `create` materializes a container from a
//! bundle directory, `start` runs its entrypoint, `exec` runs an additional
//! process inside the running container's namespaces, `delete` tears it down.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{OciError, Result};

/// Output captured from a single runtime invocation.
#[derive(Debug, Clone)]
pub struct RuntimeOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// OCI runtime `config.json` process spec, trimmed to the fields the
/// orchestrator needs to set per invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

/// Drives a single container's lifecycle via the runtime binary.
///
/// `binary` is configurable (`runc`, `crun`, ...); `bundle_dir` holds the
/// OCI bundle (`config.json` + `rootfs/`) produced from a pulled image.
pub struct ContainerHandle {
    binary: PathBuf,
    container_id: String,
    bundle_dir: PathBuf,
    state_dir: PathBuf,
}

impl ContainerHandle {
    pub fn new(
        binary: impl Into<PathBuf>,
        container_id: impl Into<String>,
        bundle_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            container_id: container_id.into(),
            bundle_dir: bundle_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// `runc create --bundle <dir> --pid-file <file> <id>`
    pub async fn create(&self) -> Result<()> {
        info!(id = %self.container_id, "creating container");
        let pid_file = self.state_dir.join(format!("{}.pid", self.container_id));
        let output = self
            .run(&[
                "create",
                "--bundle",
                &self.bundle_dir.to_string_lossy(),
                "--pid-file",
                &pid_file.to_string_lossy(),
                &self.container_id,
            ])
            .await?;
        self.check(output, "create")
    }

    /// `runc start <id>`
    pub async fn start(&self) -> Result<()> {
        info!(id = %self.container_id, "starting container");
        let output = self.run(&["start", &self.container_id]).await?;
        self.check(output, "start")
    }

    /// `runc exec --cwd <cwd> <id> <args...>` with the given environment.
    pub async fn exec(&self, spec: &ProcessSpec) -> Result<RuntimeOutput> {
        debug!(id = %self.container_id, args = ?spec.args, "exec in container");
        let mut args: Vec<String> = vec![
            "exec".to_string(),
            "--cwd".to_string(),
            spec.cwd.clone(),
        ];
        for kv in &spec.env {
            args.push("--env".to_string());
            args.push(kv.clone());
        }
        args.push(self.container_id.clone());
        args.extend(spec.args.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs).await
    }

    /// `runc kill <id> KILL` followed by `runc delete <id>`. Force-delete
    /// always proceeds to removing runtime state even if kill fails, so the
    /// container cannot be left as an orphaned state-dir entry.
    pub async fn delete(&self) -> Result<()> {
        info!(id = %self.container_id, "deleting container");
        if let Err(e) = self.run(&["kill", &self.container_id, "KILL"]).await {
            warn!(id = %self.container_id, error = %e, "kill failed before delete, continuing");
        }
        let output = self.run(&["delete", "--force", &self.container_id]).await?;
        self.check(output, "delete")
    }

    async fn run(&self, args: &[&str]) -> Result<RuntimeOutput> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| OciError::Registry(format!("failed to spawn {:?}: {}", self.binary, e)))?;

        Ok(RuntimeOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn check(&self, output: RuntimeOutput, op: &str) -> Result<()> {
        if output.exit_code != 0 {
            return Err(OciError::Registry(format!(
                "runtime {} failed (exit {}): {}",
                op,
                output.exit_code,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Write a minimal OCI `config.json` into `bundle_dir`, pointing `rootfs` to
/// the already-unpacked image rootfs (bind-mounted or copied by the caller).
pub fn write_bundle_config(
    bundle_dir: &Path,
    rootfs_rel: &str,
    process: &ProcessSpec,
    hostname: &str,
) -> Result<()> {
    let config = serde_json::json!({
        "ociVersion": "1.0.2",
        "root": { "path": rootfs_rel, "readonly": false },
        "hostname": hostname,
        "process": {
            "terminal": false,
            "args": process.args,
            "env": process.env,
            "cwd": process.cwd,
        },
        "linux": {
            "namespaces": [
                { "type": "pid" },
                { "type": "mount" },
                { "type": "ipc" },
                { "type": "uts" },
            ]
        }
    });
    std::fs::create_dir_all(bundle_dir)?;
    std::fs::write(
        bundle_dir.join("config.json"),
        serde_json::to_vec_pretty(&config)?,
    )?;
    Ok(())
}
