//! Local admin control surface: a narrow, single-operator UDS endpoint for
//! `orcvmctl` to list VMs/tasks and trigger an off-cycle reap. NDJSON-framed
//! like the guest protocol, but its own request/response shapes — this is
//! not a REST/WebSocket gateway, just a local inspection socket.
//!
//! Blocking, thread-per-connection, mirroring the guest agent's own vsock
//! listener style rather than bridging into the async runtime — the admin
//! surface serves at most one operator at a time and NDJSON framing is
//! already written against `std::io::BufRead`.

use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::worker_core::WorkerCore;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminRequest {
    ListVms,
    ListTasks,
    Reap,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: String,
    pub name: String,
    pub state: String,
    pub owning_worker_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub type_tag: String,
    pub status: String,
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdminResponse {
    Vms { vms: Vec<VmSummary> },
    Tasks { tasks: Vec<TaskSummary> },
    Reaped { count: usize },
    Error { message: String },
}

/// Run the accept loop on a blocking thread until `shutdown` fires. Any
/// stale socket file left by a prior crashed process is removed first.
pub async fn serve(core: Arc<WorkerCore>, socket_path: PathBuf, shutdown: CancelToken) {
    let result = tokio::task::spawn_blocking(move || accept_loop(&socket_path, core, shutdown)).await;
    if let Err(e) = result {
        warn!(error = %e, "admin control surface thread panicked");
    }
}

fn accept_loop(socket_path: &Path, core: Arc<WorkerCore>, shutdown: CancelToken) {
    let _ = std::fs::remove_file(socket_path);
    if let Some(parent) = socket_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let listener = match UnixListener::bind(socket_path) {
        Ok(l) => l,
        Err(e) => {
            warn!(socket = %socket_path.display(), error = %e, "failed to bind admin socket");
            return;
        }
    };
    if listener.set_nonblocking(true).is_err() {
        return;
    }
    info!(socket = %socket_path.display(), "admin control surface listening");

    loop {
        if shutdown.is_cancelled() {
            let _ = std::fs::remove_file(socket_path);
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let core = core.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &core) {
                        warn!(error = %e, "admin connection error");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!(error = %e, "admin socket accept failed");
                return;
            }
        }
    }
}

fn handle_connection(stream: UnixStream, core: &WorkerCore) -> crate::error::Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = std::io::BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    loop {
        let request: Option<AdminRequest> = orcvm_protocol::read_line_value(&mut reader)?;
        let Some(request) = request else { return Ok(()) };

        let response = dispatch(core, request);
        let line = orcvm_protocol::encode_line(&response)?;
        writer.write_all(&line)?;
    }
}

fn dispatch(core: &WorkerCore, request: AdminRequest) -> AdminResponse {
    let rt = tokio::runtime::Handle::current();
    match request {
        AdminRequest::ListVms => match rt.block_on(core.orchestrator.list_vms()) {
            Ok(vms) => AdminResponse::Vms {
                vms: vms
                    .into_iter()
                    .map(|vm| VmSummary {
                        id: vm.id.to_string(),
                        name: vm.name,
                        state: format!("{:?}", vm.state),
                        owning_worker_id: vm.owning_worker_id,
                    })
                    .collect(),
            },
            Err(e) => AdminResponse::Error { message: e.to_string() },
        },
        AdminRequest::ListTasks => match rt.block_on(core.queue.list_tasks(&crate::task::TaskFilter::default())) {
            Ok(tasks) => AdminResponse::Tasks {
                tasks: tasks
                    .into_iter()
                    .map(|task| TaskSummary {
                        id: task.id.to_string(),
                        type_tag: task.type_tag,
                        status: format!("{:?}", task.status),
                        retry_count: task.retry_count,
                    })
                    .collect(),
            },
            Err(e) => AdminResponse::Error { message: e.to_string() },
        },
        AdminRequest::Reap => match rt.block_on(core.reap_now()) {
            Ok(count) => AdminResponse::Reaped { count },
            Err(e) => AdminResponse::Error { message: e.to_string() },
        },
    }
}
