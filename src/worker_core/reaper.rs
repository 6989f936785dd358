//! Idle-VM reaper: periodically scans running VMs and stops+deletes any
//! that have exceeded the configured idle timeout, honoring the
//! `no_reap` metadata flag some callers set to pin a VM.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::ReaperConfig;
use crate::orchestrator::Orchestrator;
use crate::vm::{now_ms, VmState};

pub async fn run(orchestrator: Arc<Orchestrator>, config: ReaperConfig, shutdown: CancelToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_millis(config.check_interval_ms)) => {}
        }

        if let Err(e) = sweep(&orchestrator, &config).await {
            warn!(error = %e, "idle-VM reaper sweep failed");
        }
    }
}

/// Run one sweep and return the number of VMs reaped. Exposed so the admin
/// control surface can trigger an off-cycle reap on operator request.
pub async fn sweep(orchestrator: &Orchestrator, config: &ReaperConfig) -> crate::error::Result<usize> {
    let now = now_ms();
    let mut reaped = 0;
    for vm in orchestrator.list_vms().await? {
        if vm.state != VmState::Running || vm.no_reap() {
            continue;
        }
        if vm.idle_for_ms(now) < config.idle_timeout_ms {
            continue;
        }
        info!(vm = %vm.id, idle_ms = vm.idle_for_ms(now), "reaping idle VM");
        orchestrator.delete_vm(vm.id).await?;
        reaped += 1;
    }
    Ok(reaped)
}
