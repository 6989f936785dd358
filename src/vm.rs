//! The VM entity and its lifecycle state machine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Current epoch milliseconds, matching the teacher's `persistence::now_ms`.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Type1,
    Container,
}

/// VM lifecycle states. Transitions are validated by [`VmState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl VmState {
    /// `Created → Starting → Running → Stopping → Stopped`, with a `Failed`
    /// branch reachable from `Starting` or `Running`. All other transitions
    /// are forbidden and surface `InvalidState`.
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                // Idempotent start: starting an already-Running VM is a no-op success,
                // not a transition, but callers that do model it as one must allow it.
                | (Running, Running)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: Uuid,
    pub name: String,
    pub backend_kind: BackendKind,
    pub state: VmState,
    pub kernel_path: Option<PathBuf>,
    pub rootfs_path: Option<PathBuf>,
    pub control_socket_path: Option<PathBuf>,
    /// Host-side `ip:port` for the TCP transport fallback, set by the
    /// backend at `create()` time from its configured tap IP. `None` if no
    /// fallback is configured, in which case a vsock outage is terminal.
    pub tcp_fallback_addr: Option<String>,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub owning_worker_id: String,
    pub guest_cid: u32,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub stopped_at_ms: Option<u64>,
    pub last_activity_ms: u64,
    pub metadata: HashMap<String, Value>,
}

impl Vm {
    pub fn new(name: impl Into<String>, backend_kind: BackendKind, owning_worker_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            backend_kind,
            state: VmState::Created,
            kernel_path: None,
            rootfs_path: None,
            control_socket_path: None,
            tcp_fallback_addr: None,
            vcpus: 1,
            memory_mb: 256,
            owning_worker_id: owning_worker_id.into(),
            guest_cid: orcvm_protocol::DEFAULT_GUEST_CID,
            created_at_ms: now,
            started_at_ms: None,
            stopped_at_ms: None,
            last_activity_ms: now,
            metadata: HashMap::new(),
        }
    }

    /// Apply a validated state transition, recording timestamps as appropriate.
    pub fn transition(&mut self, next: VmState) -> Result<()> {
        if self.state == VmState::Running && next == VmState::Running {
            return Ok(()); // idempotent start
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "cannot transition VM {} from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        match next {
            VmState::Running => self.started_at_ms = Some(now_ms()),
            VmState::Stopped => self.stopped_at_ms = Some(now_ms()),
            _ => {}
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity_ms = now_ms();
    }

    /// Whether the reaper's "no-reap" metadata flag is set for this VM.
    pub fn no_reap(&self) -> bool {
        self.metadata
            .get("no_reap")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn idle_for_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub owning_worker_id: Option<String>,
    pub state: Option<VmState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut vm = Vm::new("v1", BackendKind::Type1, "worker-a");
        vm.transition(VmState::Starting).unwrap();
        vm.transition(VmState::Running).unwrap();
        assert!(vm.started_at_ms.is_some());
        vm.transition(VmState::Stopping).unwrap();
        vm.transition(VmState::Stopped).unwrap();
        assert!(vm.stopped_at_ms.is_some());
    }

    #[test]
    fn idempotent_start_on_running_is_a_no_op() {
        let mut vm = Vm::new("v1", BackendKind::Type1, "worker-a");
        vm.transition(VmState::Starting).unwrap();
        vm.transition(VmState::Running).unwrap();
        let started_at = vm.started_at_ms;
        vm.transition(VmState::Running).unwrap();
        assert_eq!(vm.started_at_ms, started_at);
    }

    #[test]
    fn forbidden_transition_is_invalid_state() {
        let mut vm = Vm::new("v1", BackendKind::Type1, "worker-a");
        let err = vm.transition(VmState::Stopped).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn failed_reachable_from_starting_and_running() {
        let mut vm = Vm::new("v1", BackendKind::Type1, "worker-a");
        vm.transition(VmState::Starting).unwrap();
        vm.transition(VmState::Failed).unwrap();
        assert_eq!(vm.state, VmState::Failed);
    }

    #[test]
    fn no_reap_flag_defaults_false() {
        let vm = Vm::new("v1", BackendKind::Type1, "worker-a");
        assert!(!vm.no_reap());
    }
}
