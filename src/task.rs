//! The Task entity: queued units of work dispatched to workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::vm::now_ms;

/// Normative task type tags from the external interfaces surface. Additional
/// tags may be registered by collaborators, so this is not a closed enum —
/// `Task::type_tag` stays a plain `String`.
pub mod type_tags {
    pub const VM_CREATE: &str = "vm:create";
    pub const VM_EXECUTE: &str = "vm:execute";
    pub const VM_DELETE: &str = "vm:delete";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Critical,
    High,
    Default,
    Low,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Critical, Lane::High, Lane::Default, Lane::Low];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Dead,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Dead)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub type_tag: String,
    pub lane: Lane,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub vm_id: Option<Uuid>,
    pub claiming_worker_id: Option<String>,
    pub claim_deadline_ms: Option<u64>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub scheduled_at_ms: u64,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(type_tag: impl Into<String>, lane: Lane, payload: Value) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::now_v7(),
            type_tag: type_tag.into(),
            lane,
            payload,
            result: None,
            error: None,
            vm_id: None,
            claiming_worker_id: None,
            claim_deadline_ms: None,
            max_retries: 3,
            retry_count: 0,
            scheduled_at_ms: now,
            created_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Mark the task claimed by `worker_id` with a claim deadline `visibility_timeout_ms`
    /// in the future. Stamps `started_at_ms` on first claim only.
    pub fn mark_processing(&mut self, worker_id: impl Into<String>, visibility_timeout_ms: u64) {
        let now = now_ms();
        self.status = TaskStatus::Processing;
        self.claiming_worker_id = Some(worker_id.into());
        self.claim_deadline_ms = Some(now + visibility_timeout_ms);
        if self.started_at_ms.is_none() {
            self.started_at_ms = Some(now);
        }
    }

    pub fn mark_completed(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at_ms = Some(now_ms());
        self.claiming_worker_id = None;
        self.claim_deadline_ms = None;
    }

    /// Apply the retry/backoff/DLQ policy on handler failure.
    ///
    /// On success path callers use [`Task::mark_completed`] instead. This
    /// always clears the claim so a dead task is not left hidden as if it
    /// were still being processed.
    pub fn mark_failed(&mut self, error: impl Into<String>, base_backoff_ms: u64, backoff_cap_ms: u64) {
        self.error = Some(error.into());
        self.claiming_worker_id = None;
        self.claim_deadline_ms = None;
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            let backoff = base_backoff_ms.saturating_mul(1u64 << self.retry_count.min(32));
            let backoff = backoff.min(backoff_cap_ms);
            self.scheduled_at_ms = now_ms() + backoff;
            self.status = TaskStatus::Retrying;
        } else {
            self.status = TaskStatus::Dead;
            self.completed_at_ms = Some(now_ms());
        }
    }

    /// Release a claim without consuming a retry — used when a handler is
    /// cancelled (not failed) so the task recovers after the visibility
    /// timeout rather than being re-enqueued immediately.
    pub fn release_claim_for_recovery(&mut self) {
        self.status = TaskStatus::Pending;
        // claim_deadline_ms / claiming_worker_id are left intact until they
        // naturally expire, matching "not immediately re-enqueued" semantics;
        // the queue's reclaim scan only looks at pending+expired-deadline.
    }

    pub fn is_claim_expired(&self, now_ms: u64) -> bool {
        match self.claim_deadline_ms {
            Some(deadline) => now_ms >= deadline,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub type_tag: Option<String>,
    pub status: Option<TaskStatus>,
    pub lane: Option<Lane>,
}
