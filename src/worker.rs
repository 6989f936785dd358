//! The Worker entity: a registered member of the worker pool.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::vm::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Draining,
    Left,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceInventory {
    pub total_cpu_millis: u64,
    pub used_cpu_millis: u64,
    pub total_mem_mb: u64,
    pub used_mem_mb: u64,
    pub total_disk_mb: u64,
    pub used_disk_mb: u64,
}

impl ResourceInventory {
    pub fn fits_within_totals(&self) -> bool {
        self.used_cpu_millis <= self.total_cpu_millis
            && self.used_mem_mb <= self.total_mem_mb
            && self.used_disk_mb <= self.total_disk_mb
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub zone: String,
    pub labels: HashMap<String, String>,
    pub capabilities: Vec<String>,
    pub resources: ResourceInventory,
    pub vm_count: u32,
    pub max_vms: u32,
    pub status: WorkerStatus,
    pub last_seen_ms: u64,
}

impl Worker {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            address: address.into(),
            zone: String::new(),
            labels: HashMap::new(),
            capabilities: Vec::new(),
            resources: ResourceInventory::default(),
            vm_count: 0,
            max_vms: 16,
            status: WorkerStatus::Active,
            last_seen_ms: now_ms(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.vm_count < self.max_vms
    }

    pub fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }

    /// Stale once silence exceeds the heartbeat TTL plus the registry's
    /// deregister-after grace period, per the eviction sweep's "After TTL +
    /// deregister-after" window.
    pub fn is_stale(&self, now_ms: u64, ttl_ms: u64, deregister_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > ttl_ms.saturating_add(deregister_after_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub zone: Option<String>,
    pub label: Option<(String, String)>,
    pub capability: Option<String>,
    pub status: Option<WorkerStatus>,
}

/// A point-in-time resource/heartbeat sample, persisted for observability
/// history via `WorkerMetricRepository`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetric {
    pub worker_id: String,
    pub recorded_at_ms: u64,
    pub resources: ResourceInventory,
    pub vm_count: u32,
}

/// Membership change surfaced by `WorkerRegistry::watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerEvent {
    Joined(Worker),
    Updated(Worker),
    Left(String),
}
