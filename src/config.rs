//! Configuration surface: env > file > default, mirroring the teacher's
//! `persistence::provider_from_env` / `ObserveConfig::from_env` idiom.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::Lane;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    Type1,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub selection: BackendSelection,
    pub hypervisor_binary: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_template: PathBuf,
    pub socket_dir: PathBuf,
    pub default_vcpus: u32,
    pub default_memory_mb: u64,
    /// `runc`/`crun`-shaped binary, used only when `selection == Container`.
    pub container_runtime_binary: PathBuf,
    pub container_image: String,
    /// Host-side IP of the guest's tap device, used as the TCP fallback
    /// address when the guest kernel lacks vsock support. `None` disables
    /// the fallback entirely.
    pub tap_ip: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            selection: BackendSelection::Type1,
            hypervisor_binary: PathBuf::from("firecracker"),
            kernel_path: PathBuf::from("/var/lib/orcvm/vmlinux"),
            rootfs_template: PathBuf::from("/var/lib/orcvm/rootfs.ext4"),
            socket_dir: PathBuf::from("/run/orcvm"),
            default_vcpus: 1,
            default_memory_mb: 256,
            container_runtime_binary: PathBuf::from("runc"),
            container_image: String::from("alpine:latest"),
            tap_ip: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub lane_weights: Vec<(Lane, u32)>,
    pub concurrency: usize,
    pub visibility_timeout_ms: u64,
    pub retry_base_backoff_ms: u64,
    pub retry_backoff_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lane_weights: vec![
                (Lane::Critical, 6),
                (Lane::High, 5),
                (Lane::Default, 3),
                (Lane::Low, 1),
            ],
            concurrency: 8,
            visibility_timeout_ms: 30_000,
            retry_base_backoff_ms: 500,
            retry_backoff_cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub address: String,
    pub datacenter: String,
    pub service_name: String,
    pub token: Option<String>,
    pub ttl_ms: u64,
    pub deregister_after_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:8500"),
            datacenter: String::from("dc1"),
            service_name: String::from("orcvm-worker"),
            token: None,
            ttl_ms: 15_000,
            deregister_after_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: Option<String>,
    pub hostname: String,
    pub address: String,
    pub zone: String,
    pub labels: Vec<(String, String)>,
    pub capabilities: Vec<String>,
    pub cpu_millis_cap: u64,
    pub mem_mb_cap: u64,
    pub disk_mb_cap: u64,
    pub max_vms: u32,
    /// UDS path the admin control surface (`orcvmctl`) connects to.
    pub admin_socket_path: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            hostname: hostname_or_unknown(),
            address: String::from("127.0.0.1:0"),
            zone: String::from("default"),
            labels: Vec::new(),
            capabilities: vec!["type-1".to_string(), "container".to_string()],
            cpu_millis_cap: 8_000,
            mem_mb_cap: 16_384,
            disk_mb_cap: 102_400,
            max_vms: 16,
            admin_socket_path: PathBuf::from("/run/orcvm/admin.sock"),
        }
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub check_interval_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            idle_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Config {
    /// Resolve configuration: start from defaults, overlay a TOML file named
    /// by `ORCVM_CONFIG_FILE` if present, then overlay individual `ORCVM_*`
    /// environment variables (env wins, matching "env > file").
    pub fn from_env() -> Result<Self> {
        let mut config = if let Ok(path) = std::env::var("ORCVM_CONFIG_FILE") {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("failed to read {path}: {e}")))?;
            toml::from_str(&text).map_err(|e| Error::Config(format!("invalid config file {path}: {e}")))?
        } else {
            Config::default()
        };

        if let Ok(v) = std::env::var("ORCVM_BACKEND") {
            config.backend.selection = match v.as_str() {
                "container" => BackendSelection::Container,
                _ => BackendSelection::Type1,
            };
        }
        if let Ok(v) = std::env::var("ORCVM_HYPERVISOR_BINARY") {
            config.backend.hypervisor_binary = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORCVM_KERNEL_PATH") {
            config.backend.kernel_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORCVM_ROOTFS_TEMPLATE") {
            config.backend.rootfs_template = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORCVM_SOCKET_DIR") {
            config.backend.socket_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORCVM_TAP_IP") {
            config.backend.tap_ip = Some(v);
        }
        if let Ok(v) = std::env::var("ORCVM_WORKER_ID") {
            config.worker.id = Some(v);
        }
        if let Ok(v) = std::env::var("ORCVM_WORKER_ADDRESS") {
            config.worker.address = v;
        }
        if let Ok(v) = std::env::var("ORCVM_WORKER_ZONE") {
            config.worker.zone = v;
        }
        if let Ok(v) = std::env::var("ORCVM_WORKER_LABELS") {
            config.worker.labels = parse_kv_list(&v);
        }
        if let Ok(v) = std::env::var("ORCVM_MAX_VMS") {
            config.worker.max_vms = v.parse().map_err(|_| Error::Config(format!("invalid ORCVM_MAX_VMS: {v}")))?;
        }
        if let Ok(v) = std::env::var("ORCVM_QUEUE_CONCURRENCY") {
            config.queue.concurrency = v.parse().map_err(|_| Error::Config(format!("invalid ORCVM_QUEUE_CONCURRENCY: {v}")))?;
        }
        if let Ok(v) = std::env::var("ORCVM_VISIBILITY_TIMEOUT_MS") {
            config.queue.visibility_timeout_ms = v.parse().map_err(|_| Error::Config(format!("invalid ORCVM_VISIBILITY_TIMEOUT_MS: {v}")))?;
        }
        if let Ok(v) = std::env::var("ORCVM_REGISTRY_ADDRESS") {
            config.registry.address = v;
        }
        if let Ok(v) = std::env::var("ORCVM_REAPER_IDLE_TIMEOUT_MS") {
            config.reaper.idle_timeout_ms = v.parse().map_err(|_| Error::Config(format!("invalid ORCVM_REAPER_IDLE_TIMEOUT_MS: {v}")))?;
        }
        if let Ok(v) = std::env::var("ORCVM_ADMIN_SOCKET") {
            config.worker.admin_socket_path = PathBuf::from(v);
        }

        Ok(config)
    }
}

/// Parse a comma-separated `k=v,k2=v2` list, matching the worker labels
/// surface in the external interfaces section.
fn parse_kv_list(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_list_splits_on_equals_and_comma() {
        let parsed = parse_kv_list("zone=us-east,gpu=true");
        assert_eq!(parsed, vec![("zone".to_string(), "us-east".to_string()), ("gpu".to_string(), "true".to_string())]);
    }

    #[test]
    fn parse_kv_list_ignores_malformed_entries() {
        let parsed = parse_kv_list("justakey,zone=us-east");
        assert_eq!(parsed, vec![("zone".to_string(), "us-east".to_string())]);
    }

    #[test]
    fn default_queue_config_matches_spec_lane_weights() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.lane_weights.len(), 4);
    }
}
