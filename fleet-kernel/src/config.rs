use serde::{Deserialize, Serialize};
use std::{net::{IpAddr, SocketAddr}, path::{Path, PathBuf}};
use tokio::fs;
use tracing::warn;

use fleet_proto::{days_to_secs, mins_to_secs};

/// Aggregator settings, read from `kernel.yaml` (or `$FLEET_KERNEL_CONFIG`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: SocketAddr,
    /// Node addresses known in advance, seeded as UNKNOWN placeholders.
    pub static_nodes: Vec<IpAddr>,
    /// Accept heartbeats from addresses outside `static_nodes`.
    pub dynamic_register: bool,
    /// Dynamic entries silent for this long are forgotten.
    pub dynamic_unregister_wait_mins: i64,
    /// Runtime-table snapshot period, also the liveness sweep period.
    pub coredump_interval_mins: i64,
    /// Task ledger snapshot period.
    pub flush_interval_mins: i64,
    pub backup_interval_days: i64,
    /// Task records are kept this many days.
    pub stdata_retention_days: i64,
    /// Runtime samples are kept this many days.
    pub rtdata_retention_days: i64,
    pub quota_rule_file: PathBuf,
    pub data_dir: PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 2333)),
            static_nodes: Vec::new(),
            dynamic_register: true,
            dynamic_unregister_wait_mins: 4 * 60,
            coredump_interval_mins: 10,
            flush_interval_mins: 10,
            backup_interval_days: 5,
            stdata_retention_days: 30 * 12,
            rtdata_retention_days: 21,
            quota_rule_file: PathBuf::from("quota_rule.txt"),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl KernelConfig {
    pub fn rtdata_retention_secs(&self) -> i64 {
        days_to_secs(self.rtdata_retention_days)
    }

    pub fn stdata_retention_secs(&self) -> i64 {
        days_to_secs(self.stdata_retention_days)
    }

    pub fn unregister_wait_secs(&self) -> i64 {
        mins_to_secs(self.dynamic_unregister_wait_mins)
    }

    pub fn coredump_period(&self) -> std::time::Duration {
        minutes(self.coredump_interval_mins)
    }

    pub fn flush_period(&self) -> std::time::Duration {
        minutes(self.flush_interval_mins)
    }

    pub fn backup_period(&self) -> std::time::Duration {
        minutes(self.backup_interval_days * 24 * 60)
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.data_dir.join("TaskRecords.json")
    }

    pub fn table_file(&self, table: &str) -> PathBuf {
        self.data_dir.join(format!("server-{table}.json"))
    }
}

fn minutes(mins: i64) -> std::time::Duration {
    std::time::Duration::from_secs(mins.max(1) as u64 * 60)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: impl AsRef<Path>) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!("no config at {}, using defaults", path.display());
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!("invalid config {}: {e}, using defaults", path.display());
        KernelConfig::default()
    })
}
