//! Agent configuration
//!
//! Read from `$FLEET_AGENT_CONFIG`, or `<config dir>/fleet-agent/config.toml`.
//! Every key is optional; a missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// `heartbeat_interval_secs` value that disables periodic heartbeats.
pub const HEARTBEAT_DISABLED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the aggregator.
    pub aggregator: String,
    /// Logical name announced in heartbeats.
    pub hostname: String,
    pub heartbeat_interval_secs: i64,
    pub sample_interval_secs: u64,
    pub commit_interval_secs: u64,
    pub coredump_interval_mins: u64,
    pub request_timeout_secs: u64,
    /// Connection attempts per request before giving up.
    pub transport_retries: u32,
    /// Processes of these users are never tracked.
    pub excluded_users: Vec<String>,
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            aggregator: "http://127.0.0.1:2333".to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string()),
            heartbeat_interval_secs: HEARTBEAT_DISABLED,
            sample_interval_secs: 10,
            commit_interval_secs: 60,
            coredump_interval_mins: 10,
            request_timeout_secs: 30,
            transport_retries: 5,
            excluded_users: vec!["root".to_string()],
            data_dir: PathBuf::from("data"),
        }
    }
}

impl AgentConfig {
    /// Load config from `$FLEET_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = match std::env::var_os("FLEET_AGENT_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?
        } else {
            info!("no config at {}, using defaults", path.display());
            Self::default()
        };
        Ok(config.normalized())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("fleet-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Enforce `commit >= sample` and non-zero periods.
    pub fn normalized(mut self) -> Self {
        self.sample_interval_secs = self.sample_interval_secs.max(1);
        if self.commit_interval_secs < self.sample_interval_secs {
            warn!(
                "commit interval {}s is shorter than the sample interval, raised to {}s",
                self.commit_interval_secs, self.sample_interval_secs
            );
            self.commit_interval_secs = self.sample_interval_secs;
        }
        self.coredump_interval_mins = self.coredump_interval_mins.max(1);
        self.transport_retries = self.transport_retries.max(1);
        self
    }

    pub fn heartbeat_period(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs as u64))
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn commit_period(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn coredump_period(&self) -> Duration {
        Duration::from_secs(self.coredump_interval_mins * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("client-state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.aggregator, "http://127.0.0.1:2333");
        assert!(config.heartbeat_period().is_none());
        assert_eq!(config.excluded_users, vec!["root"]);
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("fleet-agent"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[tokio::test]
    async fn test_commit_never_shorter_than_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "hostname = \"gpu07\"\nsample_interval_secs = 30\ncommit_interval_secs = 5\n").unwrap();

        let config = AgentConfig::load_from(&path).await.unwrap();
        assert_eq!(config.hostname, "gpu07");
        assert_eq!(config.commit_interval_secs, 30);
        assert_eq!(config.transport_retries, 5);
    }

    #[tokio::test]
    async fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.sample_interval_secs, 10);
    }
}
