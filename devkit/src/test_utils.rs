/*!
Test harness booting a real aggregator

The kernel serves on a loopback port with its data directory and quota rule
file in a temporary directory. Every client built by the harness connects
from 127.0.0.1, so they all share one registry binding.
*/

use anyhow::{Context, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use fleet_agent::{AgentConfig, DeliveryClient, DeliveryTiming};
use fleet_kernel::{Kernel, KernelConfig};
use fleet_proto::{Api, QueryPacket, Response};

pub struct TestHarness {
    dir: TempDir,
    config: KernelConfig,
    addr: SocketAddr,
    restarts: u32,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<()>>>,
}

/// Route test logs through the test writer, once per process.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

impl TestHarness {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_, _| Ok(())).await
    }

    /// Start after `prepare` has adjusted the config and seeded the temp dir.
    pub async fn start_with<F>(prepare: F) -> Result<Self>
    where
        F: FnOnce(&mut KernelConfig, &Path) -> Result<()>,
    {
        init_logging();
        let dir = tempfile::tempdir().context("cannot create harness dir")?;
        let mut config = KernelConfig {
            data_dir: dir.path().join("data"),
            quota_rule_file: dir.path().join("quota_rule.txt"),
            ..KernelConfig::default()
        };
        prepare(&mut config, dir.path())?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let mut harness = Self { dir, config, addr, restarts: 0, shutdown: None, server: None };
        harness.launch(listener)?;
        Ok(harness)
    }

    fn launch(&mut self, listener: TcpListener) -> Result<()> {
        let kernel = Kernel::open(self.config.clone())?;
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(kernel.serve(listener, async move {
            let _ = rx.await;
        }));
        info!("harness aggregator on {}", self.addr);
        self.shutdown = Some(tx);
        self.server = Some(server);
        Ok(())
    }

    async fn shut_down(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.server.take() {
            Some(server) => server.await.context("aggregator task panicked")?,
            None => Ok(()),
        }
    }

    /// Replace the aggregator with a fresh one on the same address, backed by
    /// an empty data directory: every node binding is gone.
    pub async fn restart_empty(&mut self) -> Result<()> {
        self.shut_down().await?;
        self.restarts += 1;
        self.config.data_dir = self.dir.path().join(format!("data-{}", self.restarts));
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("cannot rebind {}", self.addr))?;
        self.launch(listener)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Kernel data directory. Lives in the harness temp dir unless `start_with` moved it.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// A client that fails fast: one connection attempt, short backoffs.
    pub fn client(&self) -> Result<DeliveryClient> {
        let timing = DeliveryTiming {
            request_timeout: Duration::from_secs(5),
            transport_retries: 1,
            transport_backoff: Duration::from_millis(20),
            status_backoff: Duration::from_millis(20),
        };
        Ok(DeliveryClient::new(&self.base_url(), timing)?)
    }

    /// Agent settings pointing at this aggregator, on the shortest periods.
    pub fn agent_config(&self, hostname: &str) -> AgentConfig {
        AgentConfig {
            aggregator: self.base_url(),
            hostname: hostname.to_string(),
            sample_interval_secs: 1,
            commit_interval_secs: 1,
            request_timeout_secs: 5,
            transport_retries: 2,
            data_dir: self.dir.path().join(format!("agent-{hostname}")),
            ..AgentConfig::default()
        }
    }

    pub async fn query(&self, packet: &QueryPacket) -> Result<Response> {
        Ok(self.client()?.post(Api::Query, packet).await?)
    }

    /// Poll `packet` until `accept` holds for its answer or `timeout` elapses.
    pub async fn wait_for<F>(&self, packet: &QueryPacket, timeout: Duration, accept: F) -> Result<Response>
    where
        F: Fn(&Response) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let resp = self.query(packet).await?;
            if accept(&resp) {
                return Ok(resp);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("condition not met within {timeout:?}, last answer: {resp:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop serving and wait for the final flush.
    pub async fn stop(mut self) -> Result<()> {
        self.shut_down().await
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Walk a dotted path (`"node1.0.ts"`) into a JSON value.
pub fn field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Assert that `resp.data` holds `expected` at `path`.
pub fn assert_field_equals(resp: &Response, path: &str, expected: &Value) -> Result<()> {
    let data = resp.data.as_ref().context("response carries no data")?;
    match field(data, path) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => anyhow::bail!("field '{path}' mismatch: expected {expected}, got {actual}"),
        None => anyhow::bail!("field '{path}' not found in {data}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_paths() {
        let value = json!({"node1": [{"ts": 10}, {"ts": 20}]});
        assert_eq!(field(&value, "node1.1.ts"), Some(&json!(20)));
        assert_eq!(field(&value, "node1.2.ts"), None);
        assert_eq!(field(&value, "node2"), None);
    }

    #[tokio::test]
    async fn test_harness_starts_and_stops() {
        let keep = tempfile::tempdir().unwrap();
        let data_dir = keep.path().join("data");
        let harness = TestHarness::start_with(|config, _| {
            config.data_dir = data_dir.clone();
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(harness.data_dir(), data_dir.as_path());
        let resp = harness.query(&QueryPacket::Settings).await.unwrap();
        assert!(resp.is_ok());
        assert_field_equals(&resp, "dynamic_register", &json!(true)).unwrap();

        harness.stop().await.unwrap();
        assert!(data_dir.join("TaskRecords.json").exists());
        assert!(data_dir.join("server-registry.json").exists());
    }
}
