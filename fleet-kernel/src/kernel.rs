//! Start-up and ordered teardown of the aggregator.
//!
//! Start-up creates the data directory, loads every durable store (a corrupt
//! task ledger aborts here) and applies the quota rule file. Teardown stops
//! the maintenance duties before the final flush, so no store changes after
//! its last snapshot.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::KernelConfig;
use crate::http;
use crate::maintenance::{flush_all, Maintenance};
use crate::service::IngestionService;

pub struct Kernel {
    service: Arc<IngestionService>,
}

impl Kernel {
    pub fn open(config: KernelConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;

        let service = IngestionService::new(config);
        for store in service.durable_stores() {
            store
                .load()
                .with_context(|| format!("failed to load the {} store", store.name()))?;
        }
        service.reload_quota();
        info!("kernel state loaded from {}", service.config().data_dir.display());

        Ok(Self { service: Arc::new(service) })
    }

    pub fn service(&self) -> &Arc<IngestionService> {
        &self.service
    }

    /// Serve on `listener` until `shutdown` resolves, then tear down.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let maintenance = Maintenance::start(self.service.clone());
        let served = http::serve(listener, self.service.clone(), shutdown).await;

        info!("shutting down");
        maintenance.stop().await;
        let stores = self.service.durable_stores();
        tokio::task::spawn_blocking(move || flush_all(&stores))
            .await
            .context("final flush did not complete")?;

        served.context("http server failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_proto::{Api, Response};
    use serde_json::json;

    fn config_in(dir: &std::path::Path) -> KernelConfig {
        KernelConfig {
            data_dir: dir.join("data"),
            quota_rule_file: dir.join("quota_rule.txt"),
            ..KernelConfig::default()
        }
    }

    fn call(kernel: &Kernel, api: Api, body: serde_json::Value) -> Response {
        kernel.service().handle(api, "10.0.0.1".parse().unwrap(), body.to_string().as_bytes())
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("quota_rule.txt"), "alice 100\n").unwrap();

        let kernel = Kernel::open(config_in(dir.path())).unwrap();
        call(&kernel, Api::Heartbeat, json!({"hostname": "node1"}));
        call(&kernel, Api::Stats, json!({"type": "hardware", "hardware": {"mem": 64}}));
        let task = json!({"gpu_id": 0, "username": "alice", "command": "train",
                          "start_ts": fleet_proto::now_ts() - 60, "end_ts": fleet_proto::now_ts()});
        call(&kernel, Api::Stats, json!({"type": "tasks", "tasks": [task]}));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        kernel.serve(listener, async {}).await.unwrap();

        let kernel = Kernel::open(config_in(dir.path())).unwrap();
        let resp = call(&kernel, Api::Query, json!({"type": "hardware", "hostname": "node1"}));
        assert_eq!(resp.data.unwrap()["node1"]["mem"], 64);
        let resp = call(&kernel, Api::Query, json!({"type": "tasks"}));
        assert_eq!(resp.data.unwrap().as_array().unwrap().len(), 1);
        let resp = call(&kernel, Api::Query, json!({"type": "quota", "username": "alice"}));
        assert_eq!(resp.status_code, 200);
    }

    #[test]
    fn test_corrupt_ledger_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::create_dir_all(&config.data_dir).unwrap();
        std::fs::write(config.ledger_file(), "[{").unwrap();

        assert!(Kernel::open(config.clone()).is_err());
        assert!(!config.ledger_file().exists());
    }
}
