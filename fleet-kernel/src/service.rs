/**
 * INGESTION SERVICE - the aggregator's request handlers
 *
 * ROLE: the only writer of the registry, hardware table, time series, task
 * ledger and quota ledger. Every wire call enters through `handle`.
 *
 * RULES:
 * - `stats` requires a REGISTERED address and refreshes its last-ack first
 * - a payload is fully parsed and validated before any store is touched
 * - a panicking handler becomes a 500, the process keeps serving
 */

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use fleet_proto::{
    days_to_secs, now_ts, Api, HeartbeatPacket, QueryPacket, QuotaEntry, ReallocPacket, Response,
    StatsPacket, TaskFilter, TaskRecord, Timestamp,
};

use crate::config::KernelConfig;
use crate::error::{ApiError, ApiResult};
use crate::inventory::HardwareTable;
use crate::ledger::TaskLedger;
use crate::persist::DurableStore;
use crate::quota::{QuotaError, QuotaLedger};
use crate::registry::{BindOutcome, Registry};
use crate::timeseries::TimeSeriesStore;

/// Default look-back of a runtime query without `start_ts`.
const DEFAULT_RUNTIME_WINDOW: i64 = days_to_secs(7);

pub struct IngestionService {
    config: KernelConfig,
    registry: Arc<Registry>,
    hardware: Arc<HardwareTable>,
    runtime: Arc<TimeSeriesStore>,
    ledger: Arc<TaskLedger>,
    quota: Arc<QuotaLedger>,
}

fn to_data<T: Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run one handler, converting errors and panics into structured responses.
fn guarded(api: Api, address: IpAddr, handler: impl FnOnce() -> ApiResult<Response>) -> Response {
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            match &e {
                ApiError::Internal(detail) => error!("{api} from {address} failed: {detail}"),
                _ => warn!("{api} from {address} rejected: {e}"),
            }
            e.into_response()
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!("{api} handler from {address} panicked: {msg}");
            ApiError::Internal(msg).into_response()
        }
    }
}

fn quota_view(entries: impl IntoIterator<Item = QuotaEntry>) -> Value {
    let map: Map<String, Value> = entries
        .into_iter()
        .map(|e| (e.username, json!({ "available": e.available, "total": e.total })))
        .collect();
    Value::Object(map)
}

fn validate_tasks(tasks: &[TaskRecord]) -> ApiResult<()> {
    for (i, task) in tasks.iter().enumerate() {
        if task.username.is_empty() {
            return Err(ApiError::BadRequest(format!("tasks[{i}]: username is empty")));
        }
        if task.end_ts < task.start_ts {
            return Err(ApiError::BadRequest(format!(
                "tasks[{i}]: end_ts {} precedes start_ts {}",
                task.end_ts, task.start_ts
            )));
        }
    }
    Ok(())
}

impl IngestionService {
    pub fn new(config: KernelConfig) -> Self {
        let registry = Registry::new(
            &config.static_nodes,
            config.dynamic_register,
            config.table_file("registry"),
            config.table_file("last_ack"),
        );
        let hardware = HardwareTable::new(config.table_file("hardware"));
        let runtime = TimeSeriesStore::new(config.rtdata_retention_secs(), config.table_file("runtime"));
        let ledger = TaskLedger::new(config.ledger_file(), config.stdata_retention_secs());
        let quota = QuotaLedger::new(config.quota_rule_file.clone(), config.table_file("quota"));
        Self {
            config,
            registry: Arc::new(registry),
            hardware: Arc::new(hardware),
            runtime: Arc::new(runtime),
            ledger: Arc::new(ledger),
            quota: Arc::new(quota),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    /// Runtime tables dumped on every coredump tick.
    pub fn cache_stores(&self) -> Vec<Arc<dyn DurableStore>> {
        vec![
            self.registry.clone(),
            self.hardware.clone(),
            self.runtime.clone(),
            self.quota.clone(),
        ]
    }

    /// Every store loaded at start-up and saved at teardown.
    pub fn durable_stores(&self) -> Vec<Arc<dyn DurableStore>> {
        let mut stores = self.cache_stores();
        stores.push(self.ledger.clone());
        stores
    }

    pub fn handle(&self, api: Api, address: IpAddr, body: &[u8]) -> Response {
        guarded(api, address, || self.dispatch(api, address, body, now_ts()))
    }

    fn dispatch(&self, api: Api, address: IpAddr, body: &[u8], now: Timestamp) -> ApiResult<Response> {
        match api {
            Api::Heartbeat => self.heartbeat(address, serde_json::from_slice(body)?, now),
            Api::Stats => self.stats(address, serde_json::from_slice(body)?, now),
            Api::Query => self.query(serde_json::from_slice(body)?, now),
            Api::Realloc => self.realloc(serde_json::from_slice(body)?),
        }
    }

    pub fn heartbeat(&self, address: IpAddr, packet: HeartbeatPacket, now: Timestamp) -> ApiResult<Response> {
        let name = packet.hostname.trim();
        if name.is_empty() {
            return Err(ApiError::BadRequest("hostname is empty".into()));
        }
        let outcome = self.registry.bind(address, name, now, |previous| {
            self.hardware.purge(previous);
            self.runtime.purge(previous);
        })?;
        if outcome == BindOutcome::Refreshed {
            debug!("heartbeat from {name} at {address}");
        }
        Ok(Response::ok())
    }

    /// `body` is only checked to be JSON here; the typed parse happens once
    /// the sender is known to be registered.
    pub fn stats(&self, address: IpAddr, body: Value, now: Timestamp) -> ApiResult<Response> {
        self.registry.with_registered(address, now, |name| -> ApiResult<Response> {
            let packet: StatsPacket = serde_json::from_value(body)?;
            debug!("stats:{} from {name}", packet.kind());
            match packet {
                StatsPacket::Hardware { hardware } => self.hardware.put(name, hardware),
                StatsPacket::Runtime { runtime } => self.runtime.ingest(name, runtime, now),
                StatsPacket::Tasks { mut tasks } => {
                    validate_tasks(&tasks)?;
                    for task in &mut tasks {
                        task.hostname = name.to_string();
                        task.ingested_ts = Some(now);
                    }
                    info!("{name} reported {} finished tasks", tasks.len());
                    self.ledger.append(tasks);
                }
            }
            Ok(Response::ok())
        })?
    }

    pub fn query(&self, packet: QueryPacket, now: Timestamp) -> ApiResult<Response> {
        debug!("query:{}", packet.kind());
        let data = match packet {
            QueryPacket::Settings => to_data(&self.config)?,
            QueryPacket::Quota { username: Some(user) } => {
                let entry = self
                    .quota
                    .get(&user)
                    .ok_or_else(|| ApiError::NotAcceptable("requested user not found".into()))?;
                quota_view([entry])
            }
            QueryPacket::Quota { username: None } => quota_view(self.quota.all()),
            QueryPacket::Hardware { hostname: Some(host) } => {
                let snapshot = self
                    .hardware
                    .get(&host)
                    .ok_or_else(|| ApiError::NotAcceptable("requested host not found".into()))?;
                let mut data = Map::new();
                data.insert(host, to_data(&snapshot)?);
                Value::Object(data)
            }
            QueryPacket::Hardware { hostname: None } => to_data(&self.hardware.all())?,
            QueryPacket::Runtime { hostname, start_ts, end_ts } => {
                let start = start_ts.unwrap_or(now - DEFAULT_RUNTIME_WINDOW);
                let end = end_ts.unwrap_or(now);
                if start >= end {
                    return Err(ApiError::NotAcceptable(format!(
                        "start_ts {start} must be earlier than end_ts {end}"
                    )));
                }
                match hostname {
                    Some(host) => {
                        let samples = self
                            .runtime
                            .range(&host, start, end)
                            .ok_or_else(|| ApiError::NotAcceptable("requested host not found".into()))?;
                        let mut data = Map::new();
                        data.insert(host, to_data(&samples)?);
                        Value::Object(data)
                    }
                    None => to_data(&self.runtime.range_all(start, end))?,
                }
            }
            QueryPacket::Tasks(filter) => self.tasks(&filter)?,
        };
        Ok(Response::ok_with(data))
    }

    fn tasks(&self, filter: &TaskFilter) -> ApiResult<Value> {
        to_data(&self.ledger.query(filter))
    }

    pub fn realloc(&self, packet: ReallocPacket) -> ApiResult<Response> {
        info!("realloc of {} GPUs requested by {}", packet.gpu_count, packet.username);
        Err(ApiError::NotImplemented)
    }

    /// Forget nodes that stopped talking. Their data ages out normally.
    pub fn sweep_dead_nodes(&self, now: Timestamp) -> Vec<String> {
        self.registry.sweep(now, self.config.unregister_wait_secs())
    }

    pub fn reload_quota(&self) {
        match self.quota.reload() {
            Ok(_) => {}
            Err(e @ QuotaError::RulesMissing { .. }) => warn!("{e}, quota unchanged"),
            Err(e) => error!("{e}, quota unchanged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_A: &str = "10.0.0.1";

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn service() -> IngestionService {
        IngestionService::new(KernelConfig::default())
    }

    fn call(svc: &IngestionService, api: Api, from: &str, body: Value) -> Response {
        svc.handle(api, addr(from), body.to_string().as_bytes())
    }

    #[test]
    fn test_register_report_rename_scenario() {
        let svc = service();
        assert_eq!(call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node1"})).status_code, 200);

        let hardware = json!({"type": "hardware", "hardware": {"cuda": "V11.1", "mem": 64}});
        assert_eq!(call(&svc, Api::Stats, NODE_A, hardware).status_code, 200);
        let runtime = json!({"type": "runtime", "runtime": {"loadavg": 0.5}});
        assert_eq!(call(&svc, Api::Stats, NODE_A, runtime).status_code, 200);

        let resp = call(&svc, Api::Query, "10.9.9.9", json!({"type": "hardware", "hostname": "node1"}));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.data.unwrap()["node1"]["cuda"], "V11.1");

        assert_eq!(call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node2"})).status_code, 200);
        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "hardware", "hostname": "node1"}));
        assert_eq!(resp.status_code, 406);
        assert!(resp.detail().contains("not found"));
        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "runtime", "hostname": "node1"}));
        assert_eq!(resp.status_code, 406);
        assert_eq!(svc.registry().last_ack("node1"), None);
        assert!(svc.registry().last_ack("node2").is_some());
    }

    #[test]
    fn test_rename_leaves_other_nodes_alone() {
        let svc = service();
        call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node1"}));
        call(&svc, Api::Heartbeat, "10.0.0.2", json!({"hostname": "other"}));
        call(&svc, Api::Stats, "10.0.0.2", json!({"type": "hardware", "hardware": {"mem": 1}}));

        call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node2"}));
        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "hardware", "hostname": "other"}));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.data.unwrap()["other"]["mem"], 1);
    }

    #[test]
    fn test_stats_from_unregistered_address() {
        let svc = service();
        let resp = call(&svc, Api::Stats, NODE_A, json!({"type": "runtime", "runtime": {}}));
        assert_eq!(resp.status_code, 401);
    }

    #[test]
    fn test_malformed_bodies_are_bad_requests() {
        let svc = service();
        assert_eq!(svc.handle(Api::Heartbeat, addr(NODE_A), b"not json").status_code, 400);
        assert_eq!(call(&svc, Api::Heartbeat, NODE_A, json!({})).status_code, 400);
        assert_eq!(call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "  "})).status_code, 400);

        call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node1"}));
        assert_eq!(call(&svc, Api::Stats, NODE_A, json!({"type": "hardware"})).status_code, 400);
        assert_eq!(call(&svc, Api::Query, NODE_A, json!({"type": "gossip"})).status_code, 400);
    }

    #[test]
    fn test_runtime_query_rejects_empty_window() {
        let svc = service();
        call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node1"}));
        for (start, end) in [(100, 100), (200, 100)] {
            let body = json!({"type": "runtime", "hostname": "node1", "start_ts": start, "end_ts": end});
            assert_eq!(call(&svc, Api::Query, NODE_A, body).status_code, 406);
        }
        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "runtime", "end_ts": 0}));
        assert_eq!(resp.status_code, 406);
    }

    #[test]
    fn test_runtime_query_window() {
        let svc = service();
        call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node1"}));
        for ts in [now_ts() - 30, now_ts() - 20, now_ts() - 10] {
            let body = json!({"type": "runtime", "runtime": {"ts": ts}});
            call(&svc, Api::Stats, NODE_A, body);
        }
        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "runtime", "hostname": "node1"}));
        assert_eq!(resp.data.unwrap()["node1"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_task_batch_is_all_or_nothing() {
        let svc = service();
        call(&svc, Api::Heartbeat, NODE_A, json!({"hostname": "node1"}));
        let good = json!({"gpu_id": 0, "username": "alice", "command": "train", "start_ts": 10, "end_ts": 30});
        let bad = json!({"gpu_id": 1, "username": "bob", "command": "eval", "start_ts": 50, "end_ts": 40});
        let resp = call(&svc, Api::Stats, NODE_A, json!({"type": "tasks", "tasks": [good, bad]}));
        assert_eq!(resp.status_code, 400);
        assert_eq!(svc.ledger().len(), 0);

        let forged = json!({"hostname": "elsewhere", "gpu_id": 0, "username": "alice",
                            "command": "train", "start_ts": 10, "end_ts": 30});
        let resp = call(&svc, Api::Stats, NODE_A, json!({"type": "tasks", "tasks": [forged]}));
        assert_eq!(resp.status_code, 200);

        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "tasks", "username": "alice"}));
        let tasks = resp.data.unwrap();
        assert_eq!(tasks[0]["hostname"], "node1");
        assert!(tasks[0]["ingested_ts"].is_i64());
    }

    #[test]
    fn test_quota_queries() {
        let svc = service();
        svc.quota.apply_rules("alice 100\nbob 5\n");
        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "quota", "username": "alice"}));
        assert_eq!(resp.data.unwrap(), json!({"alice": {"available": 6000, "total": 6000}}));

        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "quota"}));
        assert_eq!(resp.data.unwrap().as_object().unwrap().len(), 2);

        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "quota", "username": "mallory"}));
        assert_eq!(resp.status_code, 406);
    }

    #[test]
    fn test_settings_query_returns_config() {
        let svc = service();
        let resp = call(&svc, Api::Query, NODE_A, json!({"type": "settings"}));
        assert_eq!(resp.data.unwrap()["rtdata_retention_days"], 21);
    }

    #[test]
    fn test_realloc_is_not_implemented() {
        let svc = service();
        let body = json!({"username": "alice", "password": "hunter2", "gpu_count": 2});
        let resp = call(&svc, Api::Realloc, NODE_A, body);
        assert_eq!(resp.status_code, 501);
    }

    #[test]
    fn test_handler_panic_becomes_internal_error() {
        let resp = guarded(Api::Stats, addr(NODE_A), || panic!("ledger exploded"));
        assert_eq!(resp.status_code, 500);
        assert!(resp.data.is_none());
    }
}
