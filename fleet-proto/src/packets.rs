//! Request packets. `type` discriminated payloads are modelled as tagged
//! enums so an unknown `type` is a deserialization failure, not a lookup miss.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::model::{HardwareSnapshot, RuntimeSample, TaskRecord};

/// Endpoints exposed by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    Heartbeat,
    Stats,
    Query,
    Realloc,
}

impl Api {
    pub fn path(self) -> &'static str {
        match self {
            Api::Heartbeat => "/heartbeat",
            Api::Stats => "/stats",
            Api::Query => "/query",
            Api::Realloc => "/realloc",
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path()[1..])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPacket {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatsPacket {
    Hardware { hardware: HardwareSnapshot },
    Runtime { runtime: RuntimeSample },
    Tasks { tasks: Vec<TaskRecord> },
}

impl StatsPacket {
    pub fn kind(&self) -> &'static str {
        match self {
            StatsPacket::Hardware { .. } => "hardware",
            StatsPacket::Runtime { .. } => "runtime",
            StatsPacket::Tasks { .. } => "tasks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryPacket {
    Settings,
    Quota {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    Hardware {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
    },
    Runtime {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_ts: Option<Timestamp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_ts: Option<Timestamp>,
    },
    Tasks(TaskFilter),
}

impl QueryPacket {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryPacket::Settings => "settings",
            QueryPacket::Quota { .. } => "quota",
            QueryPacket::Hardware { .. } => "hardware",
            QueryPacket::Runtime { .. } => "runtime",
            QueryPacket::Tasks(_) => "tasks",
        }
    }
}

/// Task ledger filters. Every present field must match (logical AND).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Lower bound on `start_ts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<Timestamp>,
    /// Upper bound on `end_ts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<Timestamp>,
    /// Substring or regular expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ReallocPacket {
    pub username: String,
    pub password: String,
    pub gpu_count: u32,
}

impl fmt::Debug for ReallocPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReallocPacket")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("gpu_count", &self.gpu_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stats_payload_shape() {
        let packet = StatsPacket::Runtime { runtime: RuntimeSample::default() };
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["type"], "runtime");
        assert!(value["runtime"].is_object());
    }

    #[test]
    fn test_stats_missing_payload_is_rejected() {
        let err = serde_json::from_value::<StatsPacket>(json!({"type": "hardware"}));
        assert!(err.is_err());
        let err = serde_json::from_value::<StatsPacket>(json!({"type": "gossip", "gossip": {}}));
        assert!(err.is_err());
    }

    #[test]
    fn test_query_filters_are_flat() {
        let q: QueryPacket = serde_json::from_value(json!({
            "type": "tasks",
            "username": "alice",
            "gpu_id": 0,
        }))
        .unwrap();
        match q {
            QueryPacket::Tasks(filter) => {
                assert_eq!(filter.username.as_deref(), Some("alice"));
                assert_eq!(filter.gpu_id, Some(0));
                assert!(filter.command.is_none());
            }
            other => panic!("unexpected query {other:?}"),
        }

        let q: QueryPacket = serde_json::from_value(json!({"type": "settings"})).unwrap();
        assert_eq!(q, QueryPacket::Settings);
    }

    #[test]
    fn test_realloc_debug_hides_password() {
        let packet = ReallocPacket {
            username: "nobody".into(),
            password: "hunter2".into(),
            gpu_count: 1,
        };
        assert!(!format!("{packet:?}").contains("hunter2"));
    }
}
