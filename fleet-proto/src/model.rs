//! Shared data model.
//!
//! Every reading on the node can fail on its own, so snapshot fields are
//! independently nullable: `None` means "unknown", never "zero".

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Slow-changing inventory of a node. Latest value wins on the aggregator,
/// the whole snapshot is replaced on every `stats:hardware`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub gpu: Option<Vec<GpuDevice>>,
    #[serde(default)]
    pub cuda: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub cpu: Option<CpuDescriptor>,
    /// Total memory in MB.
    #[serde(default)]
    pub mem: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub gpu_id: u32,
    pub uuid: String,
    pub name: String,
    /// Board memory in MB.
    pub mem: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    /// Logical processor count.
    #[serde(default)]
    pub proc_num: Option<usize>,
    /// Clock speed in MHz.
    #[serde(default)]
    pub clock_speed: Option<f64>,
}

/// One frame of runtime utilisation.
///
/// `ts` may be absent on the wire; the aggregator stamps it at ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,
    #[serde(default)]
    pub gpu: Option<Vec<GpuRuntime>>,
    #[serde(default)]
    pub loadavg: Option<f64>,
    /// CPU busy percentage.
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    /// Free memory in MB.
    #[serde(default)]
    pub mem_free: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuRuntime {
    pub gpu_id: u32,
    /// Celsius.
    #[serde(default)]
    pub temp: Option<i64>,
    /// Utilisation percentage.
    #[serde(default)]
    pub usage: Option<i64>,
    /// Used board memory in MB.
    #[serde(default)]
    pub mem_usage: Option<u64>,
    #[serde(default)]
    pub procs: Vec<GpuProcess>,
}

/// A GPU-bound process as published to browsers, without its pid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub username: String,
    pub command: String,
    #[serde(default)]
    pub gpu_memory_usage: Option<u64>,
    pub start_ts: Timestamp,
}

/// A completed GPU task. Immutable once both sigils are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Overwritten by the aggregator with the name registered for the sender.
    #[serde(default)]
    pub hostname: String,
    pub gpu_id: u32,
    pub username: String,
    pub command: String,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_ts: Option<Timestamp>,
}

/// Advisory quota, in seconds. `available` is never decremented by the
/// aggregator itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub username: String,
    pub available: i64,
    pub total: i64,
}
