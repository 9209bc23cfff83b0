//! Fleet agent - samples one GPU node and ships it to the aggregator
//!
//! - [`provider`]: raw readings of the host (driver tools, /proc, sysinfo)
//! - [`collector`]: hardware/runtime snapshots and task lifecycle
//! - [`delivery`]: HTTP client with transport and status retries
//! - [`agent`]: start-up sequence and periodic duties

pub mod agent;
pub mod collector;
pub mod config;
pub mod coredump;
pub mod delivery;
pub mod provider;

pub use agent::Agent;
pub use collector::{Collector, CollectorState, RunningTask};
pub use config::AgentConfig;
pub use delivery::{DeliveryClient, DeliveryError, DeliveryTiming, RetryPolicy};
pub use provider::{GpuActivity, GpuLoad, GpuProcessInfo, Reading, ReadingError, SnapshotProvider, SystemProvider};
