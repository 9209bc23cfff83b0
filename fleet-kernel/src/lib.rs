//! Aggregator side of the GPU fleet telemetry collector.

pub mod config;
pub mod error;
pub mod http;
pub mod inventory;
pub mod kernel;
pub mod ledger;
pub mod maintenance;
pub mod persist;
pub mod quota;
pub mod registry;
pub mod service;
pub mod timeseries;

pub use config::{load_config, load_config_from, KernelConfig};
pub use error::{ApiError, ApiResult};
pub use kernel::Kernel;
pub use service::IngestionService;
