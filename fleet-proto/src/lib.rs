/*!
# fleet-proto - wire protocol shared by the kernel and its agents

One request/response call per logical operation:

- `heartbeat {hostname}` registers the caller's address under a logical name
- `stats {type, hardware|runtime|tasks}` pushes telemetry from a registered node
- `query {type, ...filters}` reads the aggregator's stores
- `realloc {username, password, gpu_count}` is reserved and always answers 501

Every call answers with a [`Response`] carrying `status_code`, `reason`, `ts`
and an optional `data` payload.
*/

pub mod clock;
pub mod model;
pub mod packets;
pub mod response;

pub use clock::{days_to_secs, mins_to_secs, now_ts, Timestamp};
pub use model::{
    CpuDescriptor, GpuDevice, GpuProcess, GpuRuntime, HardwareSnapshot, QuotaEntry, RuntimeSample,
    TaskRecord,
};
pub use packets::{Api, HeartbeatPacket, QueryPacket, ReallocPacket, StatsPacket, TaskFilter};
pub use response::{Response, StatusCode};
