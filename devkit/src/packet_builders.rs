/*!
Builders for well-formed packets

Shortcuts for the packets tests send most, with plausible default values.
*/

use fleet_proto::{
    CpuDescriptor, GpuDevice, GpuRuntime, HardwareSnapshot, QueryPacket, RuntimeSample, StatsPacket, TaskFilter,
    TaskRecord, Timestamp,
};

pub struct PacketBuilder;

impl PacketBuilder {
    pub fn hardware(gpu_count: u32) -> StatsPacket {
        let gpu = (0..gpu_count)
            .map(|gpu_id| GpuDevice {
                gpu_id,
                uuid: format!("GPU-test-{gpu_id:04}"),
                name: "Tesla V100-SXM2-16GB".to_string(),
                mem: 16160,
            })
            .collect();
        StatsPacket::Hardware {
            hardware: HardwareSnapshot {
                hostname: None,
                gpu: Some(gpu),
                cuda: Some("V11.1.105".to_string()),
                os: Some("Linux".to_string()),
                cpu: Some(CpuDescriptor { name: Some("Xeon".to_string()), proc_num: Some(32), clock_speed: None }),
                mem: Some(64_000),
            },
        }
    }

    /// An idle single-GPU sample taken at `ts`.
    pub fn runtime(ts: Timestamp) -> StatsPacket {
        StatsPacket::Runtime {
            runtime: RuntimeSample {
                ts: Some(ts),
                gpu: Some(vec![GpuRuntime { gpu_id: 0, temp: Some(35), usage: Some(0), mem_usage: Some(0), procs: Vec::new() }]),
                loadavg: Some(0.5),
                cpu_usage: Some(3.0),
                mem_free: Some(60_000),
            },
        }
    }

    pub fn tasks(tasks: Vec<TaskRecord>) -> StatsPacket {
        StatsPacket::Tasks { tasks }
    }

    pub fn hardware_of(hostname: &str) -> QueryPacket {
        QueryPacket::Hardware { hostname: Some(hostname.to_string()) }
    }

    pub fn runtime_of(hostname: &str, start_ts: Timestamp, end_ts: Timestamp) -> QueryPacket {
        QueryPacket::Runtime { hostname: Some(hostname.to_string()), start_ts: Some(start_ts), end_ts: Some(end_ts) }
    }

    pub fn tasks_of(username: &str) -> QueryPacket {
        QueryPacket::Tasks(TaskFilter { username: Some(username.to_string()), ..TaskFilter::default() })
    }
}

/// Fluent builder for a finished task.
#[derive(Debug, Clone)]
pub struct TaskRecordBuilder {
    record: TaskRecord,
}

impl TaskRecordBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            record: TaskRecord {
                hostname: String::new(),
                gpu_id: 0,
                username: username.to_string(),
                command: "python train.py".to_string(),
                start_ts: 0,
                end_ts: 0,
                ingested_ts: None,
            },
        }
    }

    pub fn gpu(mut self, gpu_id: u32) -> Self {
        self.record.gpu_id = gpu_id;
        self
    }

    pub fn command(mut self, command: &str) -> Self {
        self.record.command = command.to_string();
        self
    }

    pub fn span(mut self, start_ts: Timestamp, end_ts: Timestamp) -> Self {
        self.record.start_ts = start_ts;
        self.record.end_ts = end_ts;
        self
    }

    /// Hostname the sender claims; the aggregator overwrites it.
    pub fn claimed_host(mut self, hostname: &str) -> Self {
        self.record.hostname = hostname.to_string();
        self
    }

    pub fn build(self) -> TaskRecord {
        self.record
    }
}
