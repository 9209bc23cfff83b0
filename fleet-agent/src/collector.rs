//! Hardware and runtime sampling, and GPU task lifecycle tracking
//!
//! A task starts the first time its pid is seen holding a GPU and ends the
//! first sample it is missing from. Both timestamps are stamped exactly once.
//! A task that starts and ends between two samples is never seen.
//!
//! The running-task table and the latest sample live behind one lock: the
//! reaper of finished tasks may run while the next sample is taken.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

use fleet_proto::{GpuProcess, GpuRuntime, HardwareSnapshot, RuntimeSample, TaskRecord, Timestamp};

use crate::provider::{Reading, SnapshotProvider};

/// A task whose end has not been observed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    pub gpu_id: u32,
    pub username: String,
    pub command: String,
    pub start_ts: Timestamp,
}

/// Everything the agent keeps between restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorState {
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hardware: Option<HardwareSnapshot>,
    #[serde(default)]
    pub latest: Option<RuntimeSample>,
    /// Keyed by pid.
    #[serde(default)]
    pub running: BTreeMap<u32, RunningTask>,
}

pub struct Collector {
    provider: Arc<dyn SnapshotProvider>,
    hostname: String,
    excluded_users: HashSet<String>,
    state: Mutex<CollectorState>,
}

fn field<T>(name: &str, reading: Reading<T>) -> Option<T> {
    reading.map_err(|e| debug!("reading {name} failed: {e}")).ok()
}

impl Collector {
    pub fn new(provider: Arc<dyn SnapshotProvider>, hostname: String, excluded_users: &[String]) -> Self {
        Self {
            provider,
            hostname,
            excluded_users: excluded_users.iter().cloned().collect(),
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Sample the slow-changing inventory. Each field fails on its own.
    pub fn hardware(&self) -> HardwareSnapshot {
        let p = &self.provider;
        let snapshot = HardwareSnapshot {
            hostname: Some(self.hostname.clone()),
            gpu: field("gpu inventory", p.gpu_inventory()),
            cuda: field("cuda", p.cuda_version()),
            os: field("os", p.os_version()),
            cpu: field("cpu", p.cpu()),
            mem: field("memory", p.total_memory()),
        };
        self.state.lock().hardware = Some(snapshot.clone());
        snapshot
    }

    /// Take one runtime sample at `now`.
    ///
    /// Returns the pids currently holding a GPU, or `None` when the GPU query
    /// failed (unknown is not the same as absent).
    pub fn sample(&self, now: Timestamp) -> Option<Vec<u32>> {
        let p = &self.provider;
        let activity = field("gpu activity", p.gpu_activity());
        let loadavg = field("load average", p.load_average());
        let cpu_usage = field("cpu usage", p.cpu_usage());
        let mem_free = field("free memory", p.free_memory());

        let mut state = self.state.lock();
        let mut active = None;
        let gpu = activity.map(|activity| {
            let mut gpus: Vec<GpuRuntime> = activity
                .gpus
                .iter()
                .map(|g| GpuRuntime {
                    gpu_id: g.gpu_id,
                    temp: g.temp,
                    usage: g.usage,
                    mem_usage: g.mem_usage,
                    procs: Vec::new(),
                })
                .collect();
            let mut pids = Vec::new();
            for proc in activity.processes {
                if self.excluded_users.contains(&proc.username) {
                    continue;
                }
                pids.push(proc.pid);
                let task = state.running.entry(proc.pid).or_insert_with(|| {
                    let command = p.command_line(proc.pid).unwrap_or_else(|e| {
                        debug!("pid {}: {e}, using driver command", proc.pid);
                        proc.command.clone()
                    });
                    debug!("task started: pid {} of {} on gpu {}", proc.pid, proc.username, proc.gpu_id);
                    RunningTask { gpu_id: proc.gpu_id, username: proc.username.clone(), command, start_ts: now }
                });
                let published = GpuProcess {
                    username: task.username.clone(),
                    command: task.command.clone(),
                    gpu_memory_usage: proc.gpu_memory_usage,
                    start_ts: task.start_ts,
                };
                if let Some(g) = gpus.iter_mut().find(|g| g.gpu_id == proc.gpu_id) {
                    g.procs.push(published);
                }
            }
            active = Some(pids);
            gpus
        });

        state.latest = Some(RuntimeSample { ts: Some(now), gpu, loadavg, cpu_usage, mem_free });
        active
    }

    /// End every running task missing from `active`, at `now`.
    pub fn reap(&self, active: &[u32], now: Timestamp) -> Vec<TaskRecord> {
        let active: HashSet<u32> = active.iter().copied().collect();
        let mut state = self.state.lock();
        let finished: Vec<u32> = state.running.keys().filter(|pid| !active.contains(pid)).copied().collect();
        finished
            .into_iter()
            .filter_map(|pid| state.running.remove(&pid))
            .map(|task| TaskRecord {
                hostname: self.hostname.clone(),
                gpu_id: task.gpu_id,
                username: task.username,
                command: task.command,
                start_ts: task.start_ts,
                end_ts: now,
                ingested_ts: None,
            })
            .collect()
    }

    pub fn latest(&self) -> Option<RuntimeSample> {
        self.state.lock().latest.clone()
    }

    pub fn running(&self) -> BTreeMap<u32, RunningTask> {
        self.state.lock().running.clone()
    }

    pub fn snapshot(&self) -> CollectorState {
        let mut state = self.state.lock().clone();
        state.saved_at = Some(Utc::now());
        state
    }

    pub fn restore(&self, saved: CollectorState) {
        *self.state.lock() = saved;
    }
}

impl Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector").field("hostname", &self.hostname).finish_non_exhaustive()
    }
}
