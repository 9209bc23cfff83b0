/*!
Scripted snapshot provider for running agents without GPUs

Tests start and stop fake GPU processes; every reading comes from the script.
Clones share the same script, so a test keeps a handle while the agent owns
another.
*/

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_agent::{GpuActivity, GpuLoad, GpuProcessInfo, Reading, ReadingError, SnapshotProvider};
use fleet_proto::{CpuDescriptor, GpuDevice};

#[derive(Debug)]
struct Script {
    gpus: Vec<GpuDevice>,
    /// Keyed by pid; value is the full command line.
    processes: BTreeMap<u32, (GpuProcessInfo, String)>,
    gpu_down: bool,
    total_memory: u64,
    free_memory: u64,
}

#[derive(Clone)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    /// A node with `gpu_count` identical 16 GB boards.
    pub fn new(gpu_count: u32) -> Self {
        let gpus = (0..gpu_count)
            .map(|gpu_id| GpuDevice {
                gpu_id,
                uuid: format!("GPU-stub-{gpu_id:04}"),
                name: "Stub Tesla V100".to_string(),
                mem: 16160,
            })
            .collect();
        Self {
            script: Arc::new(Mutex::new(Script {
                gpus,
                processes: BTreeMap::new(),
                gpu_down: false,
                total_memory: 64_000,
                free_memory: 48_000,
            })),
        }
    }

    pub fn start_process(&self, pid: u32, gpu_id: u32, username: &str, command_line: &str) {
        let short = command_line.split_whitespace().next().unwrap_or_default().to_string();
        let info = GpuProcessInfo {
            pid,
            gpu_id,
            username: username.to_string(),
            command: short,
            gpu_memory_usage: Some(1024),
        };
        self.script.lock().processes.insert(pid, (info, command_line.to_string()));
    }

    pub fn stop_process(&self, pid: u32) {
        self.script.lock().processes.remove(&pid);
    }

    /// Make the GPU driver readings fail, as if the driver went away.
    pub fn set_gpu_down(&self, down: bool) {
        self.script.lock().gpu_down = down;
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SnapshotProvider for ScriptedProvider {
    fn gpu_inventory(&self) -> Reading<Vec<GpuDevice>> {
        let script = self.script.lock();
        if script.gpu_down {
            return Err(ReadingError::Unavailable("gpu driver"));
        }
        Ok(script.gpus.clone())
    }

    fn cuda_version(&self) -> Reading<String> {
        Ok("V11.1.105".to_string())
    }

    fn os_version(&self) -> Reading<String> {
        Ok("Linux (Stub 22.04)".to_string())
    }

    fn cpu(&self) -> Reading<CpuDescriptor> {
        Ok(CpuDescriptor { name: Some("Stub Xeon".to_string()), proc_num: Some(32), clock_speed: Some(2400.0) })
    }

    fn total_memory(&self) -> Reading<u64> {
        Ok(self.script.lock().total_memory)
    }

    fn gpu_activity(&self) -> Reading<GpuActivity> {
        let script = self.script.lock();
        if script.gpu_down {
            return Err(ReadingError::Unavailable("gpu driver"));
        }
        let gpus = script
            .gpus
            .iter()
            .map(|g| {
                let busy = script.processes.values().any(|(p, _)| p.gpu_id == g.gpu_id);
                GpuLoad {
                    gpu_id: g.gpu_id,
                    temp: Some(if busy { 71 } else { 35 }),
                    usage: Some(if busy { 98 } else { 0 }),
                    mem_usage: Some(
                        script
                            .processes
                            .values()
                            .filter(|(p, _)| p.gpu_id == g.gpu_id)
                            .filter_map(|(p, _)| p.gpu_memory_usage)
                            .sum(),
                    ),
                }
            })
            .collect();
        let processes = script.processes.values().map(|(p, _)| p.clone()).collect();
        Ok(GpuActivity { gpus, processes })
    }

    fn command_line(&self, pid: u32) -> Reading<String> {
        self.script
            .lock()
            .processes
            .get(&pid)
            .map(|(_, cmdline)| cmdline.clone())
            .ok_or(ReadingError::Unavailable("process"))
    }

    fn load_average(&self) -> Reading<f64> {
        Ok(1.5)
    }

    fn cpu_usage(&self) -> Reading<f64> {
        Ok(12.5)
    }

    fn free_memory(&self) -> Reading<u64> {
        Ok(self.script.lock().free_memory)
    }
}
