//! Snapshot providers: where raw hardware and runtime figures come from
//!
//! Every reading is independent. A failing reading yields a [`ReadingError`] for its
//! own field and never prevents the others from running.
//!
//! [`SystemProvider`] reads GPUs through `nvidia-smi`, the CUDA toolkit
//! version through `nvcc`, and everything else through `sysinfo`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::process::Command;
use sysinfo::{Pid, System, Users};
use tracing::debug;

use fleet_proto::{CpuDescriptor, GpuDevice};

#[derive(Debug, thiserror::Error)]
pub enum ReadingError {
    #[error("`{command}` could not be run: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: String },
    #[error("unexpected output from {what}: {detail}")]
    Parse { what: &'static str, detail: String },
    #[error("{0} is not available on this node")]
    Unavailable(&'static str),
}

pub type Reading<T> = Result<T, ReadingError>;

/// Utilisation of one board.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuLoad {
    pub gpu_id: u32,
    pub temp: Option<i64>,
    pub usage: Option<i64>,
    pub mem_usage: Option<u64>,
}

/// A process currently holding a GPU context.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuProcessInfo {
    pub pid: u32,
    pub gpu_id: u32,
    pub username: String,
    /// Short command as reported by the GPU driver.
    pub command: String,
    pub gpu_memory_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuActivity {
    pub gpus: Vec<GpuLoad>,
    pub processes: Vec<GpuProcessInfo>,
}

pub trait SnapshotProvider: Send + Sync {
    fn gpu_inventory(&self) -> Reading<Vec<GpuDevice>>;
    fn cuda_version(&self) -> Reading<String>;
    fn os_version(&self) -> Reading<String>;
    fn cpu(&self) -> Reading<CpuDescriptor>;
    /// MB
    fn total_memory(&self) -> Reading<u64>;

    fn gpu_activity(&self) -> Reading<GpuActivity>;
    /// Full command line of a process.
    fn command_line(&self, pid: u32) -> Reading<String>;
    fn load_average(&self) -> Reading<f64>;
    fn cpu_usage(&self) -> Reading<f64>;
    /// MB
    fn free_memory(&self) -> Reading<u64>;
}

const NVIDIA_SMI: &str = "nvidia-smi";

fn run(program: &str, args: &[&str]) -> Reading<String> {
    let command = format!("{program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ReadingError::Spawn { command: command.clone(), source })?;
    if !output.status.success() {
        return Err(ReadingError::Failed { command, status: output.status.to_string() });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `nvidia-smi --format=csv,noheader,nounits` rows, `[N/A]` style cells as `None`.
fn csv_rows(text: &str) -> impl Iterator<Item = Vec<Option<&str>>> {
    text.lines().filter(|l| !l.trim().is_empty()).map(|line| {
        line.split(',')
            .map(str::trim)
            .map(|cell| (!cell.is_empty() && !cell.starts_with('[') && cell != "N/A").then_some(cell))
            .collect()
    })
}

fn cell<'a>(row: &[Option<&'a str>], i: usize, what: &'static str) -> Reading<&'a str> {
    row.get(i)
        .copied()
        .flatten()
        .ok_or_else(|| ReadingError::Parse { what, detail: format!("missing column {i}") })
}

fn number<T: std::str::FromStr>(row: &[Option<&str>], i: usize, what: &'static str) -> Reading<T> {
    let raw = cell(row, i, what)?;
    raw.parse()
        .map_err(|_| ReadingError::Parse { what, detail: format!("{raw:?} is not a number") })
}

fn optional<T: std::str::FromStr>(row: &[Option<&str>], i: usize) -> Option<T> {
    row.get(i).copied().flatten().and_then(|raw| raw.parse().ok())
}

/// `index,uuid,name,memory.total`
pub fn parse_inventory(text: &str) -> Reading<Vec<GpuDevice>> {
    csv_rows(text)
        .map(|row| -> Reading<GpuDevice> {
            Ok(GpuDevice {
                gpu_id: number(&row, 0, "gpu inventory")?,
                uuid: cell(&row, 1, "gpu inventory")?.to_string(),
                name: cell(&row, 2, "gpu inventory")?.to_string(),
                mem: number(&row, 3, "gpu inventory")?,
            })
        })
        .collect()
}

/// `index,uuid,temperature.gpu,utilization.gpu,memory.used`, plus the
/// uuid to index map needed to place compute apps.
pub fn parse_gpu_load(text: &str) -> Reading<(Vec<GpuLoad>, HashMap<String, u32>)> {
    let mut loads = Vec::new();
    let mut by_uuid = HashMap::new();
    for row in csv_rows(text) {
        let gpu_id: u32 = number(&row, 0, "gpu load")?;
        by_uuid.insert(cell(&row, 1, "gpu load")?.to_string(), gpu_id);
        loads.push(GpuLoad {
            gpu_id,
            temp: optional(&row, 2),
            usage: optional(&row, 3),
            mem_usage: optional(&row, 4),
        });
    }
    Ok((loads, by_uuid))
}

/// `pid,process_name,gpu_uuid,used_memory`. Usernames are left empty.
pub fn parse_compute_apps(text: &str, by_uuid: &HashMap<String, u32>) -> Reading<Vec<GpuProcessInfo>> {
    let mut processes = Vec::new();
    for row in csv_rows(text) {
        let uuid = cell(&row, 2, "compute apps")?;
        let Some(&gpu_id) = by_uuid.get(uuid) else {
            debug!("compute app on unknown gpu {uuid}");
            continue;
        };
        processes.push(GpuProcessInfo {
            pid: number(&row, 0, "compute apps")?,
            gpu_id,
            username: String::new(),
            command: cell(&row, 1, "compute apps").unwrap_or_default().to_string(),
            gpu_memory_usage: optional(&row, 3),
        });
    }
    Ok(processes)
}

/// `Cuda compilation tools, release 11.1, V11.1.105` gives `V11.1.105`.
pub fn parse_nvcc_version(text: &str) -> Reading<String> {
    text.lines()
        .find(|l| l.contains("release"))
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
        .ok_or_else(|| ReadingError::Parse { what: "nvcc", detail: "no release line".into() })
}

pub struct SystemProvider {
    sys: Mutex<System>,
}

impl Default for SystemProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProvider {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys: Mutex::new(sys) }
    }

    fn owners(&self, processes: &mut [GpuProcessInfo]) {
        let users = Users::new_with_refreshed_list();
        let mut sys = self.sys.lock();
        sys.refresh_processes();
        for proc in processes {
            let owner = sys
                .process(Pid::from_u32(proc.pid))
                .and_then(|p| p.user_id())
                .and_then(|uid| users.get_user_by_id(uid))
                .map(|u| u.name().to_string());
            proc.username = owner.unwrap_or_else(|| "unknown".to_string());
        }
    }
}

impl SnapshotProvider for SystemProvider {
    fn gpu_inventory(&self) -> Reading<Vec<GpuDevice>> {
        let out = run(
            NVIDIA_SMI,
            &["--query-gpu=index,uuid,name,memory.total", "--format=csv,noheader,nounits"],
        )?;
        parse_inventory(&out)
    }

    fn cuda_version(&self) -> Reading<String> {
        parse_nvcc_version(&run("nvcc", &["--version"])?)
    }

    fn os_version(&self) -> Reading<String> {
        System::long_os_version().ok_or(ReadingError::Unavailable("os version"))
    }

    fn cpu(&self) -> Reading<CpuDescriptor> {
        let mut sys = self.sys.lock();
        sys.refresh_cpu();
        let cpus = sys.cpus();
        let first = cpus.first().ok_or(ReadingError::Unavailable("cpu list"))?;
        Ok(CpuDescriptor {
            name: Some(first.brand().trim().to_string()).filter(|b| !b.is_empty()),
            proc_num: Some(cpus.len()),
            clock_speed: Some(first.frequency() as f64).filter(|f| *f > 0.0),
        })
    }

    fn total_memory(&self) -> Reading<u64> {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        match sys.total_memory() / (1024 * 1024) {
            0 => Err(ReadingError::Unavailable("memory size")),
            mb => Ok(mb),
        }
    }

    fn gpu_activity(&self) -> Reading<GpuActivity> {
        let out = run(
            NVIDIA_SMI,
            &[
                "--query-gpu=index,uuid,temperature.gpu,utilization.gpu,memory.used",
                "--format=csv,noheader,nounits",
            ],
        )?;
        let (gpus, by_uuid) = parse_gpu_load(&out)?;
        let out = run(
            NVIDIA_SMI,
            &["--query-compute-apps=pid,process_name,gpu_uuid,used_memory", "--format=csv,noheader,nounits"],
        )?;
        let mut processes = parse_compute_apps(&out, &by_uuid)?;
        self.owners(&mut processes);
        Ok(GpuActivity { gpus, processes })
    }

    fn command_line(&self, pid: u32) -> Reading<String> {
        let raw = std::fs::read(format!("/proc/{pid}/cmdline"))
            .map_err(|source| ReadingError::Spawn { command: format!("read /proc/{pid}/cmdline"), source })?;
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ").trim().to_string();
        if cmdline.is_empty() {
            return Err(ReadingError::Unavailable("command line"));
        }
        Ok(cmdline)
    }

    fn load_average(&self) -> Reading<f64> {
        if !cfg!(unix) {
            return Err(ReadingError::Unavailable("load average"));
        }
        Ok(System::load_average().one)
    }

    /// Busy percentage since the previous call.
    fn cpu_usage(&self) -> Reading<f64> {
        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        Ok(f64::from(sys.global_cpu_info().cpu_usage()))
    }

    fn free_memory(&self) -> Reading<u64> {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        if sys.total_memory() == 0 {
            return Err(ReadingError::Unavailable("memory size"));
        }
        Ok(sys.available_memory() / (1024 * 1024))
    }
}
