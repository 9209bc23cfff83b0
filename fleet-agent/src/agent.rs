//! The agent's periodic duties
//!
//! Start-up: restore the local coredump, register with the aggregator (retried
//! until accepted), push the hardware snapshot, then arm four independent
//! duties:
//!
//! | duty      | first run after | period            |
//! |-----------|-----------------|-------------------|
//! | heartbeat | sample interval | heartbeat (or off)|
//! | sample    | immediately     | sample interval   |
//! | commit    | sample interval | commit interval   |
//! | coredump  | commit interval | coredump interval |
//!
//! Shutdown stops every duty, then writes the final coredump.
//!
//! An aggregator that answers a report with 401 has lost this node's binding
//! (restart, liveness sweep). The report waits for a new registration
//! handshake, shared by every duty that hit the 401, and is then sent once more.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_proto::{now_ts, Response, StatsPacket, TaskRecord};

use crate::collector::Collector;
use crate::config::AgentConfig;
use crate::coredump;
use crate::delivery::{DeliveryClient, DeliveryError, RetryPolicy};
use crate::provider::SnapshotProvider;

/// Status retries for the start-up hardware report.
const HARDWARE_RETRIES: u32 = 100;
/// Status retries for a batch of finished tasks.
const TASK_BATCH_RETRIES: u32 = 10;

/// Finished-task batches whose delivery is still in flight.
// TODO: persist pending batches in a local queue so they survive an agent restart.
#[derive(Default)]
struct PendingBatches {
    next_id: u64,
    batches: HashMap<u64, Vec<TaskRecord>>,
}

/// Registration handshake, shared by the start-up sequence and every duty.
struct Registrar {
    client: Arc<DeliveryClient>,
    collector: Arc<Collector>,
    hostname: String,
    /// Completed handshakes.
    generation: AtomicU64,
    handshake: tokio::sync::Mutex<()>,
}

impl Registrar {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Heartbeat until accepted, then report hardware.
    ///
    /// `seen` is the generation the caller last observed; callers racing on the
    /// same stale generation share a single handshake.
    async fn register(&self, seen: u64) -> Result<()> {
        {
            let _handshake = self.handshake.lock().await;
            if self.generation() != seen {
                return Ok(());
            }
            info!("registering as {}", self.hostname);
            self.client
                .heartbeat(&self.hostname, RetryPolicy::Forever)
                .await
                .context("registration failed")?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!("registered as {}", self.hostname);
        }

        let collector = self.collector.clone();
        let hardware = tokio::task::spawn_blocking(move || collector.hardware())
            .await
            .context("hardware sampling panicked")?;
        if let Err(e) = self
            .client
            .stats(&StatsPacket::Hardware { hardware }, RetryPolicy::Times(HARDWARE_RETRIES))
            .await
        {
            warn!("hardware snapshot not delivered: {e}");
        }
        Ok(())
    }

    /// Post a report, registering again first if the aggregator no longer knows us.
    async fn stats(&self, packet: &StatsPacket, policy: RetryPolicy) -> Result<Response, DeliveryError> {
        let seen = self.generation();
        match self.client.stats(packet, policy).await {
            Err(DeliveryError::Rejected { status_code: 401, .. }) => {
                warn!("{} report refused as unregistered, registering again", packet.kind());
                if let Err(e) = self.register(seen).await {
                    error!("re-registration failed: {e:#}");
                }
                self.client.stats(packet, policy).await
            }
            other => other,
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    collector: Arc<Collector>,
    client: Arc<DeliveryClient>,
    registrar: Arc<Registrar>,
    pending: Arc<Mutex<PendingBatches>>,
}

fn log_lost_tasks(tasks: &[TaskRecord], why: &str) {
    for task in tasks {
        error!(
            "task record lost ({why}): gpu {} user {} cmd {:?} start {} end {}",
            task.gpu_id, task.username, task.command, task.start_ts, task.end_ts
        );
    }
}

/// How a run in progress reacts to shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnShutdown {
    /// Abandon the run (network deliveries).
    Abandon,
    /// Let the run finish (local state mutations).
    Finish,
}

/// Run `duty` after `delay`, then every `period`, until shutdown.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    delay: Duration,
    period: Duration,
    on_shutdown: OnShutdown,
    mut shutdown: watch::Receiver<bool>,
    mut duty: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut wait = delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
            debug!("[{name}]");
            match on_shutdown {
                OnShutdown::Finish => duty().await,
                OnShutdown::Abandon => {
                    tokio::select! {
                        _ = duty() => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
            wait = period;
        }
        debug!("{name} duty stopped");
    })
}

impl Agent {
    pub fn new(config: AgentConfig, provider: Arc<dyn SnapshotProvider>) -> Result<Self> {
        let client = DeliveryClient::from_config(&config).context("cannot build delivery client")?;
        let client = Arc::new(client);
        let collector = Arc::new(Collector::new(provider, config.hostname.clone(), &config.excluded_users));
        let registrar = Registrar {
            client: client.clone(),
            collector: collector.clone(),
            hostname: config.hostname.clone(),
            generation: AtomicU64::new(0),
            handshake: tokio::sync::Mutex::new(()),
        };
        Ok(Self {
            config,
            collector,
            client,
            registrar: Arc::new(registrar),
            pending: Arc::default(),
        })
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Register, report hardware, and run the periodic duties until `shutdown`.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        self.collector.restore(coredump::load(&self.config.state_file()));

        let started = tokio::select! {
            res = self.registrar.register(0) => Some(res),
            _ = &mut shutdown => None,
        };
        let handles = match started {
            Some(Ok(())) => {
                let (stop, rx) = watch::channel(false);
                let handles = self.spawn_duties(rx);
                shutdown.await;
                let _ = stop.send(true);
                handles
            }
            Some(Err(e)) => return Err(e),
            None => Vec::new(),
        };

        info!("stopping agent duties");
        for handle in handles {
            if let Err(e) = handle.await {
                error!("agent duty ended abnormally: {e}");
            }
        }
        {
            let pending = self.pending.lock();
            for tasks in pending.batches.values() {
                log_lost_tasks(tasks, "undelivered at shutdown");
            }
        }
        self.dump().context("final coredump failed")?;
        info!("agent stopped");
        Ok(())
    }

    fn dump(&self) -> Result<()> {
        coredump::save(&self.config.state_file(), &self.collector.snapshot())
    }

    fn spawn_duties(&self, rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let config = &self.config;
        let mut handles = Vec::new();

        match config.heartbeat_period() {
            Some(period) => {
                let client = self.client.clone();
                let hostname = config.hostname.clone();
                handles.push(spawn_periodic("heartbeat", config.sample_period(), period, OnShutdown::Abandon, rx.clone(), move || {
                    let client = client.clone();
                    let hostname = hostname.clone();
                    async move {
                        if let Err(e) = client.heartbeat(&hostname, RetryPolicy::Once).await {
                            warn!("heartbeat failed: {e}");
                        }
                    }
                }));
            }
            None => info!("periodic heartbeat disabled"),
        }

        let collector = self.collector.clone();
        let registrar = self.registrar.clone();
        let pending = self.pending.clone();
        handles.push(spawn_periodic("sample", Duration::ZERO, config.sample_period(), OnShutdown::Finish, rx.clone(), move || {
            let collector = collector.clone();
            let registrar = registrar.clone();
            let pending = pending.clone();
            async move {
                let sampled = tokio::task::spawn_blocking(move || {
                    let now = now_ts();
                    collector.sample(now).map(|active| collector.reap(&active, now))
                })
                .await;
                match sampled {
                    Ok(Some(finished)) if !finished.is_empty() => deliver_tasks(registrar, pending, finished),
                    Ok(_) => {}
                    Err(e) => error!("sample cycle panicked: {e}"),
                }
            }
        }));

        let collector = self.collector.clone();
        let registrar = self.registrar.clone();
        handles.push(spawn_periodic("commit", config.sample_period(), config.commit_period(), OnShutdown::Abandon, rx.clone(), move || {
            let latest = collector.latest();
            let registrar = registrar.clone();
            async move {
                let Some(runtime) = latest else { return };
                if let Err(e) = registrar.stats(&StatsPacket::Runtime { runtime }, RetryPolicy::Once).await {
                    warn!("runtime sample dropped: {e}");
                }
            }
        }));

        let collector = self.collector.clone();
        let path = config.state_file();
        handles.push(spawn_periodic("coredump", config.commit_period(), config.coredump_period(), OnShutdown::Finish, rx, move || {
            let state = collector.snapshot();
            let path = path.clone();
            async move {
                let written = tokio::task::spawn_blocking(move || coredump::save(&path, &state)).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("coredump failed: {e:#}"),
                    Err(e) => error!("coredump panicked: {e}"),
                }
            }
        }));

        handles
    }
}

/// Post a batch of finished tasks in the background.
fn deliver_tasks(registrar: Arc<Registrar>, pending: Arc<Mutex<PendingBatches>>, tasks: Vec<TaskRecord>) {
    info!("{} tasks finished", tasks.len());
    let id = {
        let mut pending = pending.lock();
        let id = pending.next_id;
        pending.next_id += 1;
        pending.batches.insert(id, tasks.clone());
        id
    };
    tokio::spawn(async move {
        let packet = StatsPacket::Tasks { tasks };
        let result = registrar.stats(&packet, RetryPolicy::Times(TASK_BATCH_RETRIES)).await;
        let Some(tasks) = pending.lock().batches.remove(&id) else { return };
        if let Err(e) = result {
            log_lost_tasks(&tasks, &e.to_string());
        }
    });
}
