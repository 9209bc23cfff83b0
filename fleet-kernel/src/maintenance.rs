/**
 * MAINTENANCE - periodic duties of the aggregator
 *
 * DUTIES (one tokio task each):
 * - coredump: snapshot the runtime tables and sweep silent nodes
 * - flush:    snapshot the task ledger (retention applied on the way)
 * - backup:   copy the task ledger snapshot aside
 * - quota:    reload the rule file on SIGUSR1 (unix only)
 *
 * Each duty sleeps its period, then runs on the blocking pool; a run never
 * overlaps the next one of the same kind. `stop` ends every loop and waits
 * for a run in progress to finish, so nothing mutates state afterwards.
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_proto::now_ts;

use crate::persist::DurableStore;
use crate::service::IngestionService;

pub struct Maintenance {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

fn save_all(stores: &[Arc<dyn DurableStore>]) {
    for store in stores {
        if let Err(e) = store.save() {
            error!("snapshot of {} failed: {e}", store.name());
        }
    }
}

fn spawn_duty<F>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, duty: F) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let duty = Arc::new(duty);
    tokio::spawn(async move {
        debug!("{name} duty every {}s", period.as_secs());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => break,
            }
            let run = duty.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || run()).await {
                error!("{name} duty panicked: {e}");
            }
        }
        debug!("{name} duty stopped");
    })
}

#[cfg(unix)]
fn spawn_quota_reloader(service: Arc<IngestionService>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SIGUSR1 handler not installed, quota reload disabled: {e}");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = usr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGUSR1 received, reloading quota rules");
                    let svc = service.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || svc.reload_quota()).await {
                        error!("quota reload panicked: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_quota_reloader(_service: Arc<IngestionService>, _shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    None
}

impl Maintenance {
    pub fn start(service: Arc<IngestionService>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let config = service.config().clone();
        let mut handles = Vec::new();

        let svc = service.clone();
        let caches = service.cache_stores();
        handles.push(spawn_duty("coredump", config.coredump_period(), rx.clone(), move || {
            let forgotten = svc.sweep_dead_nodes(now_ts());
            if !forgotten.is_empty() {
                info!("liveness sweep forgot {}", forgotten.join(", "));
            }
            save_all(&caches);
        }));

        let ledger = service.ledger().clone();
        handles.push(spawn_duty("flush", config.flush_period(), rx.clone(), move || {
            if let Err(e) = ledger.save() {
                error!("task ledger flush failed: {e}");
            }
        }));

        let ledger = service.ledger().clone();
        handles.push(spawn_duty("backup", config.backup_period(), rx.clone(), move || {
            if let Err(e) = ledger.backup(now_ts()) {
                error!("task ledger backup failed: {e}");
            }
        }));

        handles.extend(spawn_quota_reloader(service, rx));

        Self { shutdown, handles }
    }

    /// Stop every duty and wait for runs in progress.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("maintenance task ended abnormally: {e}");
            }
        }
        info!("maintenance stopped");
    }
}

/// Save every store, in order. Used at teardown.
pub fn flush_all(stores: &[Arc<dyn DurableStore>]) {
    save_all(stores);
    info!("flushed {} durable stores", stores.len());
}
