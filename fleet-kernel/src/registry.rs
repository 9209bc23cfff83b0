/**
 * NODE REGISTRY - liveness and identity table of the fleet
 *
 * ROLE: maps a transport address onto the logical name its agent announced,
 * and remembers when each name was last heard from.
 *
 * IDENTITY: the address is authoritative. A heartbeat announcing a new name
 * from a known address replaces the node; the caller gets the previous name
 * back (while the write lock is still held) so every other store can purge it
 * before any request can observe the new binding.
 *
 * LOCKING: `bindings` before `last_ack`, always in that order.
 */

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

use fleet_proto::Timestamp;

use crate::error::{ApiError, ApiResult};
use crate::persist::{read_json, write_json, DurableStore, SnapshotError};

/// One address binding. `logical_name == None` is the UNKNOWN placeholder of
/// a statically declared node that has not sent its first heartbeat yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub address: IpAddr,
    pub logical_name: Option<String>,
}

/// Read-only view handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub address: IpAddr,
    pub logical_name: Option<String>,
    pub last_ack_ts: Option<Timestamp>,
    pub static_node: bool,
}

/// What a heartbeat did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Registered,
    Refreshed,
    Replaced { previous: String },
}

pub struct Registry {
    bindings: RwLock<HashMap<IpAddr, Binding>>,
    last_ack: Mutex<HashMap<String, Timestamp>>,
    static_nodes: HashSet<IpAddr>,
    dynamic_register: bool,
    bindings_file: PathBuf,
    last_ack_file: PathBuf,
}

impl Registry {
    pub fn new(
        static_nodes: &[IpAddr],
        dynamic_register: bool,
        bindings_file: PathBuf,
        last_ack_file: PathBuf,
    ) -> Self {
        let static_nodes: HashSet<IpAddr> = static_nodes.iter().map(|a| a.to_canonical()).collect();
        let bindings = static_nodes
            .iter()
            .map(|&address| (address, Binding { address, logical_name: None }))
            .collect();
        Self {
            bindings: RwLock::new(bindings),
            last_ack: Mutex::new(HashMap::new()),
            static_nodes,
            dynamic_register,
            bindings_file,
            last_ack_file,
        }
    }

    /// Handle a heartbeat: bind `address` to `name` and refresh its last-ack.
    ///
    /// `on_replace` runs with the previous name while the write lock is held.
    pub fn bind(
        &self,
        address: IpAddr,
        name: &str,
        now: Timestamp,
        on_replace: impl FnOnce(&str),
    ) -> ApiResult<BindOutcome> {
        let address = address.to_canonical();
        let mut bindings = self.bindings.write();

        if !bindings.contains_key(&address) && !self.dynamic_register {
            return Err(ApiError::Unauthorized(address.to_string()));
        }

        let binding = bindings
            .entry(address)
            .or_insert_with(|| Binding { address, logical_name: None });

        let outcome = match binding.logical_name.as_deref() {
            None => BindOutcome::Registered,
            Some(current) if current == name => BindOutcome::Refreshed,
            Some(current) => BindOutcome::Replaced { previous: current.to_string() },
        };

        binding.logical_name = Some(name.to_string());

        let mut last_ack = self.last_ack.lock();
        if let BindOutcome::Replaced { previous } = &outcome {
            on_replace(previous);
            last_ack.remove(previous);
        }
        last_ack.insert(name.to_string(), now);

        match &outcome {
            BindOutcome::Registered => info!("registered {address} as {name}"),
            BindOutcome::Replaced { previous } => {
                warn!("{address} replaced: {previous} -> {name}, purged data of {previous}")
            }
            BindOutcome::Refreshed => {}
        }
        Ok(outcome)
    }

    /// Run `f` with the logical name bound to `address`, refreshing its
    /// last-ack first. Holding the read lock for the whole call keeps a
    /// concurrent rename from interleaving with the mutation.
    pub fn with_registered<R>(
        &self,
        address: IpAddr,
        now: Timestamp,
        f: impl FnOnce(&str) -> R,
    ) -> ApiResult<R> {
        let address = address.to_canonical();
        let bindings = self.bindings.read();
        let name = bindings
            .get(&address)
            .and_then(|b| b.logical_name.as_deref())
            .ok_or_else(|| ApiError::Unauthorized(address.to_string()))?;
        self.last_ack.lock().insert(name.to_string(), now);
        Ok(f(name))
    }

    pub fn resolve(&self, address: IpAddr) -> Option<String> {
        self.bindings
            .read()
            .get(&address.to_canonical())
            .and_then(|b| b.logical_name.clone())
    }

    pub fn last_ack(&self, name: &str) -> Option<Timestamp> {
        self.last_ack.lock().get(name).copied()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        let bindings = self.bindings.read();
        let last_ack = self.last_ack.lock();
        let mut entries: Vec<RegistryEntry> = bindings
            .values()
            .map(|b| RegistryEntry {
                address: b.address,
                logical_name: b.logical_name.clone(),
                last_ack_ts: b.logical_name.as_ref().and_then(|n| last_ack.get(n).copied()),
                static_node: self.static_nodes.contains(&b.address),
            })
            .collect();
        entries.sort_by_key(|e| e.address);
        entries
    }

    /// Forget nodes silent for longer than `max_silence` seconds.
    ///
    /// Dynamic entries are removed, static ones fall back to the UNKNOWN
    /// placeholder. Returns the forgotten names.
    pub fn sweep(&self, now: Timestamp, max_silence: i64) -> Vec<String> {
        let cutoff = now - max_silence;
        let mut bindings = self.bindings.write();
        let mut last_ack = self.last_ack.lock();
        let mut forgotten = Vec::new();

        bindings.retain(|address, binding| {
            let Some(name) = binding.logical_name.clone() else { return true };
            let silent = last_ack.get(&name).map_or(true, |&ts| ts < cutoff);
            if !silent {
                return true;
            }
            last_ack.remove(&name);
            info!("forgetting {name} at {address}, silent since before {cutoff}");
            forgotten.push(name);
            if self.static_nodes.contains(address) {
                binding.logical_name = None;
                true
            } else {
                false
            }
        });
        forgotten
    }
}

impl DurableStore for Registry {
    fn name(&self) -> &'static str {
        "registry"
    }

    /// The registry is a cache of live state: a damaged blob is preserved
    /// aside and the table starts from the static seeds.
    fn load(&self) -> Result<(), SnapshotError> {
        match read_json::<Vec<Binding>>(&self.bindings_file) {
            Ok(Some(saved)) => {
                let mut bindings = self.bindings.write();
                for binding in saved {
                    let address = binding.address.to_canonical();
                    if self.dynamic_register || self.static_nodes.contains(&address) {
                        bindings.insert(address, Binding { address, ..binding });
                    }
                }
                info!("restored {} registry bindings", bindings.len());
            }
            Ok(None) => {}
            Err(e) => error!("registry bindings not restored: {e}"),
        }
        match read_json::<HashMap<String, Timestamp>>(&self.last_ack_file) {
            Ok(Some(saved)) => *self.last_ack.lock() = saved,
            Ok(None) => {}
            Err(e) => error!("last-ack table not restored: {e}"),
        }
        Ok(())
    }

    fn save(&self) -> Result<(), SnapshotError> {
        let bindings: Vec<Binding> = self.bindings.read().values().cloned().collect();
        let last_ack = self.last_ack.lock().clone();
        write_json(&self.bindings_file, &bindings)?;
        write_json(&self.last_ack_file, &last_ack)
    }
}
