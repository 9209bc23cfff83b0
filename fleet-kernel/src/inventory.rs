use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{error, info};

use fleet_proto::HardwareSnapshot;

use crate::persist::{read_json, write_json, DurableStore, SnapshotError};

/// Latest hardware snapshot per logical name. Snapshots are replaced
/// wholesale, never merged field by field.
pub struct HardwareTable {
    snapshots: RwLock<HashMap<String, HardwareSnapshot>>,
    data_file: PathBuf,
}

impl HardwareTable {
    pub fn new(data_file: PathBuf) -> Self {
        Self { snapshots: RwLock::new(HashMap::new()), data_file }
    }

    pub fn put(&self, name: &str, snapshot: HardwareSnapshot) {
        self.snapshots.write().insert(name.to_string(), snapshot);
    }

    pub fn get(&self, name: &str) -> Option<HardwareSnapshot> {
        self.snapshots.read().get(name).cloned()
    }

    pub fn all(&self) -> BTreeMap<String, HardwareSnapshot> {
        self.snapshots
            .read()
            .iter()
            .map(|(name, snapshot)| (name.clone(), snapshot.clone()))
            .collect()
    }

    pub fn purge(&self, name: &str) -> bool {
        self.snapshots.write().remove(name).is_some()
    }
}

impl DurableStore for HardwareTable {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn load(&self) -> Result<(), SnapshotError> {
        match read_json::<HashMap<String, HardwareSnapshot>>(&self.data_file) {
            Ok(Some(saved)) => {
                info!("restored hardware snapshots of {} nodes", saved.len());
                *self.snapshots.write() = saved;
            }
            Ok(None) => {}
            Err(e) => error!("hardware snapshots not restored: {e}"),
        }
        Ok(())
    }

    fn save(&self) -> Result<(), SnapshotError> {
        let snapshot = self.snapshots.read().clone();
        write_json(&self.data_file, &snapshot)
    }
}
