//! Local snapshot of the collector state (`client-state.json`).

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::collector::CollectorState;

/// Write the snapshot next to its final place, then rename it over.
pub fn save(path: &Path, state: &CollectorState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_vec(state).context("cannot encode collector state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("cannot write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("cannot replace {}", path.display()))?;
    Ok(())
}

/// A missing or unreadable snapshot means a fresh start.
pub fn load(path: &Path) -> CollectorState {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CollectorState::default(),
        Err(e) => {
            warn!("cannot read {}: {e}, starting fresh", path.display());
            return CollectorState::default();
        }
    };
    match serde_json::from_slice::<CollectorState>(&bytes) {
        Ok(state) => {
            info!(
                "restored {} running tasks from {} (saved {})",
                state.running.len(),
                path.display(),
                state.saved_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "at an unknown time".into())
            );
            state
        }
        Err(e) => {
            warn!("corrupt {}: {e}, starting fresh", path.display());
            CollectorState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::RunningTask;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("client-state.json");
        let mut state = CollectorState::default();
        state.running.insert(
            555,
            RunningTask { gpu_id: 0, username: "alice".into(), command: "python".into(), start_ts: 10 },
        );

        save(&path, &state).unwrap();
        assert_eq!(load(&path), state);
    }

    #[test]
    fn test_corrupt_or_missing_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client-state.json");
        assert_eq!(load(&path), CollectorState::default());
        std::fs::write(&path, "{{{").unwrap();
        assert_eq!(load(&path), CollectorState::default());
    }
}
