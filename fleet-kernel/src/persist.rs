//! Durable snapshots of in-memory tables.
//!
//! Each store owns one JSON blob and rewrites it wholesale. Writes go to a
//! temporary sibling first so a crash never leaves a half-written blob behind.
//! A blob that fails to parse is renamed aside, never deleted.

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fleet_proto::now_ts;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt snapshot {path}, preserved as {quarantined}: {source}")]
    Corrupt {
        path: PathBuf,
        quarantined: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io { path: path.to_path_buf(), source }
}

/// A component whose state must survive restarts. The kernel builds the
/// list of these once at start-up.
pub trait DurableStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Restore state from disk. A missing file is not an error.
    fn load(&self) -> Result<(), SnapshotError>;

    /// Overwrite the on-disk blob with the current state.
    fn save(&self) -> Result<(), SnapshotError>;
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }
    let json = serde_json::to_vec(value)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, json).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist yet.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(io_err(path))?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(source) => {
            let quarantined = quarantine(path).map_err(io_err(path))?;
            Err(SnapshotError::Corrupt { path: path.to_path_buf(), quarantined, source })
        }
    }
}

/// Move a damaged blob out of the way, keeping it for inspection.
pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{}", now_ts()));
    let target = path.with_file_name(name);
    fs::rename(path, &target)?;
    Ok(target)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("table.json");
        let mut table = HashMap::new();
        table.insert("node1".to_string(), 42i64);

        write_json(&path, &table).unwrap();
        let back: HashMap<String, i64> = read_json(&path).unwrap().unwrap();
        assert_eq!(back, table);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Vec<i64>> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_corrupt_file_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TaskRecords.json");
        fs::write(&path, b"{ definitely not json").unwrap();

        let err = read_json::<Vec<i64>>(&path).unwrap_err();
        let SnapshotError::Corrupt { quarantined, .. } = err else {
            panic!("expected corruption, got {err:?}");
        };
        assert!(!path.exists());
        assert_eq!(fs::read(&quarantined).unwrap(), b"{ definitely not json");
    }
}
