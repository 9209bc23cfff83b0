/**
 * TASK LEDGER - durable accounting log of completed GPU tasks
 *
 * ROLE:
 * Append-only record of every task an agent saw start and finish, queried by
 * dashboards and quota tooling.
 *
 * OPERATION:
 * - In-memory cache, snapshotted wholesale to one JSON file on a timer
 * - Records older than the retention window are dropped at snapshot time
 * - Backups are plain copies of the current snapshot
 * - A snapshot that cannot be parsed is moved aside and start-up fails:
 *   the ledger never silently restarts empty over a known-corrupt file
 *
 * QUERIES:
 * hostname, gpu_id, username exact match; start_ts lower bound; end_ts upper
 * bound; command as substring or regular expression. Filters are ANDed and the
 * result is sorted by start_ts.
 */

use parking_lot::Mutex;
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use fleet_proto::{now_ts, TaskFilter, TaskRecord, Timestamp};

use crate::persist::{read_json, write_json, DurableStore, SnapshotError};

pub struct TaskLedger {
    /// In-memory cache, authoritative between snapshots
    records: Mutex<Vec<TaskRecord>>,
    /// Snapshot file
    data_file: PathBuf,
    /// Records whose end_ts is older than this many seconds are dropped on save
    retention_secs: i64,
}

/// `command` filter: a record matches if the pattern is a substring of its
/// command, or, when the pattern compiles, if the regex matches anywhere.
struct CommandMatcher {
    needle: String,
    regex: Option<Regex>,
}

impl CommandMatcher {
    fn new(pattern: &str) -> Self {
        let regex = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                debug!("command filter {pattern:?} is not a regex ({e}), substring only");
                None
            }
        };
        Self { needle: pattern.to_string(), regex }
    }

    fn matches(&self, command: &str) -> bool {
        command.contains(&self.needle) || self.regex.as_ref().is_some_and(|re| re.is_match(command))
    }
}

fn matches_filter(record: &TaskRecord, filter: &TaskFilter, command: Option<&CommandMatcher>) -> bool {
    if filter.hostname.as_ref().is_some_and(|h| *h != record.hostname) {
        return false;
    }
    if filter.gpu_id.is_some_and(|g| g != record.gpu_id) {
        return false;
    }
    if filter.username.as_ref().is_some_and(|u| *u != record.username) {
        return false;
    }
    if filter.start_ts.is_some_and(|ts| record.start_ts < ts) {
        return false;
    }
    if filter.end_ts.is_some_and(|ts| record.end_ts > ts) {
        return false;
    }
    command.map_or(true, |m| m.matches(&record.command))
}

impl TaskLedger {
    pub fn new(data_file: PathBuf, retention_secs: i64) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            data_file,
            retention_secs,
        }
    }

    pub fn append(&self, batch: Vec<TaskRecord>) {
        let mut records = self.records.lock();
        records.extend(batch);
        debug!("task ledger holds {} records", records.len());
    }

    pub fn query(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let command = filter.command.as_deref().map(CommandMatcher::new);
        let mut results: Vec<TaskRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| matches_filter(r, filter, command.as_ref()))
            .cloned()
            .collect();
        results.sort_by_key(|r| r.start_ts);
        results
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Drop records that ended before the retention window. Returns how many.
    pub fn truncate(&self, now: Timestamp) -> usize {
        let cutoff = now - self.retention_secs;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.end_ts >= cutoff);
        before - records.len()
    }

    /// Copy the current snapshot next to itself as `TaskRecords.<ts>.json.bak`.
    pub fn backup(&self, now: Timestamp) -> Result<Option<PathBuf>, SnapshotError> {
        if !self.data_file.exists() {
            return Ok(None);
        }
        let stem = self
            .data_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "TaskRecords".to_string());
        let target = self.data_file.with_file_name(format!("{stem}.{now}.json.bak"));
        fs::copy(&self.data_file, &target)
            .map_err(|source| SnapshotError::Io { path: target.clone(), source })?;
        info!("task ledger backed up to {}", target.display());
        Ok(Some(target))
    }
}

impl DurableStore for TaskLedger {
    fn name(&self) -> &'static str {
        "tasks"
    }

    fn load(&self) -> Result<(), SnapshotError> {
        if let Some(saved) = read_json::<Vec<TaskRecord>>(&self.data_file)? {
            info!("restored {} task records from {}", saved.len(), self.data_file.display());
            *self.records.lock() = saved;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), SnapshotError> {
        let dropped = self.truncate(now_ts());
        if dropped > 0 {
            warn!("dropped {dropped} task records past retention");
        }
        let records = self.records.lock().clone();
        write_json(&self.data_file, &records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(host: &str, gpu: u32, user: &str, cmd: &str, start: Timestamp, end: Timestamp) -> TaskRecord {
        TaskRecord {
            hostname: host.into(),
            gpu_id: gpu,
            username: user.into(),
            command: cmd.into(),
            start_ts: start,
            end_ts: end,
            ingested_ts: Some(end),
        }
    }

    fn ledger() -> TaskLedger {
        let ledger = TaskLedger::new("unused.json".into(), 360 * 86_400);
        ledger.append(vec![
            task("node1", 0, "alice", "python train.py --lr 0.1", 300, 400),
            task("node1", 1, "bob", "python eval.py", 100, 200),
            task("node2", 0, "alice", "./bench --gpu", 200, 250),
            task("node2", 0, "alice", "python train.py --lr 0.2", 50, 90),
        ]);
        ledger
    }

    fn starts(records: &[TaskRecord]) -> Vec<Timestamp> {
        records.iter().map(|r| r.start_ts).collect()
    }

    #[test]
    fn test_results_sorted_by_start() {
        assert_eq!(starts(&ledger().query(&TaskFilter::default())), vec![50, 100, 200, 300]);
    }

    #[test]
    fn test_username_and_command_regex_compose() {
        let filter = TaskFilter {
            username: Some("alice".into()),
            command: Some(r"train\.py --lr 0\.[12]".into()),
            ..Default::default()
        };
        assert_eq!(starts(&ledger().query(&filter)), vec![50, 300]);
    }

    #[test]
    fn test_invalid_regex_falls_back_to_substring() {
        // "(v2" does not compile as a regex
        let ledger = TaskLedger::new("unused.json".into(), 360 * 86_400);
        ledger.append(vec![task("n", 0, "u", "run (v2 beta)", 1, 2), task("n", 0, "u", "run v3", 3, 4)]);
        let filter = TaskFilter { command: Some("(v2".into()), ..Default::default() };
        assert_eq!(starts(&ledger.query(&filter)), vec![1]);

        let filter = TaskFilter { command: Some("v[23]".into()), ..Default::default() };
        assert_eq!(starts(&ledger.query(&filter)), vec![1, 3]);
    }

    #[test]
    fn test_gpu_zero_is_a_real_filter() {
        let filter = TaskFilter { gpu_id: Some(0), hostname: Some("node1".into()), ..Default::default() };
        assert_eq!(starts(&ledger().query(&filter)), vec![300]);
    }

    #[test]
    fn test_time_bounds() {
        let filter = TaskFilter { start_ts: Some(100), end_ts: Some(300), ..Default::default() };
        assert_eq!(starts(&ledger().query(&filter)), vec![100, 200]);
    }

    #[test]
    fn test_truncate_drops_expired_records() {
        let ledger = TaskLedger::new("unused.json".into(), 1_000);
        ledger.append(vec![task("n", 0, "u", "a", 0, 10), task("n", 0, "u", "b", 1_500, 1_900)]);
        assert_eq!(ledger.truncate(2_000), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_save_load_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TaskRecords.json");
        let ledger = TaskLedger::new(path.clone(), 360 * 86_400);
        let now = now_ts();
        ledger.append(vec![task("n", 0, "u", "a", now - 20, now - 10)]);
        ledger.save().unwrap();

        let backup = ledger.backup(now).unwrap().unwrap();
        assert!(backup.file_name().unwrap().to_string_lossy().ends_with(".json.bak"));

        let restored = TaskLedger::new(path, 360 * 86_400);
        restored.load().unwrap();
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn test_corrupt_snapshot_fails_load_and_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TaskRecords.json");
        fs::write(&path, "[{\"gpu_id\": ").unwrap();

        let ledger = TaskLedger::new(path.clone(), 360 * 86_400);
        let err = ledger.load().unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }));
        assert!(!path.exists());
        assert_eq!(ledger.len(), 0);
        let kept: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(kept.len(), 1);
    }
}
