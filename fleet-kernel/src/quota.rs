/**
 * QUOTA LEDGER - advisory per-user GPU time counters
 *
 * ROLE: remembers, per user, the total quota granted by the rule file and the
 * balance still available. Nothing here enforces or decrements anything.
 *
 * RULE FILE: one `username total_minutes` pair per line; blank lines and lines
 * starting with `#` are ignored. A malformed line is logged and skipped on its
 * own. Reloading updates `total` only; `available` of a known user is kept, a
 * new user starts with `available = total`. Users absent from the file keep
 * their entries.
 *
 * Amounts are stored in seconds.
 */

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use tracing::{error, info, warn};

use fleet_proto::{mins_to_secs, QuotaEntry};

use crate::persist::{read_json, write_json, DurableStore, SnapshotError};

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota rule file {path} not found")]
    RulesMissing { path: PathBuf },
    #[error("cannot read quota rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Counts of one rule-file pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub applied: usize,
    pub skipped: usize,
}

pub struct QuotaLedger {
    entries: Mutex<BTreeMap<String, QuotaEntry>>,
    rule_file: PathBuf,
    data_file: PathBuf,
}

fn parse_rule(line: &str) -> Result<(&str, i64), String> {
    let mut tokens = line.split_whitespace();
    let (Some(user), Some(minutes), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err("expected `username total_minutes`".to_string());
    };
    let minutes: i64 = minutes
        .parse()
        .map_err(|_| format!("{minutes:?} is not a whole number of minutes"))?;
    if minutes < 0 {
        return Err(format!("negative quota {minutes}"));
    }
    Ok((user, minutes))
}

impl QuotaLedger {
    pub fn new(rule_file: PathBuf, data_file: PathBuf) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            rule_file,
            data_file,
        }
    }

    /// Apply the text of a rule file.
    pub fn apply_rules(&self, text: &str) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut entries = self.entries.lock();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_rule(line) {
                Ok((user, minutes)) => {
                    let total = mins_to_secs(minutes);
                    entries
                        .entry(user.to_string())
                        .and_modify(|e| e.total = total)
                        .or_insert_with(|| QuotaEntry {
                            username: user.to_string(),
                            available: total,
                            total,
                        });
                    summary.applied += 1;
                }
                Err(reason) => {
                    warn!("quota rule line {} skipped ({reason}): {line:?}", lineno + 1);
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    /// Re-read the rule file from disk.
    pub fn reload(&self) -> Result<ReloadSummary, QuotaError> {
        let text = std::fs::read_to_string(&self.rule_file).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                QuotaError::RulesMissing { path: self.rule_file.clone() }
            } else {
                QuotaError::Io { path: self.rule_file.clone(), source }
            }
        })?;
        let summary = self.apply_rules(&text);
        info!(
            "quota rules reloaded from {}: {} applied, {} skipped",
            self.rule_file.display(),
            summary.applied,
            summary.skipped
        );
        Ok(summary)
    }

    pub fn get(&self, username: &str) -> Option<QuotaEntry> {
        self.entries.lock().get(username).cloned()
    }

    pub fn all(&self) -> Vec<QuotaEntry> {
        self.entries.lock().values().cloned().collect()
    }
}

impl DurableStore for QuotaLedger {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn load(&self) -> Result<(), SnapshotError> {
        match read_json::<Vec<QuotaEntry>>(&self.data_file) {
            Ok(Some(saved)) => {
                let mut entries = self.entries.lock();
                for entry in saved {
                    entries.insert(entry.username.clone(), entry);
                }
                info!("restored quota of {} users", entries.len());
            }
            Ok(None) => {}
            Err(e) => error!("quota ledger not restored: {e}"),
        }
        Ok(())
    }

    fn save(&self) -> Result<(), SnapshotError> {
        write_json(&self.data_file, &self.all())
    }
}
