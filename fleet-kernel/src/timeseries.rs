//! Bounded per-node history of runtime samples.
//!
//! Samples are kept in arrival order. Agents stamp their own `ts` and the
//! network may reorder deliveries, so each series tracks whether it is still
//! sorted by `ts`: sorted series answer range queries with two binary searches,
//! the rest fall back to a linear scan. Either way the answer is exactly the
//! samples with `start <= ts <= end`, in arrival order.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use fleet_proto::{RuntimeSample, Timestamp};

use crate::persist::{read_json, write_json, DurableStore, SnapshotError};

/// Samples inside a series always carry a `ts`.
fn ts_of(sample: &RuntimeSample) -> Timestamp {
    sample.ts.unwrap_or(Timestamp::MIN)
}

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<RuntimeSample>,
    ordered: bool,
}

impl Series {
    fn from_samples(samples: Vec<RuntimeSample>) -> Self {
        let ordered = samples.windows(2).all(|w| ts_of(&w[0]) <= ts_of(&w[1]));
        Self { samples: samples.into(), ordered }
    }

    fn push(&mut self, sample: RuntimeSample, cutoff: Timestamp) {
        if self.samples.is_empty() {
            self.ordered = true;
        } else if let Some(last) = self.samples.back() {
            if ts_of(&sample) < ts_of(last) {
                self.ordered = false;
            }
        }
        self.samples.push_back(sample);
        self.evict(cutoff);
    }

    /// Drop every sample older than `cutoff`.
    fn evict(&mut self, cutoff: Timestamp) {
        if self.ordered {
            while self.samples.front().is_some_and(|s| ts_of(s) < cutoff) {
                self.samples.pop_front();
            }
        } else {
            self.samples.retain(|s| ts_of(s) >= cutoff);
            self.ordered = self
                .samples
                .iter()
                .zip(self.samples.iter().skip(1))
                .all(|(a, b)| ts_of(a) <= ts_of(b));
        }
    }

    fn range(&self, start: Timestamp, end: Timestamp) -> Vec<RuntimeSample> {
        if start > end {
            return Vec::new();
        }
        if self.ordered {
            let lo = self.samples.partition_point(|s| ts_of(s) < start);
            let hi = self.samples.partition_point(|s| ts_of(s) <= end);
            self.samples.range(lo..hi).cloned().collect()
        } else {
            self.samples
                .iter()
                .filter(|s| (start..=end).contains(&ts_of(s)))
                .cloned()
                .collect()
        }
    }
}

pub struct TimeSeriesStore {
    nodes: RwLock<HashMap<String, Arc<Mutex<Series>>>>,
    retention_secs: i64,
    data_file: PathBuf,
}

impl TimeSeriesStore {
    pub fn new(retention_secs: i64, data_file: PathBuf) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            retention_secs,
            data_file,
        }
    }

    fn series(&self, name: &str) -> Option<Arc<Mutex<Series>>> {
        self.nodes.read().get(name).cloned()
    }

    /// Append a sample (stamping `ts` with `now` when absent) and lazily evict
    /// the node's samples that fell out of the retention window.
    pub fn ingest(&self, name: &str, mut sample: RuntimeSample, now: Timestamp) {
        sample.ts.get_or_insert(now);
        let series = match self.series(name) {
            Some(series) => series,
            None => self.nodes.write().entry(name.to_string()).or_default().clone(),
        };
        let mut series = series.lock();
        series.push(sample, now - self.retention_secs);
        debug!("{name}: {} runtime samples retained", series.samples.len());
    }

    /// Samples of one node with `start <= ts <= end`, `None` for an unknown node.
    pub fn range(&self, name: &str, start: Timestamp, end: Timestamp) -> Option<Vec<RuntimeSample>> {
        let series = self.series(name)?;
        let samples = series.lock().range(start, end);
        Some(samples)
    }

    pub fn range_all(&self, start: Timestamp, end: Timestamp) -> BTreeMap<String, Vec<RuntimeSample>> {
        let nodes: Vec<(String, Arc<Mutex<Series>>)> = self
            .nodes
            .read()
            .iter()
            .map(|(name, series)| (name.clone(), series.clone()))
            .collect();
        nodes
            .into_iter()
            .map(|(name, series)| {
                let samples = series.lock().range(start, end);
                (name, samples)
            })
            .collect()
    }

    pub fn purge(&self, name: &str) -> bool {
        self.nodes.write().remove(name).is_some()
    }

    pub fn len(&self, name: &str) -> usize {
        self.series(name).map_or(0, |s| s.lock().samples.len())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl DurableStore for TimeSeriesStore {
    fn name(&self) -> &'static str {
        "runtime"
    }

    fn load(&self) -> Result<(), SnapshotError> {
        match read_json::<HashMap<String, Vec<RuntimeSample>>>(&self.data_file) {
            Ok(Some(saved)) => {
                let mut nodes = self.nodes.write();
                for (name, samples) in saved {
                    let samples = samples.into_iter().filter(|s| s.ts.is_some()).collect();
                    nodes.insert(name, Arc::new(Mutex::new(Series::from_samples(samples))));
                }
                info!("restored runtime history of {} nodes", nodes.len());
            }
            Ok(None) => {}
            Err(e) => error!("runtime history not restored: {e}"),
        }
        Ok(())
    }

    fn save(&self) -> Result<(), SnapshotError> {
        let nodes: Vec<(String, Arc<Mutex<Series>>)> = self
            .nodes
            .read()
            .iter()
            .map(|(name, series)| (name.clone(), series.clone()))
            .collect();
        let snapshot: HashMap<String, Vec<RuntimeSample>> = nodes
            .into_iter()
            .map(|(name, series)| {
                let samples = series.lock().samples.iter().cloned().collect();
                (name, samples)
            })
            .collect();
        write_json(&self.data_file, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400;

    fn sample(ts: Timestamp) -> RuntimeSample {
        RuntimeSample { ts: Some(ts), loadavg: Some(ts as f64), ..Default::default() }
    }

    fn ts_list(samples: &[RuntimeSample]) -> Vec<Timestamp> {
        samples.iter().map(ts_of).collect()
    }

    fn store() -> TimeSeriesStore {
        TimeSeriesStore::new(21 * DAY, "unused.json".into())
    }

    /// Reference answer: the full stream filtered by the inclusive window.
    fn expected(stream: &[Timestamp], start: Timestamp, end: Timestamp) -> Vec<Timestamp> {
        stream.iter().copied().filter(|ts| *ts >= start && *ts <= end).collect()
    }

    #[test]
    fn test_range_on_empty_series() {
        let series = Series::default();
        assert!(series.range(0, 100).is_empty());
    }

    #[test]
    fn test_range_on_single_sample() {
        let series = Series::from_samples(vec![sample(50)]);
        for (start, end) in [(0, 49), (0, 50), (50, 50), (50, 60), (51, 60), (0, 100)] {
            assert_eq!(ts_list(&series.range(start, end)), expected(&[50], start, end), "[{start}, {end}]");
        }
    }

    #[test]
    fn test_range_on_two_samples() {
        let stream = [10, 20];
        let series = Series::from_samples(stream.iter().map(|&t| sample(t)).collect());
        for start in 0..25 {
            for end in start..25 {
                assert_eq!(ts_list(&series.range(start, end)), expected(&stream, start, end));
            }
        }
    }

    #[test]
    fn test_range_on_many_samples_with_duplicates() {
        let stream = [1, 3, 3, 3, 7, 9, 12, 12, 15, 20];
        let series = Series::from_samples(stream.iter().map(|&t| sample(t)).collect());
        assert!(series.ordered);
        for start in 0..22 {
            for end in start..22 {
                assert_eq!(ts_list(&series.range(start, end)), expected(&stream, start, end));
            }
        }
    }

    #[test]
    fn test_out_of_order_arrivals_keep_exact_answers() {
        let stream = [10, 30, 20, 40, 5];
        let mut series = Series::default();
        for &ts in &stream {
            series.push(sample(ts), 0);
        }
        assert!(!series.ordered);
        for start in 0..45 {
            for end in start..45 {
                assert_eq!(ts_list(&series.range(start, end)), expected(&stream, start, end));
            }
        }
    }

    #[test]
    fn test_inverted_window_is_empty() {
        let series = Series::from_samples(vec![sample(10), sample(20)]);
        assert!(series.range(20, 10).is_empty());
    }

    #[test]
    fn test_ingest_evicts_beyond_retention() {
        let store = store();
        let now = 100 * DAY;
        store.ingest("node1", sample(now - 30 * DAY), now - 30 * DAY);
        store.ingest("node1", sample(now - 22 * DAY), now - 22 * DAY);
        store.ingest("node1", sample(now - 2 * DAY), now - 2 * DAY);
        assert_eq!(store.len("node1"), 2);

        store.ingest("node1", sample(now), now);
        let kept = store.range("node1", 0, now).unwrap();
        assert_eq!(ts_list(&kept), vec![now - 2 * DAY, now]);
        assert!(kept.iter().all(|s| ts_of(s) >= now - 21 * DAY));
    }

    #[test]
    fn test_retention_holds_for_late_arrivals() {
        let store = store();
        let now = 100 * DAY;
        store.ingest("node1", sample(now - DAY), now);
        store.ingest("node1", sample(now - 40 * DAY), now);
        let kept = store.range("node1", 0, now).unwrap();
        assert_eq!(ts_list(&kept), vec![now - DAY]);
    }

    #[test]
    fn test_missing_ts_is_stamped_at_ingestion() {
        let store = store();
        store.ingest("node1", RuntimeSample::default(), 1_000);
        let kept = store.range("node1", 999, 1_001).unwrap();
        assert_eq!(kept[0].ts, Some(1_000));
    }

    #[test]
    fn test_purge_and_unknown_node() {
        let store = store();
        store.ingest("node1", sample(10), 10);
        store.ingest("node2", sample(10), 10);
        assert!(store.purge("node1"));
        assert!(store.range("node1", 0, 20).is_none());
        assert_eq!(store.range_all(0, 20).keys().collect::<Vec<_>>(), vec!["node2"]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server-runtime.json");
        let store = TimeSeriesStore::new(21 * DAY, path.clone());
        store.ingest("node1", sample(10), 10);
        store.ingest("node1", sample(20), 20);
        store.save().unwrap();

        let restored = TimeSeriesStore::new(21 * DAY, path);
        restored.load().unwrap();
        assert_eq!(ts_list(&restored.range("node1", 0, 30).unwrap()), vec![10, 20]);
    }

    #[test]
    fn test_concurrent_ingest_and_range_see_whole_windows() {
        let store = Arc::new(TimeSeriesStore::new(10, "unused.json".into()));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for ts in 0..2_000 {
                    store.ingest("node1", sample(ts), ts);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let Some(window) = store.range("node1", Timestamp::MIN, Timestamp::MAX) else { continue };
                        let got = ts_list(&window);
                        if got.is_empty() {
                            continue;
                        }
                        assert!(got.len() <= 11, "window of {}", got.len());
                        assert!(got.windows(2).all(|w| w[1] == w[0] + 1), "gap in {got:?}");
                        let newest = got[got.len() - 1];
                        assert!(got[0] >= newest - 10, "stale head in {got:?}");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(ts_list(&store.range("node1", 0, 2_000).unwrap()), (1_989..2_000).collect::<Vec<_>>());
    }
}
