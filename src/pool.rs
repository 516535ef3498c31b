//! Live shard set and parallel fan-out search.
//!
//! Each shard gets a long-lived worker thread owning that shard's
//! memory-mapped index. The coordinator fans a query out to every
//! date-eligible worker over per-shard input channels and drains exactly as
//! many replies as it sent requests; that expected-result count is what keeps
//! the drain bounded if a worker dies mid-flight.
//!
//! Locking: any number of searches hold the registry's read lock
//! concurrently; attaching a shard takes the write lock and therefore waits
//! for in-flight searches to drain before the registry changes.

use chrono::{Local, NaiveDate};
use crossbeam_channel::{Receiver, Sender, unbounded};
use lru::LruCache;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use tracing::{info, warn};

use crate::builder::{extract_date, find_indexes};
use crate::config::{MAX_DATE_RANGE_DAYS, WORKER_CACHE_CAP};
use crate::error::{SimdexError, SimdexResult};
use crate::ivf::{IvfIndex, ReadMode, check_index_suffix, read_index};

/// Per-shard search parameter: all hits within an L2 radius, or the k
/// nearest neighbors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    Radius(f32),
    Knn(usize),
}

struct ShardRequest {
    query: Arc<[f32]>,
    mode: SearchMode,
    reply: mpsc::Sender<(Vec<f32>, Vec<i64>)>,
}

struct ShardHandle {
    path: PathBuf,
    date: Option<NaiveDate>,
    input: Sender<ShardRequest>,
}

pub struct ShardPool {
    shards: RwLock<BTreeMap<String, ShardHandle>>,
    nprobe: usize,
}

impl ShardPool {
    /// Load every `.index` file directly inside `shard_dir` (non-recursive),
    /// in lexicographic and therefore date order. A shard that cannot be
    /// opened aborts startup.
    pub fn load_dir(shard_dir: &Path, nprobe: usize) -> SimdexResult<Self> {
        let mut shards = BTreeMap::new();
        for path in find_indexes(shard_dir, false)? {
            let (name, handle) = spawn_worker(&path, nprobe)?;
            info!(shard = %name, path = %path.display(), "shard online");
            shards.insert(name, handle);
        }
        if shards.is_empty() {
            warn!(dir = %shard_dir.display(), "no shards found at startup");
        }
        Ok(Self {
            shards: RwLock::new(shards),
            nprobe,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.read().keys().cloned().collect()
    }

    /// Shard names whose embedded date falls inside the clamped window.
    pub fn eligible_shards(&self, start_date: NaiveDate, end_date: NaiveDate) -> Vec<String> {
        let (start, end) = clamp_window(start_date, end_date);
        self.shards
            .read()
            .iter()
            .filter(|(_, h)| date_eligible(h.date, start, end))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fan a query out to all date-eligible shards and aggregate.
    ///
    /// `end_date` is clamped to today and the window to 180 days. The
    /// returned arrays are jointly sorted ascending by distance.
    pub fn search(
        &self,
        query: &[f32],
        mode: SearchMode,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> SimdexResult<(Vec<f32>, Vec<i64>)> {
        if start_date > end_date {
            return Err(SimdexError::BadRequest(
                "start date must not be after end date".to_string(),
            ));
        }
        let (start, end) = clamp_window(start_date, end_date);

        let guard = self.shards.read();
        let query: Arc<[f32]> = query.to_vec().into();
        let (reply_tx, reply_rx) = mpsc::channel();

        let mut expected = 0usize;
        for (name, handle) in guard.iter() {
            if !date_eligible(handle.date, start, end) {
                continue;
            }
            let request = ShardRequest {
                query: query.clone(),
                mode,
                reply: reply_tx.clone(),
            };
            if handle.input.send(request).is_ok() {
                expected += 1;
            } else {
                warn!(shard = %name, "worker channel closed, skipping shard");
            }
        }
        drop(reply_tx);

        let mut distances = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..expected {
            match reply_rx.recv() {
                Ok((d, i)) => {
                    distances.extend(d);
                    ids.extend(i);
                }
                Err(_) => {
                    warn!("a shard worker exited before replying");
                    break;
                }
            }
        }
        drop(guard);

        Ok(joint_sort(distances, ids))
    }

    /// Hot-attach a shard. Takes the writer lock, so it waits for running
    /// searches and blocks new ones until the worker is registered.
    pub fn add_shard(&self, path: &Path) -> SimdexResult<()> {
        let mut guard = self.shards.write();

        let name = shard_name(path)?;
        if guard.contains_key(&name) || guard.values().any(|h| h.path == path) {
            return Err(SimdexError::ShardAlreadyAttached(name));
        }
        if !path.is_file() {
            return Err(SimdexError::ShardMissing(path.to_path_buf()));
        }
        check_index_suffix(path)?;

        let (name, handle) = spawn_worker(path, self.nprobe)?;
        info!(shard = %name, path = %path.display(), "shard attached");
        guard.insert(name, handle);
        Ok(())
    }
}

fn shard_name(path: &Path) -> SimdexResult<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| SimdexError::Format(format!("invalid shard path: {}", path.display())))
}

fn date_eligible(date: Option<NaiveDate>, start: NaiveDate, end: NaiveDate) -> bool {
    match date {
        Some(d) => start <= d && d <= end,
        // A shard without an embedded date cannot be filtered; search it.
        None => true,
    }
}

fn clamp_window(start: NaiveDate, end: NaiveDate) -> (NaiveDate, NaiveDate) {
    let today = Local::now().date_naive();
    let end = end.min(today);
    let floor = end - chrono::Duration::days(MAX_DATE_RANGE_DAYS);
    (start.max(floor), end)
}

fn spawn_worker(path: &Path, nprobe: usize) -> SimdexResult<(String, ShardHandle)> {
    let name = shard_name(path)?;
    if !path.is_file() {
        return Err(SimdexError::ShardMissing(path.to_path_buf()));
    }

    let mut index = read_index(path, ReadMode::Mmap)?;
    index.nprobe = nprobe;

    let date = extract_date(&name);
    if date.is_none() {
        warn!(shard = %name, "no ISO date in shard name; it will match every date range");
    }

    let (input_tx, input_rx) = unbounded();
    thread::Builder::new()
        .name(format!("shard-{name}"))
        .spawn(move || worker_loop(index, input_rx))
        .map_err(SimdexError::Io)?;

    Ok((
        name,
        ShardHandle {
            path: path.to_path_buf(),
            date,
            input: input_tx,
        },
    ))
}

/// Worker body: block on the input channel, search the local shard, reply.
/// Results are cached in a bounded LRU keyed by the query/parameter bytes.
fn worker_loop(index: IvfIndex, input: Receiver<ShardRequest>) {
    let cap = NonZeroUsize::new(WORKER_CACHE_CAP).unwrap_or(NonZeroUsize::MIN);
    let mut cache: LruCache<[u8; 32], (Vec<f32>, Vec<i64>)> = LruCache::new(cap);

    while let Ok(request) = input.recv() {
        let key = cache_key(&request.query, request.mode);
        let result = match cache.get(&key) {
            Some(hit) => hit.clone(),
            None => {
                let computed = match request.mode {
                    SearchMode::Radius(radius) => index.range_search(&request.query, radius),
                    SearchMode::Knn(k) => index.search(&request.query, k),
                };
                match computed {
                    Ok(tuple) => {
                        cache.put(key, tuple.clone());
                        tuple
                    }
                    Err(e) => {
                        // Reply with an empty result so the coordinator's
                        // expected-result counter still drains.
                        warn!(error = %e, "shard search failed");
                        (Vec::new(), Vec::new())
                    }
                }
            }
        };
        let _ = request.reply.send(result);
    }
}

fn cache_key(query: &[f32], mode: SearchMode) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for &v in query {
        hasher.update(v.to_le_bytes());
    }
    match mode {
        SearchMode::Radius(r) => {
            hasher.update([0u8]);
            hasher.update(r.to_le_bytes());
        }
        SearchMode::Knn(k) => {
            hasher.update([1u8]);
            hasher.update((k as u64).to_le_bytes());
        }
    }
    hasher.finalize().into()
}

/// Sort two parallel arrays ascending by distance, ties broken by ascending
/// id, preserving pairing. This ordering is the contract every downstream
/// consumer relies on. Skips the sort when the input is already ordered.
pub fn joint_sort(distances: Vec<f32>, ids: Vec<i64>) -> (Vec<f32>, Vec<i64>) {
    debug_assert_eq!(distances.len(), ids.len());

    let ordered = distances
        .windows(2)
        .zip(ids.windows(2))
        .all(|(d, i)| match d[0].total_cmp(&d[1]) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => i[0] <= i[1],
            std::cmp::Ordering::Greater => false,
        });
    if ordered {
        return (distances, ids);
    }

    let mut pairs: Vec<(f32, i64)> = distances.into_iter().zip(ids).collect();
    pairs.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    pairs.into_iter().unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ShardBuilder, ivfdata_path};
    use crate::ivf::{Compression, write_index};
    use tempfile::TempDir;

    const DIM: usize = 2;

    /// Write a shard whose vectors sit near (v, v) for each `v` in `values`.
    fn write_shard(dir: &Path, builder: &mut ShardBuilder, name: &str, values: &[(f32, i64)]) {
        let mut embs = Vec::new();
        let mut ids = Vec::new();
        for &(v, id) in values {
            embs.push(v);
            embs.push(v);
            ids.push(id);
        }
        let sub = dir.join(format!("{name}_sub.index"));
        builder.generate_subindex(&sub, &embs, &ids).unwrap();
        let shard = dir.join(format!("{name}.index"));
        builder
            .merge_ivfs(&shard, &ivfdata_path(&shard), &[sub.clone()])
            .unwrap();
        std::fs::remove_file(sub).unwrap();
        builder.clear_registered();
    }

    /// Base index + shard dir with one shard per (name, values) entry.
    fn pool_fixture(entries: &[(&str, Vec<(f32, i64)>)]) -> (TempDir, ShardPool) {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("base.index");
        let mut base = IvfIndex::new(DIM, 2, Compression::Flat);
        base.train(&[0.0, 0.0, 0.1, 0.0, 10.0, 10.0, 10.1, 10.0])
            .unwrap();
        write_index(&base, &base_path).unwrap();

        let shard_dir = dir.path().join("shards");
        std::fs::create_dir_all(&shard_dir).unwrap();
        let mut builder = ShardBuilder::new(&base_path);
        for (name, values) in entries {
            write_shard(&shard_dir, &mut builder, name, values);
        }
        // Subindex leftovers would be picked up as shards; the fixture
        // removes them above, so the pool sees exactly the named shards.
        let pool = ShardPool::load_dir(&shard_dir, 2).unwrap();
        (dir, pool)
    }

    fn wide_range() -> (NaiveDate, NaiveDate) {
        let today = Local::now().date_naive();
        (today - chrono::Duration::days(30), today)
    }

    #[test]
    fn test_joint_sort_orders_and_is_idempotent() {
        let (d, i) = joint_sort(vec![0.3, 0.1, 0.2], vec![3, 1, 2]);
        assert_eq!(d, vec![0.1, 0.2, 0.3]);
        assert_eq!(i, vec![1, 2, 3]);

        let (d2, i2) = joint_sort(d.clone(), i.clone());
        assert_eq!(d2, d);
        assert_eq!(i2, i);
    }

    #[test]
    fn test_joint_sort_tie_breaks_by_id() {
        let (d, i) = joint_sort(vec![0.5, 0.5, 0.1], vec![9, 4, 7]);
        assert_eq!(d, vec![0.1, 0.5, 0.5]);
        assert_eq!(i, vec![7, 4, 9]);
    }

    #[test]
    fn test_fan_out_aggregates_all_shards() {
        let today = Local::now().date_naive();
        let d1 = today - chrono::Duration::days(2);
        let d2 = today - chrono::Duration::days(1);
        let (_dir, pool) = pool_fixture(&[
            (&format!("{d1}_all"), vec![(0.0, 100), (10.0, 200)]),
            (&format!("{d2}_all"), vec![(0.2, 300)]),
        ]);

        let (start, end) = wide_range();
        let (d, i) = pool
            .search(&[0.0, 0.0], SearchMode::Radius(1.0), start, end)
            .unwrap();
        assert_eq!(i, vec![100, 300]);
        assert!(d.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_date_filter_selects_only_eligible_shards() {
        let (_dir, pool) = pool_fixture(&[
            ("2024-01-05_all", vec![(0.0, 1)]),
            ("2024-02-10_all", vec![(0.0, 2)]),
            ("2024-03-15_all", vec![(0.0, 3)]),
        ]);

        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        assert_eq!(pool.eligible_shards(start, end), vec!["2024-02-10_all"]);

        let (_, i) = pool
            .search(&[0.0, 0.0], SearchMode::Radius(1.0), start, end)
            .unwrap();
        assert_eq!(i, vec![2]);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let (_dir, pool) = pool_fixture(&[("2024-02-10_all", vec![(0.0, 1)])]);
        let err = pool.search(
            &[0.0, 0.0],
            SearchMode::Radius(1.0),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        assert!(matches!(err, Err(SimdexError::BadRequest(_))));
    }

    #[test]
    fn test_window_clamped_to_max_span() {
        let today = Local::now().date_naive();
        let old = today - chrono::Duration::days(300);
        let (_dir, pool) = pool_fixture(&[
            (&format!("{old}_all"), vec![(0.0, 1)]),
            (&format!("{today}_all"), vec![(0.0, 2)]),
        ]);

        // A 300-day-wide request clamps to 180 days, excluding the old shard.
        let eligible = pool.eligible_shards(old, today);
        assert_eq!(eligible, vec![format!("{today}_all")]);
    }

    #[test]
    fn test_knn_mode_respects_k() {
        let today = Local::now().date_naive();
        let (_dir, pool) = pool_fixture(&[(
            &format!("{today}_all"),
            vec![(0.0, 1), (0.1, 2), (0.2, 3), (0.3, 4)],
        )]);

        let (start, end) = wide_range();
        let (_, i) = pool
            .search(&[0.0, 0.0], SearchMode::Knn(2), start, end)
            .unwrap();
        assert_eq!(i, vec![1, 2]);
    }

    #[test]
    fn test_add_shard_duplicate_is_detected() {
        let today = Local::now().date_naive();
        let name = format!("{today}_all");
        let (dir, pool) = pool_fixture(&[(&name, vec![(0.0, 1)])]);

        let shard_path = dir.path().join("shards").join(format!("{name}.index"));
        let err = pool.add_shard(&shard_path);
        assert!(matches!(err, Err(SimdexError::ShardAlreadyAttached(_))));

        let err = pool.add_shard(&dir.path().join("shards").join("missing_all.index"));
        assert!(matches!(err, Err(SimdexError::ShardMissing(_))));
    }

    #[test]
    fn test_hot_attach_during_concurrent_searches() {
        let today = Local::now().date_naive();
        let d1 = today - chrono::Duration::days(2);
        let (dir, pool) = pool_fixture(&[(&format!("{d1}_all"), vec![(0.0, 100)])]);
        let pool = Arc::new(pool);

        // Build a second shard outside the pool's directory.
        let extra_dir = dir.path().join("extra");
        std::fs::create_dir_all(&extra_dir).unwrap();
        let mut builder = ShardBuilder::new(dir.path().join("base.index"));
        write_shard(&extra_dir, &mut builder, &format!("{today}_extra"), &[(0.1, 500)]);

        // Searches on other threads while the shard is attached.
        let (start, end) = wide_range();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    pool.search(&[0.0, 0.0], SearchMode::Radius(1.0), start, end)
                        .unwrap()
                })
            })
            .collect();

        pool.add_shard(&extra_dir.join(format!("{today}_extra.index")))
            .unwrap();
        for handle in handles {
            let (_, ids) = handle.join().unwrap();
            assert!(ids.contains(&100));
        }

        // After the attach completes, searches include the new shard.
        let (_, ids) = pool
            .search(&[0.0, 0.0], SearchMode::Radius(1.0), start, end)
            .unwrap();
        assert!(ids.contains(&100) && ids.contains(&500));
    }
}
