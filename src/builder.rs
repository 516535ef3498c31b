//! Shard construction and maintenance.
//!
//! Building an on-disk shard requires an empty, pre-trained base index: every
//! subindex and shard in a deployment shares the base's centroids, code size
//! and nlist. Subindexes are populated per ingest batch and then merged into
//! a shard whose inverted lists live in an external `.ivfdata` file.
//!
//! A shard on disk is two files that reference each other by path, so a plain
//! rename corrupts the pair; every relocation here goes through a re-merge
//! that rewrites the pair in its destination directory.

use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::codec;
use crate::error::{SimdexError, SimdexResult};
use crate::ivf::{
    Compression, InvertedLists, IvfIndex, OnDiskListWriter, OnDiskLists, ReadMode, SubindexReader,
    check_index_suffix, read_index, write_index,
};

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}").expect("date pattern is valid")
});

/// Extract the ISO date embedded in a shard or input filename.
pub fn extract_date(name: &str) -> Option<NaiveDate> {
    let m = ISO_DATE.find(name)?;
    NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok()
}

/// The `.ivfdata` path paired with an `.index` path.
pub fn ivfdata_path(index_path: &Path) -> PathBuf {
    index_path.with_extension("ivfdata")
}

pub struct ShardBuilder {
    base_index_path: PathBuf,
    /// Subindexes registered for the next merge, in registration order.
    subindex_totals: Vec<(PathBuf, u64)>,
}

impl ShardBuilder {
    pub fn new(base_index_path: impl Into<PathBuf>) -> Self {
        Self {
            base_index_path: base_index_path.into(),
            subindex_totals: Vec::new(),
        }
    }

    pub fn base_index_path(&self) -> &Path {
        &self.base_index_path
    }

    /// Paths registered since the last [`Self::clear_registered`].
    pub fn registered_subindexes(&self) -> Vec<PathBuf> {
        self.subindex_totals.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn registered_vectors(&self) -> u64 {
        self.subindex_totals.iter().map(|(_, n)| n).sum()
    }

    pub fn clear_registered(&mut self) {
        self.subindex_totals.clear();
    }

    /// Train and write a new empty base index.
    ///
    /// The training set is taken from `training_set_path` if it exists,
    /// otherwise assembled from the batch containers under `batch_dir`.
    pub fn setup_base_index(
        &self,
        centroids: usize,
        compression: Compression,
        training_set_path: &Path,
        batch_dir: Option<&Path>,
        n_train: usize,
        dim: usize,
    ) -> SimdexResult<()> {
        check_index_suffix(&self.base_index_path)?;
        if self.base_index_path.exists() {
            return Err(SimdexError::PathConflict(self.base_index_path.clone()));
        }

        let training_set = codec::build_training_set(training_set_path, batch_dir, n_train, dim)?;
        info!(
            centroids,
            compression = compression.as_str(),
            n_train,
            dim,
            "training base index"
        );

        let mut index = IvfIndex::new(dim, centroids, compression);
        index.train(training_set.vectors())?;
        write_index(&index, &self.base_index_path)?;
        info!(path = %self.base_index_path.display(), "base index written");
        Ok(())
    }

    /// Load the base index, enforcing the empty-and-trained invariant.
    pub fn load_base(&self) -> SimdexResult<IvfIndex> {
        let index = read_index(&self.base_index_path, ReadMode::Buffered)?;
        if !index.is_trained() || index.ntotal() != 0 {
            return Err(SimdexError::Format(format!(
                "base index must be empty and pre-trained: ntotal = {}, is_trained = {} ({})",
                index.ntotal(),
                index.is_trained(),
                self.base_index_path.display()
            )));
        }
        Ok(index)
    }

    /// Populate one batch of vectors into a fresh subindex file.
    pub fn generate_subindex(
        &mut self,
        subindex_path: &Path,
        embeddings: &[f32],
        ids: &[i64],
    ) -> SimdexResult<u64> {
        check_index_suffix(subindex_path)?;
        if subindex_path.exists() {
            return Err(SimdexError::PathConflict(subindex_path.to_path_buf()));
        }

        let mut index = self.load_base()?;
        index.add_with_ids(embeddings, ids)?;
        let ntotal = index.ntotal();
        write_index(&index, subindex_path)?;
        self.subindex_totals.push((subindex_path.to_path_buf(), ntotal));
        Ok(ntotal)
    }

    /// Register subindexes that already exist on disk (idempotent resume).
    pub fn include_subindex_paths(&mut self, paths: &[PathBuf]) -> SimdexResult<()> {
        for path in paths {
            check_index_suffix(path)?;
            let reader = SubindexReader::open(path)?;
            self.subindex_totals.push((path.clone(), reader.ntotal()));
        }
        info!(
            subindexes = self.subindex_totals.len(),
            vectors = self.registered_vectors(),
            "subindexes registered"
        );
        Ok(())
    }

    /// Merge the registered subindexes into an on-disk shard.
    pub fn merge_registered(
        &mut self,
        index_path: &Path,
        ivfdata_path: &Path,
    ) -> SimdexResult<u64> {
        let paths = self.registered_subindexes();
        let ntotal = self.merge_ivfs(index_path, ivfdata_path, &paths)?;
        self.clear_registered();
        Ok(ntotal)
    }

    /// Merge subindexes into `index_path` + `ivfdata_path`.
    ///
    /// Each source is read memory-mapped and its inverted lists are moved
    /// into the output one list at a time, so the merge never holds more
    /// than one list per source in memory. The output index is a fresh copy
    /// of the base with the on-disk lists installed.
    pub fn merge_ivfs(
        &self,
        index_path: &Path,
        ivfdata_path: &Path,
        subindex_paths: &[PathBuf],
    ) -> SimdexResult<u64> {
        check_index_suffix(index_path)?;
        if index_path.exists() {
            return Err(SimdexError::PathConflict(index_path.to_path_buf()));
        }
        if ivfdata_path.exists() {
            return Err(SimdexError::PathConflict(ivfdata_path.to_path_buf()));
        }
        if subindex_paths.is_empty() {
            return Err(SimdexError::Format(
                "no subindexes to merge".to_string(),
            ));
        }

        let mut base = self.load_base()?;

        let mut readers = Vec::with_capacity(subindex_paths.len());
        for path in subindex_paths {
            let reader = SubindexReader::open(path)?;
            if reader.dim() != base.dim()
                || reader.nlist() != base.nlist()
                || reader.compression() != base.compression()
            {
                return Err(SimdexError::Format(format!(
                    "subindex {} does not match the base index structure \
                     (dim {} vs {}, nlist {} vs {}, compression {} vs {})",
                    path.display(),
                    reader.dim(),
                    base.dim(),
                    reader.nlist(),
                    base.nlist(),
                    reader.compression().as_str(),
                    base.compression().as_str(),
                )));
            }
            readers.push(reader);
        }

        let mut writer = OnDiskListWriter::create(ivfdata_path, base.code_size())?;
        for list_no in 0..base.nlist() {
            let parts: Vec<_> = readers.iter().map(|r| r.read_list(list_no)).collect();
            let refs: Vec<_> = parts.iter().collect();
            writer.write_list(&refs)?;
        }
        let (data_path, slots) = writer.finish()?;

        let ntotal: u64 = readers.iter().map(|r| r.ntotal()).sum();
        let lists = OnDiskLists::open(&data_path, slots, base.code_size())?;
        base.replace_lists(InvertedLists::Disk(lists), ntotal);
        write_index(&base, index_path)?;

        info!(
            shard = %index_path.display(),
            subindexes = subindex_paths.len(),
            ntotal,
            "merged on-disk shard"
        );
        Ok(ntotal)
    }

    /// Relocate a shard pair by re-merging it into `dest_dir`, which rewrites
    /// the `.index` → `.ivfdata` link, then optionally delete the sources.
    pub fn mv_index_and_ivfdata(
        &self,
        index_path: &Path,
        ivfdata_path: &Path,
        dest_dir: &Path,
        only_copy: bool,
    ) -> SimdexResult<PathBuf> {
        if !index_path.is_file() {
            return Err(SimdexError::ShardMissing(index_path.to_path_buf()));
        }
        if !ivfdata_path.is_file() {
            return Err(SimdexError::ShardMissing(ivfdata_path.to_path_buf()));
        }
        std::fs::create_dir_all(dest_dir)?;

        let file_name = index_path.file_name().ok_or_else(|| {
            SimdexError::Format(format!("invalid index path: {}", index_path.display()))
        })?;
        let new_index = dest_dir.join(file_name);
        let new_ivfdata = self::ivfdata_path(&new_index);

        let moved = self.merge_ivfs(&new_index, &new_ivfdata, &[index_path.to_path_buf()])?;

        if only_copy {
            info!(from = %index_path.display(), to = %new_index.display(), vectors = moved, "copied shard pair");
        } else {
            std::fs::remove_file(ivfdata_path)?;
            std::fs::remove_file(index_path)?;
            info!(from = %index_path.display(), to = %new_index.display(), vectors = moved, "moved shard pair");
        }
        Ok(new_index)
    }

    /// Relocate every shard pair found directly in `src_dir`.
    pub fn mv_indexes(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        only_copy: bool,
    ) -> SimdexResult<Vec<PathBuf>> {
        let mut moved = Vec::new();
        for index_path in find_indexes(src_dir, false)? {
            let data = self::ivfdata_path(&index_path);
            moved.push(self.mv_index_and_ivfdata(&index_path, &data, dest_dir, only_copy)?);
        }
        Ok(moved)
    }

    /// Consolidate freshly built indexes into an existing shard directory,
    /// grouping by the ISO date embedded in each filename.
    ///
    /// Target-dir shards whose date collides with a source group are first
    /// relocated into a scratch `tmp/` subdirectory (a plain rename would
    /// sever their `.ivfdata` link) and merged as part of their group. Each
    /// group is then merged into a single pair in `target_dir`, keeping the
    /// displaced shard's filename when one existed.
    pub fn zip_indexes(
        &self,
        source_dir: &Path,
        target_dir: &Path,
        recursive: bool,
        delete_sources: bool,
    ) -> SimdexResult<()> {
        std::fs::create_dir_all(target_dir)?;

        let sources = find_indexes(source_dir, recursive)?;
        if sources.is_empty() {
            warn!(dir = %source_dir.display(), "no indexes to zip");
            return Ok(());
        }

        // Group sources by embedded date.
        let mut groups: BTreeMap<NaiveDate, Vec<PathBuf>> = BTreeMap::new();
        for path in &sources {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let date = extract_date(name).ok_or_else(|| {
                SimdexError::Format(format!(
                    "index filename must contain a YYYY-MM-DD date: {}",
                    path.display()
                ))
            })?;
            groups.entry(date).or_default().push(path.clone());
        }

        // Displace date-colliding target shards into tmp/ and add them to
        // their group, remembering the filename each group should keep.
        let tmp_dir = target_dir.join("tmp");
        let mut keep_names: BTreeMap<NaiveDate, std::ffi::OsString> = BTreeMap::new();
        let mut tmp_indexes = Vec::new();
        for target in find_indexes(target_dir, false)? {
            let name = target.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(date) = extract_date(name) else {
                continue;
            };
            if let Some(group) = groups.get_mut(&date) {
                let displaced = self.mv_index_and_ivfdata(
                    &target,
                    &self::ivfdata_path(&target),
                    &tmp_dir,
                    false,
                )?;
                keep_names.entry(date).or_insert_with(|| {
                    displaced.file_name().map(|n| n.to_os_string()).unwrap_or_default()
                });
                group.push(displaced.clone());
                tmp_indexes.push(displaced);
            }
        }

        // Merge each date group into target_dir.
        for (date, group) in &groups {
            let file_name = keep_names
                .get(date)
                .cloned()
                .unwrap_or_else(|| format!("{date}_all.index").into());
            let out_index = target_dir.join(&file_name);
            let out_ivfdata = self::ivfdata_path(&out_index);
            let ntotal = self.merge_ivfs(&out_index, &out_ivfdata, group)?;
            info!(date = %date, shard = %out_index.display(), ntotal, "zipped date group");
        }

        // Drop intermediates, and the sources when asked to.
        let mut stale = tmp_indexes;
        if delete_sources {
            stale.extend(sources);
        }
        for index_path in stale {
            std::fs::remove_file(self::ivfdata_path(&index_path)).ok();
            std::fs::remove_file(&index_path)?;
        }
        if tmp_dir.is_dir() {
            std::fs::remove_dir(&tmp_dir).ok();
        }
        Ok(())
    }
}

/// All `.index` files under `dir`, sorted; descends into subdirectories only
/// when `recursive` is set.
pub fn find_indexes(dir: &Path, recursive: bool) -> SimdexResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    collect_indexes(dir, recursive, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_indexes(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> SimdexResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("index") {
            out.push(path);
        } else if recursive && path.is_dir() {
            collect_indexes(&path, true, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    const DIM: usize = 2;

    /// A builder with a trained 2-cell base index over two far clusters.
    fn builder_with_base(dir: &TempDir) -> ShardBuilder {
        let base_path = dir.path().join("base.index");
        let mut base = IvfIndex::new(DIM, 2, Compression::Flat);
        base.train(&[0.0, 0.0, 0.1, 0.0, 10.0, 10.0, 10.1, 10.0])
            .unwrap();
        write_index(&base, &base_path).unwrap();
        ShardBuilder::new(base_path)
    }

    /// n vectors spread across both clusters, ids offset by `first_id`.
    fn cluster_batch(n: usize, first_id: i64) -> (Vec<f32>, Vec<i64>) {
        let mut embs = Vec::with_capacity(n * DIM);
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let base = if i % 2 == 0 { 0.0 } else { 10.0 };
            embs.push(base + (i as f32) * 1e-4);
            embs.push(base);
            ids.push(first_id + i as i64);
        }
        (embs, ids)
    }

    #[test]
    fn test_generate_subindex_refuses_existing_path() {
        let dir = tempdir().unwrap();
        let mut builder = builder_with_base(&dir);
        let (embs, ids) = cluster_batch(4, 0);
        let path = dir.path().join("sub.index");
        builder.generate_subindex(&path, &embs, &ids).unwrap();
        let err = builder.generate_subindex(&path, &embs, &ids);
        assert!(matches!(err, Err(SimdexError::PathConflict(_))));
    }

    #[test]
    fn test_merge_preserves_vector_count() {
        let dir = tempdir().unwrap();
        let mut builder = builder_with_base(&dir);

        let mut offset = 0i64;
        let mut paths = Vec::new();
        for (i, n) in [1000usize, 2000, 1500].into_iter().enumerate() {
            let (embs, ids) = cluster_batch(n, offset * 10_000);
            let path = dir.path().join(format!("{i}_sub.index"));
            builder.generate_subindex(&path, &embs, &ids).unwrap();
            paths.push(path);
            offset += n as i64;
        }

        let out_index = dir.path().join("2024-01-05_all.index");
        let out_data = ivfdata_path(&out_index);
        let ntotal = builder.merge_ivfs(&out_index, &out_data, &paths).unwrap();
        assert_eq!(ntotal, 4500);

        let shard = read_index(&out_index, ReadMode::Mmap).unwrap();
        assert_eq!(shard.ntotal(), 4500);
        let (d, i) = shard.search(&[0.0, 0.0], 1).unwrap();
        assert_eq!(i, vec![0]);
        assert!(d[0].abs() < 1e-6);
    }

    #[test]
    fn test_merge_refuses_existing_outputs() {
        let dir = tempdir().unwrap();
        let mut builder = builder_with_base(&dir);
        let (embs, ids) = cluster_batch(4, 0);
        let sub = dir.path().join("sub.index");
        builder.generate_subindex(&sub, &embs, &ids).unwrap();

        let out_index = dir.path().join("out.index");
        std::fs::write(&out_index, b"occupied").unwrap();
        let err = builder.merge_ivfs(&out_index, &ivfdata_path(&out_index), &[sub]);
        assert!(matches!(err, Err(SimdexError::PathConflict(_))));
    }

    #[test]
    fn test_mv_relinks_shard_pair() {
        let dir = tempdir().unwrap();
        let mut builder = builder_with_base(&dir);
        let (embs, ids) = cluster_batch(6, 0);
        let sub = dir.path().join("sub.index");
        builder.generate_subindex(&sub, &embs, &ids).unwrap();

        let shard_index = dir.path().join("2024-03-01_all.index");
        builder
            .merge_ivfs(&shard_index, &ivfdata_path(&shard_index), &[sub])
            .unwrap();

        let dest = dir.path().join("deployed");
        let moved = builder
            .mv_index_and_ivfdata(&shard_index, &ivfdata_path(&shard_index), &dest, false)
            .unwrap();

        assert!(!shard_index.exists());
        assert!(moved.is_file());
        assert!(ivfdata_path(&moved).is_file());

        // The relocated pair must be searchable, proving the link was rewritten.
        let shard = read_index(&moved, ReadMode::Mmap).unwrap();
        assert_eq!(shard.ntotal(), 6);
        let (_, i) = shard.search(&[0.0, 0.0], 1).unwrap();
        assert_eq!(i, vec![0]);
    }

    #[test]
    fn test_zip_indexes_merges_date_groups() {
        let dir = tempdir().unwrap();
        let mut builder = builder_with_base(&dir);
        let fresh_dir = dir.path().join("fresh");
        let shards_dir = dir.path().join("shards");
        std::fs::create_dir_all(&fresh_dir).unwrap();
        std::fs::create_dir_all(&shards_dir).unwrap();

        // An existing deployed shard for 2024-02-10 with 4 vectors...
        let (embs, ids) = cluster_batch(4, 0);
        let sub = dir.path().join("old_sub.index");
        builder.generate_subindex(&sub, &embs, &ids).unwrap();
        let deployed = shards_dir.join("2024-02-10_all.index");
        builder
            .merge_ivfs(&deployed, &ivfdata_path(&deployed), &[sub])
            .unwrap();

        // ...plus an unrelated shard that must survive untouched.
        let (embs, ids) = cluster_batch(3, 100);
        let sub = dir.path().join("other_sub.index");
        builder.generate_subindex(&sub, &embs, &ids).unwrap();
        let other = shards_dir.join("2024-02-11_all.index");
        builder
            .merge_ivfs(&other, &ivfdata_path(&other), &[sub])
            .unwrap();

        // Two freshly indexed batches for 2024-02-10 with 2 + 3 vectors.
        for (i, n) in [2usize, 3].into_iter().enumerate() {
            let (embs, ids) = cluster_batch(n, (10 + i as i64) * 1000);
            let fresh = fresh_dir.join(format!("2024-02-10_part{i}.index"));
            let fresh_data = ivfdata_path(&fresh);
            let sub = dir.path().join(format!("fresh_sub{i}.index"));
            builder.generate_subindex(&sub, &embs, &ids).unwrap();
            builder.merge_ivfs(&fresh, &fresh_data, &[sub]).unwrap();
        }

        builder.zip_indexes(&fresh_dir, &shards_dir, false, true).unwrap();

        // The date group was consolidated under the deployed shard's name.
        let zipped = read_index(&deployed, ReadMode::Mmap).unwrap();
        assert_eq!(zipped.ntotal(), 4 + 2 + 3);

        // Unrelated date untouched, sources deleted, tmp cleaned up.
        let untouched = read_index(&other, ReadMode::Mmap).unwrap();
        assert_eq!(untouched.ntotal(), 3);
        assert!(find_indexes(&fresh_dir, false).unwrap().is_empty());
        assert!(!shards_dir.join("tmp").exists());
    }

    #[test]
    fn test_setup_base_index_from_batches() {
        let dir = tempdir().unwrap();
        let batch_dir = dir.path().join("batches");
        std::fs::create_dir_all(&batch_dir).unwrap();

        let (embs, ids) = cluster_batch(64, 0);
        let sents = vec![String::new(); ids.len()];
        codec::save(&batch_dir.join("000.batch"), &embs, DIM, &ids, &sents, false).unwrap();

        let base_path = dir.path().join("base.index");
        let builder = ShardBuilder::new(&base_path);
        builder
            .setup_base_index(
                2,
                Compression::Flat,
                &dir.path().join("train.dat"),
                Some(&batch_dir),
                64,
                DIM,
            )
            .unwrap();

        let base = builder.load_base().unwrap();
        assert!(base.is_trained());
        assert_eq!(base.ntotal(), 0);

        // A second setup against the same path must refuse.
        let err = builder.setup_base_index(
            2,
            Compression::Flat,
            &dir.path().join("train.dat"),
            Some(&batch_dir),
            64,
            DIM,
        );
        assert!(matches!(err, Err(SimdexError::PathConflict(_))));
    }

    #[test]
    fn test_extract_date() {
        assert_eq!(
            extract_date("2024-02-10_all.index"),
            NaiveDate::from_ymd_opt(2024, 2, 10)
        );
        assert_eq!(extract_date("no_date_here.index"), None);
    }
}
