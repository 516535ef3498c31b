//! Inverted-file (IVF) index primitives.
//!
//! The vector space is partitioned into `nlist` Voronoi cells around trained
//! centroids; every vector lives in exactly one inverted list keyed by its
//! nearest centroid. A search visits the `nprobe` closest cells. Distances
//! are squared L2 throughout.

pub mod io;
pub mod lists;
pub mod quantizer;

pub use io::{ReadMode, SubindexReader, check_index_suffix, read_index, write_index};
pub use lists::{InvertedLists, MemLists, OnDiskLists, OnDiskListWriter, PostingList};
pub use quantizer::{Compression, Quantizer, l2_sq};

use rand::seq::index::sample;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

use crate::error::{SimdexError, SimdexResult};

const KMEANS_ITERATIONS: usize = 10;

/// One search hit. Orders by score, then id, so equal-distance ties are
/// deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdWithScore {
    pub score: f32,
    pub id: i64,
}

impl Eq for IdWithScore {}

impl Ord for IdWithScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for IdWithScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct IvfIndex {
    pub(crate) dim: usize,
    pub(crate) nlist: usize,
    pub(crate) compression: Compression,
    pub(crate) quantizer: Quantizer,
    /// Flat [nlist, dim] centroid matrix; empty until trained.
    pub(crate) centroids: Vec<f32>,
    pub(crate) trained: bool,
    pub(crate) ntotal: u64,
    /// Cells visited per search; a deployment-tuning knob, not structure.
    pub nprobe: usize,
    pub(crate) lists: InvertedLists,
}

impl IvfIndex {
    pub fn new(dim: usize, nlist: usize, compression: Compression) -> Self {
        Self {
            dim,
            nlist,
            compression,
            quantizer: Quantizer::new(compression, dim),
            centroids: Vec::new(),
            trained: false,
            ntotal: 0,
            nprobe: crate::config::DEFAULT_NPROBE,
            lists: InvertedLists::Mem(MemLists::new(nlist)),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn ntotal(&self) -> u64 {
        self.ntotal
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn code_size(&self) -> usize {
        self.quantizer.code_size()
    }

    /// Cluster `nlist` centroids from a training set (Lloyd's k-means) and
    /// learn the quantizer's per-dimension ranges from the same vectors.
    pub fn train(&mut self, vectors: &[f32]) -> SimdexResult<()> {
        let n = vectors.len() / self.dim;
        if n * self.dim != vectors.len() {
            return Err(SimdexError::Format(format!(
                "training set length {} is not a multiple of dim {}",
                vectors.len(),
                self.dim
            )));
        }
        if n < self.nlist {
            return Err(SimdexError::Format(format!(
                "training set has {n} vectors, need at least nlist = {}",
                self.nlist
            )));
        }

        let dim = self.dim;
        let mut rng = rand::thread_rng();

        // Seed with a random sample of distinct training vectors.
        let mut centroids = vec![0f32; self.nlist * dim];
        for (c, row) in sample(&mut rng, n, self.nlist).into_iter().enumerate() {
            centroids[c * dim..(c + 1) * dim].copy_from_slice(&vectors[row * dim..(row + 1) * dim]);
        }

        for _ in 0..KMEANS_ITERATIONS {
            let assignments: Vec<usize> = vectors
                .par_chunks(dim)
                .map(|row| nearest_centroid(row, &centroids, dim))
                .collect();

            let mut sums = vec![0f64; self.nlist * dim];
            let mut counts = vec![0u64; self.nlist];
            for (row, &cell) in vectors.chunks_exact(dim).zip(assignments.iter()) {
                counts[cell] += 1;
                let acc = &mut sums[cell * dim..(cell + 1) * dim];
                for (a, &v) in acc.iter_mut().zip(row.iter()) {
                    *a += v as f64;
                }
            }

            for cell in 0..self.nlist {
                if counts[cell] == 0 {
                    // Re-seed an empty cell from a random training vector.
                    let row = rand::Rng::gen_range(&mut rng, 0..n);
                    centroids[cell * dim..(cell + 1) * dim]
                        .copy_from_slice(&vectors[row * dim..(row + 1) * dim]);
                } else {
                    let inv = 1.0 / counts[cell] as f64;
                    for d in 0..dim {
                        centroids[cell * dim + d] = (sums[cell * dim + d] * inv) as f32;
                    }
                }
            }
        }

        self.centroids = centroids;
        self.quantizer.train(vectors);
        self.trained = true;
        Ok(())
    }

    /// Append vectors with caller-supplied ids to their inverted lists.
    pub fn add_with_ids(&mut self, embeddings: &[f32], ids: &[i64]) -> SimdexResult<()> {
        if !self.trained {
            return Err(SimdexError::Format(
                "cannot add to an untrained index".to_string(),
            ));
        }
        let n = ids.len();
        if embeddings.len() != n * self.dim {
            return Err(SimdexError::Format(format!(
                "found {} embedding rows and {n} ids",
                embeddings.len() / self.dim
            )));
        }
        let InvertedLists::Mem(mem) = &mut self.lists else {
            return Err(SimdexError::Format(
                "index with on-disk inverted lists is read-only".to_string(),
            ));
        };

        let dim = self.dim;
        let centroids = &self.centroids;
        let quantizer = &self.quantizer;
        let encoded: Vec<(usize, Vec<u8>)> = embeddings
            .par_chunks(dim)
            .map(|row| {
                let cell = nearest_centroid(row, centroids, dim);
                let mut code = Vec::with_capacity(quantizer.code_size());
                quantizer.encode_into(row, &mut code);
                (cell, code)
            })
            .collect();

        for ((cell, code), &id) in encoded.iter().zip(ids.iter()) {
            mem.push(*cell, id, code);
        }
        self.ntotal += n as u64;
        Ok(())
    }

    /// k-NN search over the `nprobe` nearest cells, ascending by distance.
    pub fn search(&self, query: &[f32], k: usize) -> SimdexResult<(Vec<f32>, Vec<i64>)> {
        self.check_query(query)?;
        let mut heap: BinaryHeap<IdWithScore> = BinaryHeap::with_capacity(k + 1);
        for cell in self.probe_cells(query) {
            self.lists.scan(cell, |id, code| {
                let score = self.quantizer.distance(query, code);
                let hit = IdWithScore { score, id };
                if heap.len() < k {
                    heap.push(hit);
                } else if let Some(worst) = heap.peek() {
                    if hit < *worst {
                        heap.pop();
                        heap.push(hit);
                    }
                }
            });
        }
        let mut hits = heap.into_vec();
        hits.sort_unstable();
        Ok(split_hits(hits))
    }

    /// All vectors within `radius` of the query in the probed cells. Result
    /// length varies; order is the stable storage order of the lists.
    pub fn range_search(&self, query: &[f32], radius: f32) -> SimdexResult<(Vec<f32>, Vec<i64>)> {
        self.check_query(query)?;
        let mut distances = Vec::new();
        let mut ids = Vec::new();
        for cell in self.probe_cells(query) {
            self.lists.scan(cell, |id, code| {
                let score = self.quantizer.distance(query, code);
                if score <= radius {
                    distances.push(score);
                    ids.push(id);
                }
            });
        }
        Ok((distances, ids))
    }

    pub fn write(&self, path: &Path) -> SimdexResult<()> {
        io::write_index(self, path)
    }

    pub fn read(path: &Path, mode: ReadMode) -> SimdexResult<Self> {
        io::read_index(path, mode)
    }

    /// Install a different list storage, e.g. merged on-disk lists.
    pub(crate) fn replace_lists(&mut self, lists: InvertedLists, ntotal: u64) {
        self.lists = lists;
        self.ntotal = ntotal;
    }

    fn check_query(&self, query: &[f32]) -> SimdexResult<()> {
        if !self.trained {
            return Err(SimdexError::Format(
                "cannot search an untrained index".to_string(),
            ));
        }
        if query.len() != self.dim {
            return Err(SimdexError::Format(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Indexes of the `nprobe` cells nearest to the query, nearest first.
    fn probe_cells(&self, query: &[f32]) -> Vec<usize> {
        let nprobe = self.nprobe.clamp(1, self.nlist);
        let mut cells: Vec<(usize, f32)> = self
            .centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(cell, centroid)| (cell, l2_sq(query, centroid)))
            .collect();
        if nprobe < cells.len() {
            cells.select_nth_unstable_by(nprobe - 1, |a, b| a.1.total_cmp(&b.1));
            cells.truncate(nprobe);
        }
        cells.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
        cells.into_iter().map(|(cell, _)| cell).collect()
    }
}

fn nearest_centroid(row: &[f32], centroids: &[f32], dim: usize) -> usize {
    let mut best = 0usize;
    let mut best_d = f32::INFINITY;
    for (cell, centroid) in centroids.chunks_exact(dim).enumerate() {
        let d = l2_sq(row, centroid);
        if d < best_d {
            best_d = d;
            best = cell;
        }
    }
    best
}

fn split_hits(hits: Vec<IdWithScore>) -> (Vec<f32>, Vec<i64>) {
    let mut distances = Vec::with_capacity(hits.len());
    let mut ids = Vec::with_capacity(hits.len());
    for hit in hits {
        distances.push(hit.score);
        ids.push(hit.id);
    }
    (distances, ids)
}
