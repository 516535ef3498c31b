//! Query pipeline: vectorize → fan-out search → aggregate by document →
//! rerank → format payload.

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::{AppConfig, MIN_DIFF_CUTOFF, split_vector_id};
use crate::embed::EmbeddingClient;
use crate::error::{SimdexError, SimdexResult};
use crate::pool::{SearchMode, ShardPool};

/// One document hit with all of its sentence hits. `score` is the minimum
/// distance among the document's sentences; lower is better.
#[derive(Debug, Clone, Serialize)]
pub struct DocHit {
    pub doc_id: String,
    pub id_score_tups: Vec<(String, f32)>,
    pub score: f32,
}

/// One sentence hit in the flat payload. `sentence_id` is the raw vector id
/// in string form; callers decode it with the divmod-10000 rule.
#[derive(Debug, Clone, Serialize)]
pub struct SentenceHit {
    pub score: String,
    pub sentence_id: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SearchPayload {
    Docs(Vec<DocHit>),
    Sentences(Vec<SentenceHit>),
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Range-search radius; `None` switches to per-shard k-NN.
    pub radius: Option<f32>,
    pub k_search_doc_floor: usize,
    pub k_search_doc_factor: usize,
    pub k_search_sent_floor: usize,
    pub k_search_sent_factor: usize,
}

impl From<&AppConfig> for QueryOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            radius: config.radius,
            k_search_doc_floor: config.k_search_doc_floor,
            k_search_doc_factor: config.k_search_doc_factor,
            k_search_sent_floor: config.k_search_sent_floor,
            k_search_sent_factor: config.k_search_sent_factor,
        }
    }
}

pub struct QueryProcessor {
    vectorizer: EmbeddingClient,
    pool: Arc<ShardPool>,
    opts: QueryOptions,
}

impl QueryProcessor {
    pub fn new(vectorizer: EmbeddingClient, pool: Arc<ShardPool>, opts: QueryOptions) -> Self {
        Self {
            vectorizer,
            pool,
            opts,
        }
    }

    pub fn pool(&self) -> &Arc<ShardPool> {
        &self.pool
    }

    /// Run one query end to end and return the k best hits.
    pub fn query_corpus(
        &self,
        query: &str,
        k: usize,
        start_date: NaiveDate,
        end_date: NaiveDate,
        rerank_by_doc: bool,
    ) -> SimdexResult<SearchPayload> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SimdexError::BadRequest(
                "the service is not able to process empty queries".to_string(),
            ));
        }

        let t_vectorize = Instant::now();
        let query_vector = self.vectorizer.embed_query(query)?;

        let t_search = Instant::now();
        let mode = match self.opts.radius {
            Some(radius) => SearchMode::Radius(radius),
            None => SearchMode::Knn(self.k_search(k, rerank_by_doc)),
        };
        let (distances, ids) = self.pool.search(&query_vector, mode, start_date, end_date)?;

        let t_format = Instant::now();
        let docs = aggregate_docs(&distances, &ids);
        let payload = if rerank_by_doc {
            SearchPayload::Docs(format_payload_docs(docs, k))
        } else {
            SearchPayload::Sentences(format_payload_singles(docs, k))
        };

        debug!(
            vectorize_ms = t_search.duration_since(t_vectorize).as_millis() as u64,
            search_ms = t_format.duration_since(t_search).as_millis() as u64,
            format_ms = t_format.elapsed().as_millis() as u64,
            hits = ids.len(),
            "query pipeline timings"
        );
        Ok(payload)
    }

    /// Per-shard k for k-NN mode. Oversampling keeps document aggregation
    /// well-fed; the multipliers are empirical and configurable.
    fn k_search(&self, k: usize, rerank_by_doc: bool) -> usize {
        if rerank_by_doc {
            self.opts.k_search_doc_floor.max(self.opts.k_search_doc_factor * k)
        } else {
            self.opts.k_search_sent_floor.max(self.opts.k_search_sent_factor * k)
        }
    }
}

/// Collect sorted `(distance, id)` pairs into documents.
///
/// Distances are clamped to [`MIN_DIFF_CUTOFF`]; negative ids are "no hit"
/// sentinels and dropped. Documents whose sorted distance multisets are
/// byte-identical are duplicates: only the first by insertion order is kept,
/// which stops near-identical articles from crowding a response.
pub fn aggregate_docs(distances: &[f32], ids: &[i64]) -> Vec<(i64, Vec<(f32, i64)>)> {
    let mut order: Vec<i64> = Vec::new();
    let mut hits: HashMap<i64, Vec<(f32, i64)>> = HashMap::new();
    for (&distance, &id) in distances.iter().zip(ids.iter()) {
        if id < 0 {
            continue;
        }
        let (doc_id, _) = split_vector_id(id);
        let clamped = distance.max(MIN_DIFF_CUTOFF);
        hits.entry(doc_id)
            .or_insert_with(|| {
                order.push(doc_id);
                Vec::new()
            })
            .push((clamped, id));
    }

    let mut unique_scores: HashSet<[u8; 32]> = HashSet::new();
    let mut docs = Vec::with_capacity(order.len());
    for doc_id in order {
        let Some(doc_hits) = hits.remove(&doc_id) else {
            continue;
        };
        if unique_scores.insert(score_multiset_hash(&doc_hits)) {
            docs.push((doc_id, doc_hits));
        }
    }
    docs
}

fn score_multiset_hash(hits: &[(f32, i64)]) -> [u8; 32] {
    let mut scores: Vec<f32> = hits.iter().map(|(d, _)| *d).collect();
    scores.sort_unstable_by(f32::total_cmp);
    let mut hasher = Sha256::new();
    for score in scores {
        hasher.update(score.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Doc-rerank payload: ascending by per-document minimum distance.
pub fn format_payload_docs(docs: Vec<(i64, Vec<(f32, i64)>)>, k: usize) -> Vec<DocHit> {
    let mut payload: Vec<DocHit> = docs
        .into_iter()
        .map(|(doc_id, doc_hits)| {
            let score = doc_hits
                .iter()
                .map(|(d, _)| *d)
                .fold(f32::INFINITY, f32::min);
            DocHit {
                doc_id: doc_id.to_string(),
                id_score_tups: doc_hits
                    .into_iter()
                    .map(|(d, id)| (id.to_string(), d))
                    .collect(),
                score,
            }
        })
        .collect();
    payload.sort_by(|a, b| a.score.total_cmp(&b.score));
    payload.truncate(k);
    payload
}

/// Sentence-level payload: every hit flattened, ascending by distance.
pub fn format_payload_singles(docs: Vec<(i64, Vec<(f32, i64)>)>, k: usize) -> Vec<SentenceHit> {
    let mut flat: Vec<(f32, i64)> = docs.into_iter().flat_map(|(_, doc_hits)| doc_hits).collect();
    flat.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    flat.truncate(k);
    flat.into_iter()
        .map(|(d, id)| SentenceHit {
            score: d.to_string(),
            sentence_id: id.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_groups_by_document_and_clamps() {
        let distances = vec![0.0, 0.2, 0.3];
        let ids = vec![420_000, 420_003, 70_001];
        let docs = aggregate_docs(&distances, &ids);
        assert_eq!(docs.len(), 2);

        let (doc_id, hits) = &docs[0];
        assert_eq!(*doc_id, 42);
        // The zero distance is clamped up to the cutoff.
        assert_eq!(hits[0], (MIN_DIFF_CUTOFF, 420_000));
        assert_eq!(hits[1], (0.2, 420_003));
        assert_eq!(docs[1].0, 7);
    }

    #[test]
    fn test_aggregate_discards_negative_ids() {
        let docs = aggregate_docs(&[0.1, 0.2], &[-1, 50_000]);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, 5);
    }

    #[test]
    fn test_duplicate_score_multisets_suppressed() {
        // Two documents with identical distance multisets; first one wins.
        let distances = vec![0.10, 0.20, 0.30, 0.10, 0.20, 0.30];
        let ids = vec![10_000, 10_001, 10_002, 20_000, 20_001, 20_002];
        let docs = aggregate_docs(&distances, &ids);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, 1);

        let payload = format_payload_docs(docs, 5);
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].doc_id, "1");
    }

    #[test]
    fn test_doc_score_is_minimum_distance() {
        let distances = vec![0.15, 0.4, 0.9];
        let ids = vec![30_001, 30_005, 80_000];
        let payload = format_payload_docs(aggregate_docs(&distances, &ids), 10);
        assert_eq!(payload[0].doc_id, "3");
        assert_eq!(payload[0].score, 0.15);
        assert_eq!(payload[0].id_score_tups.len(), 2);
        assert_eq!(payload[1].doc_id, "8");
        assert!(payload[0].score <= payload[1].score);
    }

    #[test]
    fn test_doc_payload_truncates_to_k() {
        let distances = vec![0.1, 0.2, 0.3];
        let ids = vec![10_000, 20_000, 30_000];
        let payload = format_payload_docs(aggregate_docs(&distances, &ids), 2);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0].doc_id, "1");
    }

    #[test]
    fn test_sentence_payload_sorted_ascending() {
        let distances = vec![0.1, 0.5, 0.3];
        let ids = vec![10_000, 10_001, 20_000];
        let payload = format_payload_singles(aggregate_docs(&distances, &ids), 10);
        assert_eq!(payload.len(), 3);
        assert_eq!(payload[0].sentence_id, "10000");
        assert_eq!(payload[1].sentence_id, "20000");
        assert_eq!(payload[2].sentence_id, "10001");
        assert_eq!(payload[0].score, MIN_DIFF_CUTOFF.to_string());
    }
}
