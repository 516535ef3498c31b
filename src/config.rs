use serde::{Deserialize, Serialize};

/// Divisor that splits a vector id into (document id, sentence ordinal).
/// `doc_id = id / 10_000`, `sent_id = id % 10_000`; sentence 0 is the title.
pub const ID_DIVISOR: i64 = 10_000;

/// Embedding dimensionality shared by both encoder families.
pub const EMBEDDING_DIM: usize = 512;

/// Default L2 radius for range search, determined empirically.
pub const DEFAULT_RADIUS: f32 = 0.65;

/// Default number of inverted-list cells visited per search.
pub const DEFAULT_NPROBE: usize = 16;

/// Minimum number of sentences vectorized into one subindex batch.
pub const DEFAULT_BATCH_SENTENCES: usize = 65_536;

/// Vectorizer minibatch sizes. The transformer encoder is an order of
/// magnitude heavier per sentence than the averaging encoder.
pub const MINIBATCH_LARGE: usize = 64;
pub const MINIBATCH_LITE: usize = 512;

/// Distances below this are clamped before ranking so that reciprocal
/// rerank variants downstream cannot blow up on a zero distance.
pub const MIN_DIFF_CUTOFF: f32 = 0.01;

/// Date-range search limits: default window when the caller omits
/// `start_date`, and the hard cap on the span of any one search.
pub const DEFAULT_DATE_RANGE_DAYS: i64 = 60;
pub const MAX_DATE_RANGE_DAYS: i64 = 180;

/// Capacity of each shard worker's result cache. Interactive UIs re-issue
/// identical queries constantly; 64 entries is the observed working-set knee.
pub const WORKER_CACHE_CAP: usize = 64;

/// Decompose a vector id into (document id, sentence ordinal).
pub fn split_vector_id(id: i64) -> (i64, i64) {
    (id / ID_DIVISOR, id % ID_DIVISOR)
}

/// Compose a vector id from a document id and a sentence ordinal.
pub fn make_vector_id(doc_id: i64, sent_ordinal: i64) -> i64 {
    doc_id * ID_DIVISOR + sent_ordinal
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory of shard `.index` files loaded at startup.
    pub index_dir: String,
    /// Selects the transformer embedding space (and its base-index family)
    /// instead of the averaging encoder. Both are 512-dimensional but the
    /// spaces are incompatible: the encoder and the shards must match.
    pub large_emb_space: bool,
    pub host: String,
    pub port: u16,
    /// Downstream document store, recorded for operators; body lookup is
    /// not performed by this service.
    pub es_endpoint: Option<String>,
    /// Embedding RPC endpoint.
    pub vectorizer_url: String,
    /// Cells visited per shard search.
    pub nprobe: usize,
    /// L2 radius for range search. `None` switches the pool to k-NN mode.
    pub radius: Option<f32>,
    /// Per-shard k multipliers for k-NN mode; empirical, tunable.
    pub k_search_doc_floor: usize,
    pub k_search_doc_factor: usize,
    pub k_search_sent_floor: usize,
    pub k_search_sent_factor: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let index_dir = std::env::var("SIMDEX_INDEX_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("simdex").join("shards").to_string_lossy().to_string())
                .unwrap_or_else(|| "./shards".to_string())
        });

        Self {
            index_dir,
            large_emb_space: std::env::var("SIMDEX_LARGE_EMB_SPACE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            host: std::env::var("SIMDEX_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("SIMDEX_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5954),
            es_endpoint: std::env::var("SIMDEX_ES_ENDPOINT").ok().filter(|v| !v.is_empty()),
            vectorizer_url: std::env::var("SIMDEX_VECTORIZER_URL").unwrap_or_else(|_| {
                "http://localhost:8501/v1/models/sentence-encoder:predict".to_string()
            }),
            nprobe: std::env::var("SIMDEX_NPROBE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_NPROBE),
            radius: match std::env::var("SIMDEX_RADIUS") {
                Ok(v) if v.eq_ignore_ascii_case("off") => None,
                Ok(v) => v.parse().ok().or(Some(DEFAULT_RADIUS)),
                Err(_) => Some(DEFAULT_RADIUS),
            },
            k_search_doc_floor: 500,
            k_search_doc_factor: 100,
            k_search_sent_floor: 50,
            k_search_sent_factor: 10,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Minibatch size for corpus vectorization, tied to the encoder family.
    pub fn minibatch(&self) -> usize {
        if self.large_emb_space {
            MINIBATCH_LARGE
        } else {
            MINIBATCH_LITE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_vector_id() {
        assert_eq!(split_vector_id(420_007), (42, 7));
        assert_eq!(split_vector_id(10_000), (1, 0));
        assert_eq!(split_vector_id(9_999), (0, 9_999));
    }

    #[test]
    fn test_make_vector_id_round_trip() {
        let id = make_vector_id(42, 7);
        assert_eq!(id, 420_007);
        assert_eq!(split_vector_id(id), (42, 7));
    }
}
