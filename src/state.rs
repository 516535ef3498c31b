use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, EMBEDDING_DIM};
use crate::embed::EmbeddingClient;
use crate::error::SimdexResult;
use crate::pool::ShardPool;
use crate::query::{QueryOptions, QueryProcessor};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub pool: Arc<ShardPool>,
    pub processor: Arc<QueryProcessor>,
}

impl AppState {
    pub fn new(config: AppConfig) -> SimdexResult<Self> {
        let pool = Arc::new(ShardPool::load_dir(
            Path::new(&config.index_dir),
            config.nprobe,
        )?);
        info!(shards = pool.shard_count(), dir = %config.index_dir, "shard pool online");

        if let Some(es) = &config.es_endpoint {
            // Recorded for operators; document-body lookup happens elsewhere.
            info!(es_endpoint = %es, "downstream document store configured");
        }

        let vectorizer = EmbeddingClient::new(config.vectorizer_url.clone(), 1, EMBEDDING_DIM)?;
        let processor = Arc::new(QueryProcessor::new(
            vectorizer,
            pool.clone(),
            QueryOptions::from(&config),
        ));

        Ok(Self {
            config,
            pool,
            processor,
        })
    }
}
