//! Embedding RPC client.
//!
//! Sentences are vectorized by an external encoder service speaking a
//! TF-Serving-style contract: POST `{"inputs":{"text":[...]}}` and receive
//! `{"outputs":[[f32,...],...]}` with one row per input, in input order.
//!
//! Two call shapes share that contract: `embed_query` for single
//! latency-sensitive queries and `embed_corpus` for bulk vectorization with
//! internal minibatching. The client never retries; upstream failures are
//! surfaced as [`SimdexError::Upstream`] and the caller decides.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{SimdexError, SimdexResult};

#[derive(Serialize)]
struct EncodeRequest<'a> {
    inputs: EncodeInputs<'a>,
}

#[derive(Serialize)]
struct EncodeInputs<'a> {
    text: &'a [String],
}

#[derive(Deserialize)]
struct EncodeResponse {
    outputs: Vec<Vec<f32>>,
}

pub struct EmbeddingClient {
    http: reqwest::blocking::Client,
    url: String,
    minibatch: usize,
    dim: usize,
}

impl EmbeddingClient {
    pub fn new(url: impl Into<String>, minibatch: usize, dim: usize) -> SimdexResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SimdexError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            minibatch: minibatch.max(1),
            dim,
        })
    }

    /// Vectorize a single query string into one `[1,D]` row.
    ///
    /// Callers may hand over a list; only the first element is encoded, which
    /// mirrors the one-query-per-call contract of the search endpoint.
    pub fn embed_query(&self, query: &str) -> SimdexResult<Vec<f32>> {
        let inputs = vec![query.to_string()];
        let mut rows = self.call(&inputs)?;
        match rows.pop() {
            Some(row) if rows.is_empty() => Ok(row),
            _ => Err(SimdexError::Upstream(format!(
                "expected exactly one output row from {}",
                self.url
            ))),
        }
    }

    /// Vectorize a corpus batch, minibatching internally. Output rows are in
    /// input order; the result is a flat row-major `[N,D]` buffer.
    pub fn embed_corpus(&self, sentences: &[String]) -> SimdexResult<Vec<f32>> {
        let mut flat = Vec::with_capacity(sentences.len() * self.dim);
        for (i, chunk) in sentences.chunks(self.minibatch).enumerate() {
            let rows = self.call(chunk)?;
            if rows.len() != chunk.len() {
                return Err(SimdexError::Upstream(format!(
                    "minibatch {i}: sent {} sentences, received {} rows",
                    chunk.len(),
                    rows.len()
                )));
            }
            for row in rows {
                flat.extend_from_slice(&row);
            }
            debug!(
                minibatch = i,
                vectorized = flat.len() / self.dim,
                total = sentences.len(),
                "corpus vectorization progress"
            );
        }
        Ok(flat)
    }

    fn call(&self, text: &[String]) -> SimdexResult<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(&self.url)
            .json(&EncodeRequest {
                inputs: EncodeInputs { text },
            })
            .send()
            .map_err(|e| SimdexError::Upstream(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SimdexError::Upstream(format!(
                "{} returned {status}: {body}",
                self.url
            )));
        }

        let parsed: EncodeResponse = response
            .json()
            .map_err(|e| SimdexError::Upstream(format!("invalid response from {}: {e}", self.url)))?;

        for row in &parsed.outputs {
            if row.len() != self.dim {
                return Err(SimdexError::Upstream(format!(
                    "{} returned a {}-d vector, index dimension is {}",
                    self.url,
                    row.len(),
                    self.dim
                )));
            }
        }
        Ok(parsed.outputs)
    }
}
