//! Corpus ingest: drive vectorize → subindex → merge for one input file.
//!
//! Input files are JSON lines of pre-split news documents, one shard per
//! file, with the shard date taken from the input filename. A progress log
//! records completed inputs so a restart resumes at the next candidate, and
//! subindexes already on disk are reused instead of re-vectorized.

use chrono::NaiveDate;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::builder::{ShardBuilder, extract_date, ivfdata_path};
use crate::codec;
use crate::config::make_vector_id;
use crate::embed::EmbeddingClient;
use crate::error::{SimdexError, SimdexResult};

/// Body text marking a retracted article in the upstream feed.
const DELETED_STORY: &str = "DELETED_STORY";

/// One document record in an input file. `doc_id` and `split_sentences` are
/// top-level; title and body arrive nested under the feed's `lexisnexis`
/// envelope.
#[derive(Debug, Deserialize)]
struct NewsDoc {
    doc_id: String,
    #[serde(default)]
    lexisnexis: Option<LexisNexis>,
    #[serde(default)]
    split_sentences: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LexisNexis {
    #[serde(default)]
    doc_title: Option<String>,
    #[serde(default)]
    doc_description: Option<String>,
}

impl NewsDoc {
    fn body(&self) -> Option<&str> {
        self.lexisnexis.as_ref()?.doc_description.as_deref()
    }

    fn title(&self) -> Option<&str> {
        self.lexisnexis.as_ref()?.doc_title.as_deref()
    }

    /// A record is junk when its body is missing, empty or retracted, or
    /// when the splitter produced no sentences.
    fn is_junk(&self) -> bool {
        match self.body() {
            None | Some("") | Some(DELETED_STORY) => true,
            Some(_) => self.split_sentences.is_empty(),
        }
    }

    /// Title plus body sentences, with vector ids `doc_id·10000 + j`.
    fn sentences_and_ids(&self) -> SimdexResult<(Vec<String>, Vec<i64>)> {
        let doc_id: i64 = self.doc_id.parse().map_err(|_| {
            SimdexError::Format(format!("non-numeric doc_id: {}", self.doc_id))
        })?;
        let mut texts = Vec::with_capacity(self.split_sentences.len() + 1);
        texts.push(self.title().unwrap_or_default().to_string());
        texts.extend(self.split_sentences.iter().cloned());
        let ids = (0..texts.len() as i64)
            .map(|j| make_vector_id(doc_id, j))
            .collect();
        Ok((texts, ids))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CorpusStats {
    pub docs: usize,
    pub sentences: usize,
    pub junk: usize,
    pub batches: usize,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Sentences per subindex batch.
    pub batch_size: usize,
    pub compress_batches: bool,
    pub delete_tmp_files: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_BATCH_SENTENCES,
            compress_batches: false,
            delete_tmp_files: false,
        }
    }
}

/// A finished shard pair, ready to deploy or hot-attach.
#[derive(Debug, Clone)]
pub struct ShardOutput {
    pub index_path: PathBuf,
    pub ivfdata_path: PathBuf,
    pub ntotal: u64,
    pub date: NaiveDate,
}

pub struct CorpusProcessor {
    vectorizer: EmbeddingClient,
    builder: ShardBuilder,
    progress_file: PathBuf,
}

impl CorpusProcessor {
    pub fn new(
        vectorizer: EmbeddingClient,
        builder: ShardBuilder,
        progress_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            vectorizer,
            builder,
            progress_file: progress_file.into(),
        }
    }

    /// Input paths already preprocessed, newest filename first.
    pub fn track_progress(&self) -> SimdexResult<Vec<String>> {
        let mut done = Vec::new();
        if self.progress_file.is_file() {
            for line in BufReader::new(std::fs::File::open(&self.progress_file)?).lines() {
                let line = line?;
                if !line.is_empty() {
                    done.push(line);
                }
            }
        }
        done.sort_by(|a, b| b.cmp(a));
        Ok(done)
    }

    /// `.jl` files in `input_dir` not yet in the progress log, newest first.
    pub fn candidate_files(&self, input_dir: &Path) -> SimdexResult<Vec<PathBuf>> {
        if !input_dir.is_dir() {
            return Err(SimdexError::Format(format!(
                "input directory not found: {}",
                input_dir.display()
            )));
        }
        let done = self.track_progress()?;
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(input_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("jl"))
            .filter(|p| !done.contains(&p.to_string_lossy().to_string()))
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));
        Ok(candidates)
    }

    /// The next input file to preprocess, if any.
    pub fn select_file_to_process(&self, input_dir: &Path) -> SimdexResult<Option<PathBuf>> {
        Ok(self.candidate_files(input_dir)?.into_iter().next())
    }

    /// Pre-scan an input file: document, sentence, junk and batch counts.
    pub fn check_docs(path: &Path, batch_size: usize) -> SimdexResult<CorpusStats> {
        let mut stats = CorpusStats::default();
        for doc in read_docs(path)? {
            let doc = doc?;
            if doc.is_junk() {
                stats.junk += 1;
            } else {
                stats.docs += 1;
                stats.sentences += doc.split_sentences.len() + 1;
            }
        }
        // batch_size is caller-supplied; a zero just means "no batching".
        stats.batches = if batch_size > 0 {
            stats.sentences / batch_size + 1
        } else {
            0
        };
        Ok(stats)
    }

    /// Run the full pipeline for one input file and return the shard pair.
    pub fn process_file(
        &mut self,
        input_file: &Path,
        output_dir: &Path,
        opts: &IngestOptions,
    ) -> SimdexResult<ShardOutput> {
        let file_name = input_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let date = extract_date(file_name).ok_or_else(|| {
            SimdexError::Format(format!(
                "input filenames must contain their date as YYYY-MM-DD: {}",
                input_file.display()
            ))
        })?;
        let stem = input_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let (batch_dir, subidx_dir) = init_scratch_dirs(input_file, date)?;
        std::fs::create_dir_all(output_dir)?;

        self.builder.clear_registered();
        info!(input = %input_file.display(), date = %date, "processing corpus file");

        let mut texts: Vec<String> = Vec::new();
        let mut ids: Vec<i64> = Vec::new();
        let mut batch_no = 0usize;
        let mut junk = 0usize;

        for doc in read_docs(input_file)? {
            let doc = doc?;
            if doc.is_junk() {
                junk += 1;
                continue;
            }
            let (doc_texts, doc_ids) = doc.sentences_and_ids()?;
            texts.extend(doc_texts);
            ids.extend(doc_ids);

            if texts.len() >= opts.batch_size {
                self.process_batch(&stem, batch_no, &texts, &ids, &batch_dir, &subidx_dir, opts)?;
                batch_no += 1;
                texts.clear();
                ids.clear();
            }
        }
        if !texts.is_empty() {
            self.process_batch(&stem, batch_no, &texts, &ids, &batch_dir, &subidx_dir, opts)?;
            batch_no += 1;
        }
        if junk > 0 {
            info!(junk, "skipped junk documents");
        }
        if batch_no == 0 {
            return Err(SimdexError::Format(format!(
                "no indexable documents in {}",
                input_file.display()
            )));
        }

        let index_path = output_dir.join(format!("{date}_all.index"));
        let data_path = ivfdata_path(&index_path);
        let ntotal = self.builder.merge_registered(&index_path, &data_path)?;

        self.record_progress(input_file)?;

        if opts.delete_tmp_files {
            std::fs::remove_dir_all(&batch_dir).ok();
            std::fs::remove_dir_all(&subidx_dir).ok();
        }

        info!(
            shard = %index_path.display(),
            ntotal,
            batches = batch_no,
            "corpus file preprocessed"
        );
        Ok(ShardOutput {
            index_path,
            ivfdata_path: data_path,
            ntotal,
            date,
        })
    }

    /// Vectorize one batch and build its subindex. A subindex already on
    /// disk is treated as authoritative and reused, which makes a crashed
    /// run resumable without a separate state store.
    #[allow(clippy::too_many_arguments)]
    fn process_batch(
        &mut self,
        stem: &str,
        batch_no: usize,
        texts: &[String],
        ids: &[i64],
        batch_dir: &Path,
        subidx_dir: &Path,
        opts: &IngestOptions,
    ) -> SimdexResult<()> {
        let subidx_path = subidx_dir.join(format!("{stem}_{batch_no:03}_sub.index"));
        if subidx_path.is_file() {
            warn!(path = %subidx_path.display(), "reusing existing subindex");
            return self.builder.include_subindex_paths(&[subidx_path]);
        }

        let embeddings = self.vectorizer.embed_corpus(texts)?;
        let dim = embeddings.len() / texts.len().max(1);

        let batch_path = batch_dir.join(format!("{stem}_{batch_no:03}.{}", codec::BATCH_EXT));
        codec::save(&batch_path, &embeddings, dim, ids, texts, opts.compress_batches)?;

        let ntotal = self.builder.generate_subindex(&subidx_path, &embeddings, ids)?;
        info!(batch = batch_no, vectors = ntotal, "subindex written");
        Ok(())
    }

    fn record_progress(&self, input_file: &Path) -> SimdexResult<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.progress_file)?;
        writeln!(log, "{}", input_file.display())?;
        Ok(())
    }
}

/// Scratch layout next to the input dir: `../tmp_idx_files/<date>/{batches,subindexes}`.
fn init_scratch_dirs(input_file: &Path, date: NaiveDate) -> SimdexResult<(PathBuf, PathBuf)> {
    let parent = input_file.parent().unwrap_or_else(|| Path::new("."));
    let daily_dir = parent.join("../tmp_idx_files").join(date.to_string());
    let batch_dir = daily_dir.join("batches");
    let subidx_dir = daily_dir.join("subindexes");
    std::fs::create_dir_all(&batch_dir)?;
    std::fs::create_dir_all(&subidx_dir)?;
    Ok((batch_dir, subidx_dir))
}

fn read_docs(path: &Path) -> SimdexResult<impl Iterator<Item = SimdexResult<NewsDoc>>> {
    let file = std::fs::File::open(path)?;
    let path = path.to_path_buf();
    Ok(BufReader::new(file).lines().filter_map(move |line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(serde_json::from_str::<NewsDoc>(&line).map_err(|e| {
            SimdexError::Format(format!("invalid document in {}: {e}", path.display()))
        })),
        Err(e) => Some(Err(SimdexError::Io(e))),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::split_vector_id;
    use crate::ivf::{Compression, IvfIndex, write_index};
    use crate::pool::ShardPool;
    use crate::query::{QueryOptions, QueryProcessor, SearchPayload};
    use chrono::Local;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    const DIM: usize = 4;

    /// Identity-like synthetic encoder rows for the tiny corpus.
    fn encoder_rows() -> Vec<(&'static str, Vec<f32>)> {
        vec![
            ("alpha", vec![1.0, 0.0, 0.0, 0.0]),
            ("beta", vec![0.0, 1.0, 0.0, 0.0]),
            ("gamma", vec![0.0, 0.0, 1.0, 0.0]),
            ("delta", vec![0.0, 0.0, 0.0, 1.0]),
            ("epsilon", vec![0.5, 0.5, 0.0, 0.0]),
        ]
    }

    fn write_base_index(path: &Path) {
        let mut training: Vec<f32> = Vec::new();
        for (_, row) in encoder_rows() {
            training.extend(row);
        }
        let mut base = IvfIndex::new(DIM, 2, Compression::Flat);
        base.train(&training).unwrap();
        write_index(&base, path).unwrap();
    }

    /// The input filename carries today's date so the resulting shard stays
    /// inside the pool's clamped search window.
    fn write_tiny_corpus(dir: &Path) -> PathBuf {
        let input_dir = dir.join("news");
        std::fs::create_dir_all(&input_dir).unwrap();
        let today = Local::now().date_naive();
        let path = input_dir.join(format!("news_{today}.jl"));
        let lines = [
            json!({
                "doc_id": "1",
                "lexisnexis": {"doc_title": "alpha", "doc_description": "alpha body"},
                "split_sentences": ["beta", "gamma"],
            }),
            json!({
                "doc_id": "2",
                "lexisnexis": {"doc_title": "delta", "doc_description": "delta body"},
                "split_sentences": ["epsilon"],
            }),
            json!({
                "doc_id": "3",
                "lexisnexis": {"doc_title": "junk", "doc_description": "DELETED_STORY"},
                "split_sentences": ["ignored"],
            }),
        ];
        let text = lines.iter().map(|l| l.to_string()).collect::<Vec<_>>().join("\n");
        std::fs::write(&path, text).unwrap();
        path
    }

    /// Mock encoder serving both the corpus minibatch and the query call.
    fn mock_encoder(server: &MockServer) {
        let rows = encoder_rows();
        let corpus_texts = vec!["alpha", "beta", "gamma", "delta", "epsilon"];
        let corpus_outputs: Vec<Vec<f32>> = corpus_texts
            .iter()
            .map(|t| rows.iter().find(|(name, _)| name == t).unwrap().1.clone())
            .collect();
        server.mock(|when, then| {
            when.method(POST)
                .path("/encode")
                .json_body(json!({"inputs": {"text": corpus_texts}}));
            then.status(200).json_body(json!({"outputs": corpus_outputs}));
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/encode")
                .json_body(json!({"inputs": {"text": ["alpha"]}}));
            then.status(200).json_body(json!({"outputs": [[1.0, 0.0, 0.0, 0.0]]}));
        });
    }

    #[test]
    fn test_check_docs_counts_junk() {
        let dir = tempdir().unwrap();
        let input = write_tiny_corpus(dir.path());
        let stats = CorpusProcessor::check_docs(&input, 100).unwrap();
        assert_eq!(stats.docs, 2);
        assert_eq!(stats.junk, 1);
        assert_eq!(stats.sentences, 5);
        assert_eq!(stats.batches, 1);

        // A zero batch size means "no batching", not a division panic.
        let stats = CorpusProcessor::check_docs(&input, 0).unwrap();
        assert_eq!(stats.batches, 0);
    }

    #[test]
    fn test_document_filter() {
        let junk: NewsDoc = serde_json::from_str(r#"{"doc_id": "9"}"#).unwrap();
        assert!(junk.is_junk());
        let empty_body: NewsDoc = serde_json::from_str(
            r#"{"doc_id": "9", "lexisnexis": {"doc_description": ""}}"#,
        )
        .unwrap();
        assert!(empty_body.is_junk());
        let deleted: NewsDoc = serde_json::from_str(
            r#"{"doc_id": "9", "lexisnexis": {"doc_description": "DELETED_STORY"}, "split_sentences": ["s"]}"#,
        )
        .unwrap();
        assert!(deleted.is_junk());
        let no_sents: NewsDoc = serde_json::from_str(
            r#"{"doc_id": "9", "lexisnexis": {"doc_description": "text"}}"#,
        )
        .unwrap();
        assert!(no_sents.is_junk());
        let good: NewsDoc = serde_json::from_str(
            r#"{"doc_id": "9", "lexisnexis": {"doc_title": "t", "doc_description": "text"}, "split_sentences": ["s"]}"#,
        )
        .unwrap();
        assert!(!good.is_junk());
    }

    #[test]
    fn test_vector_id_assignment() {
        let doc: NewsDoc = serde_json::from_str(
            r#"{"doc_id": "42", "lexisnexis": {"doc_title": "t", "doc_description": "b"}, "split_sentences": ["a", "b"]}"#,
        )
        .unwrap();
        let (texts, ids) = doc.sentences_and_ids().unwrap();
        assert_eq!(texts.len(), 3);
        assert_eq!(ids, vec![420_000, 420_001, 420_002]);
        assert_eq!(split_vector_id(ids[2]), (42, 2));
    }

    #[test]
    fn test_tiny_corpus_round_trip() {
        let dir = tempdir().unwrap();
        let server = MockServer::start();
        mock_encoder(&server);

        let base_path = dir.path().join("base.index");
        write_base_index(&base_path);
        let input = write_tiny_corpus(dir.path());
        let out_dir = dir.path().join("shards");

        let client = EmbeddingClient::new(server.url("/encode"), 512, DIM).unwrap();
        let mut processor = CorpusProcessor::new(
            client,
            ShardBuilder::new(&base_path),
            dir.path().join("progress.txt"),
        );
        let shard = processor
            .process_file(&input, &out_dir, &IngestOptions::default())
            .unwrap();
        assert_eq!(shard.ntotal, 5);
        assert!(shard.index_path.is_file());
        assert!(shard.ivfdata_path.is_file());

        // The processed file is recorded and no longer a candidate.
        assert!(processor.candidate_files(input.parent().unwrap()).unwrap().is_empty());

        // Query "alpha" through the full pipeline: the title of doc 1 is an
        // exact match, so the top hit is vector id 10000 at distance 0.
        let pool = Arc::new(ShardPool::load_dir(&out_dir, 2).unwrap());
        let query_client = EmbeddingClient::new(server.url("/encode"), 1, DIM).unwrap();
        let qp = QueryProcessor::new(
            query_client,
            pool,
            QueryOptions {
                radius: Some(0.65),
                k_search_doc_floor: 500,
                k_search_doc_factor: 100,
                k_search_sent_floor: 50,
                k_search_sent_factor: 10,
            },
        );

        let today = Local::now().date_naive();
        let payload = qp
            .query_corpus("alpha", 5, today - chrono::Duration::days(365), today, false)
            .unwrap();
        let SearchPayload::Sentences(hits) = payload else {
            panic!("expected sentence payload");
        };
        assert_eq!(hits[0].sentence_id, "10000");
        // Distance 0 is clamped to the reciprocal-safe cutoff.
        assert_eq!(hits[0].score, "0.01");
    }

    #[test]
    fn test_resume_reuses_existing_subindexes() {
        let dir = tempdir().unwrap();
        let server = MockServer::start();
        mock_encoder(&server);

        let base_path = dir.path().join("base.index");
        write_base_index(&base_path);
        let input = write_tiny_corpus(dir.path());
        let out_dir = dir.path().join("shards");

        let client = EmbeddingClient::new(server.url("/encode"), 512, DIM).unwrap();
        let mut processor = CorpusProcessor::new(
            client,
            ShardBuilder::new(&base_path),
            dir.path().join("progress.txt"),
        );
        let first = processor
            .process_file(&input, &out_dir, &IngestOptions::default())
            .unwrap();

        // Simulate a crash after subindexing but before the merge: remove the
        // merged pair and rerun. The subindex on disk is reused, so the
        // vectorizer is not called again.
        std::fs::remove_file(&first.index_path).unwrap();
        std::fs::remove_file(&first.ivfdata_path).unwrap();
        let second = processor
            .process_file(&input, &out_dir, &IngestOptions::default())
            .unwrap();
        assert_eq!(second.ntotal, 5);
    }
}
