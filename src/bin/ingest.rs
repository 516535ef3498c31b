//! Preprocessing CLI: turn raw news files into deployable on-disk shards.
//!
//! `process` drives the vectorize → subindex → merge pipeline for the next
//! unprocessed input file; `setup-base` trains a new empty base index;
//! `zip` consolidates freshly built indexes into a shard directory by date;
//! `mv` relocates shard pairs without severing their data-file link.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use simdex::builder::{ShardBuilder, ivfdata_path};
use simdex::config::{DEFAULT_BATCH_SENTENCES, EMBEDDING_DIM, MINIBATCH_LARGE, MINIBATCH_LITE};
use simdex::corpus::{CorpusProcessor, IngestOptions};
use simdex::embed::EmbeddingClient;
use simdex::error::SimdexResult;
use simdex::ivf::Compression;

#[derive(Parser)]
#[command(name = "simdex-ingest", about = "Build and maintain on-disk IVF shards")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Vectorize the next raw news file and merge it into a dated shard.
    Process {
        /// Directory of raw `.jl` news files.
        #[arg(short, long)]
        input_dir: PathBuf,
        /// Directory for the merged shard pair.
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Empty, pre-trained base index.
        #[arg(short, long)]
        base_index: PathBuf,
        /// File tracking inputs that are already preprocessed.
        #[arg(short, long, default_value = "progress.txt")]
        progress_file: PathBuf,
        /// Minimum sentences per subindex batch.
        #[arg(short = 'm', long, default_value_t = DEFAULT_BATCH_SENTENCES)]
        batch_size: usize,
        /// Embedding RPC endpoint.
        #[arg(short = 'u', long, default_value = "http://localhost:8501/v1/models/sentence-encoder:predict")]
        vectorizer_url: String,
        /// Use the transformer encoder's minibatch size.
        #[arg(short, long)]
        large: bool,
        /// Compress batch containers (takes longer).
        #[arg(short, long)]
        compress: bool,
        /// Delete intermediate batch and subindex files after the merge.
        #[arg(short, long)]
        delete_tmp_files: bool,
        /// Print a pre-scan of the chosen input file.
        #[arg(short, long)]
        report: bool,
        /// Hot-attach the merged shard to a running service.
        #[arg(short, long)]
        add_shard: bool,
        /// Attach endpoint used with --add-shard.
        #[arg(long, default_value = "http://localhost:5954/faiss")]
        service_url: String,
    },
    /// Train and write a new empty base index.
    SetupBase {
        /// Output path of the base `.index`.
        #[arg(short, long)]
        base_index: PathBuf,
        /// Training-set file; created from --batch-dir when missing.
        #[arg(short, long)]
        training_set: PathBuf,
        /// Directory of batch containers to assemble a training set from.
        #[arg(long)]
        batch_dir: Option<PathBuf>,
        /// Number of IVF cells to train.
        #[arg(short, long, default_value_t = 4096)]
        centroids: usize,
        /// Vector code layout: Flat or SQ8.
        #[arg(long, default_value = "Flat")]
        compression: String,
        /// Training vectors to use.
        #[arg(short, long, default_value_t = 1_000_000)]
        n_train: usize,
        #[arg(long, default_value_t = EMBEDDING_DIM)]
        dim: usize,
    },
    /// Merge freshly built indexes into an existing shard dir, grouped by
    /// the ISO date embedded in each filename.
    Zip {
        #[arg(short, long)]
        source_dir: PathBuf,
        #[arg(short, long)]
        target_dir: PathBuf,
        #[arg(short, long)]
        base_index: PathBuf,
        /// Also collect indexes nested in subdirectories of source-dir.
        #[arg(short, long)]
        recursive: bool,
        /// Keep the source files instead of deleting them.
        #[arg(short, long)]
        keep_sources: bool,
    },
    /// Relocate every shard pair in a directory, rewriting the
    /// `.index` → `.ivfdata` links.
    Mv {
        #[arg(short, long)]
        source_dir: PathBuf,
        #[arg(short, long)]
        dest_dir: PathBuf,
        #[arg(short, long)]
        base_index: PathBuf,
        /// Copy instead of move.
        #[arg(short, long)]
        copy: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simdex=info".into()),
        )
        .compact()
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> SimdexResult<()> {
    match cli.command {
        Command::Process {
            input_dir,
            output_dir,
            base_index,
            progress_file,
            batch_size,
            vectorizer_url,
            large,
            compress,
            delete_tmp_files,
            report,
            add_shard,
            service_url,
        } => {
            if !base_index.is_file() {
                return Err(simdex::SimdexError::Format(format!(
                    "base index not found: {}",
                    base_index.display()
                )));
            }
            let minibatch = if large { MINIBATCH_LARGE } else { MINIBATCH_LITE };
            let vectorizer = EmbeddingClient::new(vectorizer_url, minibatch, EMBEDDING_DIM)?;
            let mut processor =
                CorpusProcessor::new(vectorizer, ShardBuilder::new(base_index), progress_file);

            let Some(input_file) = processor.select_file_to_process(&input_dir)? else {
                info!("nothing to process");
                return Ok(());
            };
            info!(input = %input_file.display(), "selected input file");

            if report {
                let stats = CorpusProcessor::check_docs(&input_file, batch_size)?;
                info!(
                    docs = stats.docs,
                    sentences = stats.sentences,
                    junk = stats.junk,
                    batches = stats.batches,
                    "input pre-scan"
                );
            }

            let opts = IngestOptions {
                batch_size,
                compress_batches: compress,
                delete_tmp_files,
            };
            let shard = processor.process_file(&input_file, &output_dir, &opts)?;
            info!(
                shard = %shard.index_path.display(),
                ntotal = shard.ntotal,
                "shard ready"
            );

            if add_shard {
                attach_shard(&service_url, &shard.index_path)?;
            }
            Ok(())
        }

        Command::SetupBase {
            base_index,
            training_set,
            batch_dir,
            centroids,
            compression,
            n_train,
            dim,
        } => {
            let compression = Compression::parse(&compression)?;
            let builder = ShardBuilder::new(base_index);
            builder.setup_base_index(
                centroids,
                compression,
                &training_set,
                batch_dir.as_deref(),
                n_train,
                dim,
            )
        }

        Command::Zip {
            source_dir,
            target_dir,
            base_index,
            recursive,
            keep_sources,
        } => {
            let builder = ShardBuilder::new(base_index);
            builder.zip_indexes(&source_dir, &target_dir, recursive, !keep_sources)
        }

        Command::Mv {
            source_dir,
            dest_dir,
            base_index,
            copy,
        } => {
            let builder = ShardBuilder::new(base_index);
            let moved = builder.mv_indexes(&source_dir, &dest_dir, copy)?;
            info!(count = moved.len(), "shard pairs relocated");
            Ok(())
        }
    }
}

/// PUT the merged shard path to a running service's attach endpoint.
fn attach_shard(service_url: &str, index_path: &std::path::Path) -> SimdexResult<()> {
    // Sanity-check the pair before asking the service to map it.
    if !ivfdata_path(index_path).is_file() {
        warn!(shard = %index_path.display(), "shard has no .ivfdata next to it");
    }
    let client = reqwest::blocking::Client::new();
    let response = client
        .put(service_url)
        .query(&[("path", index_path.to_string_lossy().as_ref())])
        .send()
        .map_err(|e| simdex::SimdexError::Upstream(format!("{service_url}: {e}")))?;

    let status = response.status();
    let body = response.text().unwrap_or_default();
    if status.is_success() {
        info!(status = %status, body = %body, "shard attached to running service");
        Ok(())
    } else {
        Err(simdex::SimdexError::Upstream(format!(
            "attach failed with {status}: {body}"
        )))
    }
}
