//! Batch container serialization.
//!
//! One ingest batch is persisted as a single archive holding three parallel
//! arrays: `embeddings` ([N,D] f32), `sent_ids` ([N] i64) and `sentences`
//! ([N] UTF-8). Containers are written once per vectorization batch and read
//! back when assembling a base-index training set.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression as DeflateLevel;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{SimdexError, SimdexResult};

const MAGIC: &[u8; 4] = b"SDXB";
const VERSION: u32 = 1;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// File extension for batch containers.
pub const BATCH_EXT: &str = "batch";

/// An owned, fully-loaded batch container.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub embeddings: Vec<f32>,
    pub dim: usize,
    pub sent_ids: Vec<i64>,
    pub sentences: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.sent_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent_ids.is_empty()
    }
}

/// Write a batch container. The three arrays must agree on N.
pub fn save(
    path: &Path,
    embeddings: &[f32],
    dim: usize,
    sent_ids: &[i64],
    sentences: &[String],
    compressed: bool,
) -> SimdexResult<()> {
    let n = sent_ids.len();
    if dim == 0 || embeddings.len() != n * dim || sentences.len() != n {
        return Err(SimdexError::Format(format!(
            "batch length mismatch: {} embedding rows, {} sent_ids, {} sentences ({})",
            if dim == 0 { 0 } else { embeddings.len() / dim.max(1) },
            n,
            sentences.len(),
            path.display(),
        )));
    }

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    out.write_u32::<LittleEndian>(VERSION)?;
    out.write_u8(if compressed { FLAG_COMPRESSED } else { 0 })?;
    out.write_u64::<LittleEndian>(n as u64)?;
    out.write_u32::<LittleEndian>(dim as u32)?;

    if compressed {
        let mut enc = DeflateEncoder::new(out, DeflateLevel::default());
        write_payload(&mut enc, embeddings, sent_ids, sentences)?;
        enc.finish()?.flush()?;
    } else {
        write_payload(&mut out, embeddings, sent_ids, sentences)?;
        out.flush()?;
    }

    debug!(path = %path.display(), rows = n, compressed, "saved batch container");
    Ok(())
}

fn write_payload<W: Write>(
    w: &mut W,
    embeddings: &[f32],
    sent_ids: &[i64],
    sentences: &[String],
) -> SimdexResult<()> {
    for &v in embeddings {
        w.write_f32::<LittleEndian>(v)?;
    }
    for &id in sent_ids {
        w.write_i64::<LittleEndian>(id)?;
    }
    for s in sentences {
        let bytes = s.as_bytes();
        w.write_u32::<LittleEndian>(bytes.len() as u32)?;
        w.write_all(bytes)?;
    }
    Ok(())
}

/// Read a batch container back into owned arrays. Compressed payloads are
/// inflated into memory; uncompressed payloads are streamed.
pub fn load(path: &Path) -> SimdexResult<Batch> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(SimdexError::Format(format!(
            "not a batch container: {}",
            path.display()
        )));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(SimdexError::Format(format!(
            "unsupported batch container version {version}: {}",
            path.display()
        )));
    }
    let flags = reader.read_u8()?;
    let n = reader.read_u64::<LittleEndian>()? as usize;
    let dim = reader.read_u32::<LittleEndian>()? as usize;

    if flags & FLAG_COMPRESSED != 0 {
        let mut dec = DeflateDecoder::new(reader);
        read_payload(&mut dec, n, dim, path)
    } else {
        read_payload(&mut reader, n, dim, path)
    }
}

fn read_payload<R: Read>(r: &mut R, n: usize, dim: usize, path: &Path) -> SimdexResult<Batch> {
    let mut embeddings = vec![0f32; n * dim];
    r.read_f32_into::<LittleEndian>(&mut embeddings)?;
    let mut sent_ids = vec![0i64; n];
    r.read_i64_into::<LittleEndian>(&mut sent_ids)?;

    let mut sentences = Vec::with_capacity(n);
    for _ in 0..n {
        let len = r.read_u32::<LittleEndian>()? as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        let s = String::from_utf8(buf).map_err(|e| {
            SimdexError::Format(format!("invalid UTF-8 sentence in {}: {e}", path.display()))
        })?;
        sentences.push(s);
    }

    Ok(Batch {
        embeddings,
        dim,
        sent_ids,
        sentences,
    })
}

/// A read-only, memory-mapped training set of shape [n, dim] f32.
pub struct TrainingSet {
    mmap: Mmap,
    pub n: usize,
    pub dim: usize,
}

impl TrainingSet {
    /// The mapped vectors as a flat `&[f32]` of length `n * dim`.
    pub fn vectors(&self) -> &[f32] {
        let bytes = &self.mmap[..self.n * self.dim * 4];
        // A page-aligned map of a file whose data starts at offset 0 is
        // always f32-aligned.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, self.n * self.dim) }
    }
}

/// Open (or assemble) a training set of exactly `n_vectors` embeddings.
///
/// If `training_set_path` already exists it is opened read-only. Otherwise
/// batch containers under `batch_dir` are loaded in sorted filename order and
/// their embeddings written contiguously into a new memory-mapped file,
/// truncating the final batch to land on exactly `n_vectors`.
pub fn build_training_set(
    training_set_path: &Path,
    batch_dir: Option<&Path>,
    n_vectors: usize,
    dim: usize,
) -> SimdexResult<TrainingSet> {
    let want_bytes = n_vectors * dim * 4;

    if training_set_path.is_file() {
        let file = File::open(training_set_path)?;
        let len = file.metadata()?.len() as usize;
        if len < want_bytes {
            return Err(SimdexError::Format(format!(
                "training set too small: {} holds {len} bytes, need {want_bytes}",
                training_set_path.display()
            )));
        }
        let mmap = unsafe { MmapOptions::new().len(want_bytes).map(&file)? };
        info!(path = %training_set_path.display(), n_vectors, dim, "opened existing training set");
        return Ok(TrainingSet { mmap, n: n_vectors, dim });
    }

    let batch_dir = batch_dir.ok_or_else(|| {
        SimdexError::Format(format!(
            "training set {} does not exist and no batch dir was given",
            training_set_path.display()
        ))
    })?;

    let mut batch_paths = find_batches(batch_dir)?;
    batch_paths.sort();
    info!(count = batch_paths.len(), dir = %batch_dir.display(), "found batch containers");

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(training_set_path)?;
    file.set_len(want_bytes as u64)?;
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };

    let mut filled = 0usize;
    for batch_path in &batch_paths {
        if filled >= n_vectors {
            break;
        }
        let batch = load(batch_path)?;
        if batch.dim != dim {
            return Err(SimdexError::Format(format!(
                "dimension mismatch in {}: expected {dim}, found {}",
                batch_path.display(),
                batch.dim
            )));
        }
        let take = (n_vectors - filled).min(batch.len());
        let src = &batch.embeddings[..take * dim];
        let dst = &mut mmap[filled * dim * 4..(filled + take) * dim * 4];
        for (chunk, &v) in dst.chunks_exact_mut(4).zip(src.iter()) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        filled += take;
        debug!(
            loaded = filled,
            total = n_vectors,
            from = %batch_path.display(),
            "accumulating training vectors"
        );
    }

    if filled < n_vectors {
        return Err(SimdexError::Format(format!(
            "not enough vectors in {}: wanted {n_vectors}, found {filled}",
            batch_dir.display()
        )));
    }

    mmap.flush()?;
    let mmap = mmap.make_read_only()?;
    info!(path = %training_set_path.display(), n_vectors, "training set written");
    Ok(TrainingSet { mmap, n: n_vectors, dim })
}

fn find_batches(dir: &Path) -> SimdexResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(BATCH_EXT) {
            out.push(path);
        }
    }
    Ok(out)
}
