//! Index serialization.
//!
//! An `.index` file carries the structural header (dim, nlist, compression,
//! trained centroids, quantizer ranges) followed by the inverted lists:
//! either inline (base indexes and subindexes) or as a slot table plus the
//! recorded path of an external `.ivfdata` file (merged shards). External
//! list data is always memory-mapped on read.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{SimdexError, SimdexResult};
use crate::ivf::IvfIndex;
use crate::ivf::lists::{InvertedLists, ListSlot, MemLists, OnDiskLists, PostingList};
use crate::ivf::quantizer::{Compression, Quantizer};

const MAGIC: &[u8; 4] = b"SDIX";
const VERSION: u32 = 1;

const LISTS_INLINE: u8 = 0;
const LISTS_EXTERNAL: u8 = 1;

/// How to read the `.index` file itself. External `.ivfdata` payloads are
/// memory-mapped in either mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Buffered,
    Mmap,
}

/// Reject paths that do not end in `.index` before any file is touched.
pub fn check_index_suffix(path: &Path) -> SimdexResult<()> {
    if path.extension().and_then(|e| e.to_str()) != Some("index") {
        return Err(SimdexError::Format(format!(
            "index filename must end with .index: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Serialize an index. Refuses to overwrite an existing file: an IVF file
/// cannot be safely truncated in place while another process has it mapped.
pub fn write_index(index: &IvfIndex, path: &Path) -> SimdexResult<()> {
    check_index_suffix(path)?;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => SimdexError::PathConflict(path.to_path_buf()),
            _ => SimdexError::Io(e),
        })?;
    let mut out = BufWriter::new(file);

    out.write_all(MAGIC)?;
    out.write_u32::<LittleEndian>(VERSION)?;
    out.write_u32::<LittleEndian>(index.dim as u32)?;
    out.write_u32::<LittleEndian>(index.nlist as u32)?;
    out.write_u8(index.compression.tag())?;
    out.write_u8(index.trained as u8)?;
    out.write_u32::<LittleEndian>(index.nprobe as u32)?;
    out.write_u64::<LittleEndian>(index.ntotal)?;

    if index.trained {
        for &c in &index.centroids {
            out.write_f32::<LittleEndian>(c)?;
        }
        if let Quantizer::Sq8 { vmin, vdiff, .. } = &index.quantizer {
            for &v in vmin {
                out.write_f32::<LittleEndian>(v)?;
            }
            for &v in vdiff {
                out.write_f32::<LittleEndian>(v)?;
            }
        }
    }

    match &index.lists {
        InvertedLists::Mem(mem) => {
            out.write_u8(LISTS_INLINE)?;
            for list in &mem.lists {
                out.write_u64::<LittleEndian>(list.len() as u64)?;
                for &id in &list.ids {
                    out.write_i64::<LittleEndian>(id)?;
                }
                out.write_all(&list.codes)?;
            }
        }
        InvertedLists::Disk(disk) => {
            out.write_u8(LISTS_EXTERNAL)?;
            let path_bytes = disk.path.to_string_lossy();
            let path_bytes = path_bytes.as_bytes();
            out.write_u32::<LittleEndian>(path_bytes.len() as u32)?;
            out.write_all(path_bytes)?;
            for slot in &disk.slots {
                out.write_u64::<LittleEndian>(slot.offset)?;
                out.write_u64::<LittleEndian>(slot.len)?;
            }
        }
    }

    out.flush()?;
    Ok(())
}

/// Deserialize an index, memory-mapping any external inverted lists.
pub fn read_index(path: &Path, mode: ReadMode) -> SimdexResult<IvfIndex> {
    let data: IndexBytes = match mode {
        ReadMode::Buffered => IndexBytes::Owned(std::fs::read(path)?),
        ReadMode::Mmap => {
            let file = File::open(path)?;
            IndexBytes::Mapped(unsafe { Mmap::map(&file)? })
        }
    };
    parse_index(data.as_slice(), path)
}

enum IndexBytes {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl IndexBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            IndexBytes::Owned(v) => v,
            IndexBytes::Mapped(m) => m,
        }
    }
}

struct Header {
    dim: usize,
    nlist: usize,
    compression: Compression,
    trained: bool,
    nprobe: usize,
    ntotal: u64,
    centroids: Vec<f32>,
    quantizer: Quantizer,
}

fn read_header(cur: &mut &[u8], path: &Path) -> SimdexResult<Header> {
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(SimdexError::Format(format!(
            "not an index file: {}",
            path.display()
        )));
    }
    let version = cur.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(SimdexError::Format(format!(
            "unsupported index version {version}: {}",
            path.display()
        )));
    }
    let dim = cur.read_u32::<LittleEndian>()? as usize;
    let nlist = cur.read_u32::<LittleEndian>()? as usize;
    let compression = Compression::from_tag(cur.read_u8()?)?;
    let trained = cur.read_u8()? != 0;
    let nprobe = cur.read_u32::<LittleEndian>()? as usize;
    let ntotal = cur.read_u64::<LittleEndian>()?;

    let mut centroids = Vec::new();
    let mut quantizer = Quantizer::new(compression, dim);
    if trained {
        centroids = vec![0f32; nlist * dim];
        cur.read_f32_into::<LittleEndian>(&mut centroids)?;
        if compression == Compression::Sq8 {
            let mut vmin = vec![0f32; dim];
            let mut vdiff = vec![0f32; dim];
            cur.read_f32_into::<LittleEndian>(&mut vmin)?;
            cur.read_f32_into::<LittleEndian>(&mut vdiff)?;
            quantizer = Quantizer::Sq8 { dim, vmin, vdiff };
        }
    }

    Ok(Header {
        dim,
        nlist,
        compression,
        trained,
        nprobe,
        ntotal,
        centroids,
        quantizer,
    })
}

fn parse_index(data: &[u8], path: &Path) -> SimdexResult<IvfIndex> {
    let mut cur = data;
    let header = read_header(&mut cur, path)?;
    let code_size = header.quantizer.code_size();

    let lists = match cur.read_u8()? {
        LISTS_INLINE => {
            let mut mem = MemLists::new(header.nlist);
            for list in mem.lists.iter_mut() {
                let n = cur.read_u64::<LittleEndian>()? as usize;
                list.ids = vec![0i64; n];
                cur.read_i64_into::<LittleEndian>(&mut list.ids)?;
                list.codes = vec![0u8; n * code_size];
                cur.read_exact(&mut list.codes)?;
            }
            InvertedLists::Mem(mem)
        }
        LISTS_EXTERNAL => {
            let path_len = cur.read_u32::<LittleEndian>()? as usize;
            let mut path_bytes = vec![0u8; path_len];
            cur.read_exact(&mut path_bytes)?;
            let data_path = PathBuf::from(String::from_utf8(path_bytes).map_err(|e| {
                SimdexError::Format(format!("invalid ivfdata path in {}: {e}", path.display()))
            })?);
            let mut slots = Vec::with_capacity(header.nlist);
            for _ in 0..header.nlist {
                slots.push(ListSlot {
                    offset: cur.read_u64::<LittleEndian>()?,
                    len: cur.read_u64::<LittleEndian>()?,
                });
            }
            InvertedLists::Disk(OnDiskLists::open(&data_path, slots, code_size)?)
        }
        other => {
            return Err(SimdexError::Format(format!(
                "unknown list storage tag {other}: {}",
                path.display()
            )));
        }
    };

    Ok(IvfIndex {
        dim: header.dim,
        nlist: header.nlist,
        compression: header.compression,
        quantizer: header.quantizer,
        centroids: header.centroids,
        trained: header.trained,
        ntotal: header.ntotal,
        nprobe: header.nprobe,
        lists,
    })
}

/// Memory-mapped, list-at-a-time access to a serialized index, used by the
/// merge path. One list is materialized at a time, so merging many large
/// subindexes stays within bounded memory.
pub struct SubindexReader {
    mmap: Mmap,
    source: ListsSource,
    dim: usize,
    nlist: usize,
    compression: Compression,
    ntotal: u64,
    code_size: usize,
}

enum ListsSource {
    /// Byte offset and entry count of each inline list within the `.index`.
    Inline(Vec<(usize, usize)>),
    /// Mapped external data file plus its slot table.
    External { data: Mmap, slots: Vec<ListSlot> },
}

impl SubindexReader {
    pub fn open(path: &Path) -> SimdexResult<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let mut cur: &[u8] = &mmap;
        let header = read_header(&mut cur, path)?;
        let code_size = header.quantizer.code_size();

        let source = match cur.read_u8()? {
            LISTS_INLINE => {
                let mut offsets = Vec::with_capacity(header.nlist);
                let mut pos = mmap.len() - cur.len();
                for _ in 0..header.nlist {
                    let n = cur.read_u64::<LittleEndian>()? as usize;
                    pos += 8;
                    offsets.push((pos, n));
                    let skip = n * (8 + code_size);
                    if skip > cur.len() {
                        return Err(SimdexError::Format(format!(
                            "truncated inverted list in {}",
                            path.display()
                        )));
                    }
                    cur = &cur[skip..];
                    pos += skip;
                }
                ListsSource::Inline(offsets)
            }
            LISTS_EXTERNAL => {
                let path_len = cur.read_u32::<LittleEndian>()? as usize;
                let mut path_bytes = vec![0u8; path_len];
                cur.read_exact(&mut path_bytes)?;
                let data_path = PathBuf::from(String::from_utf8(path_bytes).map_err(|e| {
                    SimdexError::Format(format!("invalid ivfdata path in {}: {e}", path.display()))
                })?);
                let mut slots = Vec::with_capacity(header.nlist);
                for _ in 0..header.nlist {
                    slots.push(ListSlot {
                        offset: cur.read_u64::<LittleEndian>()?,
                        len: cur.read_u64::<LittleEndian>()?,
                    });
                }
                let data_file = File::open(&data_path).map_err(|e| {
                    SimdexError::Format(format!(
                        "cannot open inverted-list data {}: {e}",
                        data_path.display()
                    ))
                })?;
                let data = unsafe { Mmap::map(&data_file)? };
                ListsSource::External { data, slots }
            }
            other => {
                return Err(SimdexError::Format(format!(
                    "unknown list storage tag {other}: {}",
                    path.display()
                )));
            }
        };

        Ok(Self {
            mmap,
            source,
            dim: header.dim,
            nlist: header.nlist,
            compression: header.compression,
            ntotal: header.ntotal,
            code_size,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn ntotal(&self) -> u64 {
        self.ntotal
    }

    /// Copy one inverted list out of the mapped file.
    pub fn read_list(&self, list_no: usize) -> PostingList {
        let (bytes, n) = match &self.source {
            ListsSource::Inline(offsets) => {
                let (pos, n) = offsets[list_no];
                (&self.mmap[pos..pos + n * (8 + self.code_size)], n)
            }
            ListsSource::External { data, slots } => {
                let slot = slots[list_no];
                let n = slot.len as usize;
                let start = slot.offset as usize;
                (&data[start..start + n * (8 + self.code_size)], n)
            }
        };

        let mut ids = Vec::with_capacity(n);
        for chunk in bytes[..n * 8].chunks_exact(8) {
            ids.push(i64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]));
        }
        PostingList {
            ids,
            codes: bytes[n * 8..].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivf::IvfIndex;
    use tempfile::tempdir;

    fn trained_index() -> IvfIndex {
        let mut index = IvfIndex::new(2, 2, Compression::Flat);
        index
            .train(&[0.0, 0.0, 0.1, 0.1, 10.0, 10.0, 10.1, 10.1])
            .unwrap();
        index
    }

    #[test]
    fn test_round_trip_inline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.index");

        let mut index = trained_index();
        index
            .add_with_ids(&[0.0, 0.0, 10.0, 10.0], &[10_000, 20_000])
            .unwrap();
        write_index(&index, &path).unwrap();

        let loaded = read_index(&path, ReadMode::Mmap).unwrap();
        assert_eq!(loaded.ntotal(), 2);
        assert!(loaded.is_trained());
        assert_eq!(loaded.dim(), 2);
        let (d, i) = loaded.search(&[0.0, 0.0], 1).unwrap();
        assert_eq!(i, vec![10_000]);
        assert!(d[0].abs() < 1e-6);
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.index");
        let index = trained_index();
        write_index(&index, &path).unwrap();
        let err = write_index(&index, &path);
        assert!(matches!(err, Err(SimdexError::PathConflict(_))));
    }

    #[test]
    fn test_write_requires_index_suffix() {
        let dir = tempdir().unwrap();
        let index = trained_index();
        let err = write_index(&index, &dir.path().join("t.dat"));
        assert!(matches!(err, Err(SimdexError::Format(_))));
    }

    #[test]
    fn test_subindex_reader_lists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.index");

        let mut index = trained_index();
        index
            .add_with_ids(&[0.0, 0.0, 10.0, 10.0, 0.2, 0.2], &[1, 2, 3])
            .unwrap();
        write_index(&index, &path).unwrap();

        let reader = SubindexReader::open(&path).unwrap();
        assert_eq!(reader.ntotal(), 3);
        assert_eq!(reader.nlist(), 2);
        let total: usize = (0..reader.nlist()).map(|l| reader.read_list(l).len()).sum();
        assert_eq!(total, 3);
    }
}
