//! Inverted-list storage.
//!
//! A freshly populated index keeps its lists in memory (`MemLists`); a merged
//! shard externalizes them into an `.ivfdata` file that is memory-mapped at
//! search time (`OnDiskLists`). Either way a list is a run of vector ids
//! followed by the same number of fixed-size codes.

use byteorder::{LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{SimdexError, SimdexResult};

/// One in-memory inverted list: parallel ids and codes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingList {
    pub ids: Vec<i64>,
    pub codes: Vec<u8>,
}

impl PostingList {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MemLists {
    pub lists: Vec<PostingList>,
}

impl MemLists {
    pub fn new(nlist: usize) -> Self {
        Self {
            lists: vec![PostingList::default(); nlist],
        }
    }

    pub fn push(&mut self, list_no: usize, id: i64, code: &[u8]) {
        let list = &mut self.lists[list_no];
        list.ids.push(id);
        list.codes.extend_from_slice(code);
    }
}

/// Location of one list inside an `.ivfdata` file: byte offset and entry count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListSlot {
    pub offset: u64,
    pub len: u64,
}

/// Memory-mapped external inverted lists. Read-only after the merge that
/// produced them; safe to map from many searchers at once.
pub struct OnDiskLists {
    mmap: Mmap,
    /// The path recorded inside the owning `.index` file. Moving either file
    /// out-of-band severs this link.
    pub path: PathBuf,
    pub slots: Vec<ListSlot>,
    pub code_size: usize,
}

impl OnDiskLists {
    pub fn open(path: &Path, slots: Vec<ListSlot>, code_size: usize) -> SimdexResult<Self> {
        let file = File::open(path).map_err(|e| {
            SimdexError::Format(format!(
                "cannot open inverted-list data {}: {e}",
                path.display()
            ))
        })?;
        let mmap = unsafe { Mmap::map(&file)? };

        let entry = 8 + code_size as u64;
        for (i, slot) in slots.iter().enumerate() {
            let end = slot.offset + slot.len * entry;
            if end > mmap.len() as u64 {
                return Err(SimdexError::Format(format!(
                    "inverted list {i} exceeds {} ({} > {} bytes)",
                    path.display(),
                    end,
                    mmap.len()
                )));
            }
        }

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            slots,
            code_size,
        })
    }

    pub fn list_len(&self, list_no: usize) -> usize {
        self.slots[list_no].len as usize
    }

    fn list_bytes(&self, list_no: usize) -> (&[u8], &[u8]) {
        let slot = self.slots[list_no];
        let n = slot.len as usize;
        let start = slot.offset as usize;
        let ids = &self.mmap[start..start + n * 8];
        let codes = &self.mmap[start + n * 8..start + n * (8 + self.code_size)];
        (ids, codes)
    }
}

/// Storage-agnostic view over an index's inverted lists.
pub enum InvertedLists {
    Mem(MemLists),
    Disk(OnDiskLists),
}

impl InvertedLists {
    pub fn nlist(&self) -> usize {
        match self {
            InvertedLists::Mem(m) => m.lists.len(),
            InvertedLists::Disk(d) => d.slots.len(),
        }
    }

    pub fn list_len(&self, list_no: usize) -> usize {
        match self {
            InvertedLists::Mem(m) => m.lists[list_no].len(),
            InvertedLists::Disk(d) => d.list_len(list_no),
        }
    }

    /// Visit every `(id, code)` entry of one list in storage order.
    pub fn scan(&self, list_no: usize, mut visit: impl FnMut(i64, &[u8])) {
        match self {
            InvertedLists::Mem(m) => {
                let list = &m.lists[list_no];
                let code_size = if list.ids.is_empty() {
                    0
                } else {
                    list.codes.len() / list.ids.len()
                };
                for (i, &id) in list.ids.iter().enumerate() {
                    visit(id, &list.codes[i * code_size..(i + 1) * code_size]);
                }
            }
            InvertedLists::Disk(d) => {
                let (ids, codes) = d.list_bytes(list_no);
                for (i, id_bytes) in ids.chunks_exact(8).enumerate() {
                    let id = i64::from_le_bytes([
                        id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3], id_bytes[4],
                        id_bytes[5], id_bytes[6], id_bytes[7],
                    ]);
                    visit(id, &codes[i * d.code_size..(i + 1) * d.code_size]);
                }
            }
        }
    }
}

/// Sequential writer that lays inverted lists into a new `.ivfdata` file.
/// Lists must be written in list-number order, one call per list.
pub struct OnDiskListWriter {
    out: BufWriter<File>,
    path: PathBuf,
    slots: Vec<ListSlot>,
    offset: u64,
    code_size: usize,
}

impl OnDiskListWriter {
    /// Refuses to overwrite: an `.ivfdata` file cannot be safely truncated
    /// while another process may have it mapped.
    pub fn create(path: &Path, code_size: usize) -> SimdexResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => SimdexError::PathConflict(path.to_path_buf()),
                _ => SimdexError::Io(e),
            })?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            slots: Vec::new(),
            offset: 0,
            code_size,
        })
    }

    /// Write the next list as the concatenation of `parts`.
    pub fn write_list(&mut self, parts: &[&PostingList]) -> SimdexResult<()> {
        let n: usize = parts.iter().map(|p| p.len()).sum();
        for part in parts {
            for &id in &part.ids {
                self.out.write_i64::<LittleEndian>(id)?;
            }
        }
        for part in parts {
            debug_assert_eq!(part.codes.len(), part.len() * self.code_size);
            self.out.write_all(&part.codes)?;
        }
        self.slots.push(ListSlot {
            offset: self.offset,
            len: n as u64,
        });
        self.offset += (n * (8 + self.code_size)) as u64;
        Ok(())
    }

    /// Flush and return the slot table for the `.index` header.
    pub fn finish(mut self) -> SimdexResult<(PathBuf, Vec<ListSlot>)> {
        self.out.flush()?;
        Ok((self.path, self.slots))
    }
}
