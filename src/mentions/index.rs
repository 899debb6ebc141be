//! Inverted index from mentioned IDs to batches.

use crate::error::{Result, StoreError};
use crate::ids::IdSet;
use crate::types::{Batch, BatchId, Role};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for mention index files.
const INDEX_MAGIC: &[u8; 4] = b"MIX\0";

/// Current index format version.
const INDEX_VERSION: u8 = 1;

/// Header: magic + version + watermark + id count.
const INDEX_HEADER_SIZE: usize = 4 + 1 + 8 + 8;

/// One occurrence of an ID in a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Posting {
    pub batch: BatchId,
    pub role: Role,
}

#[derive(Default)]
struct Postings {
    by_id: HashMap<u64, Vec<Posting>>,
    /// Highest batch folded into the index.
    watermark: Option<BatchId>,
}

/// Mentioned ID to the batches and roles it appears under.
pub struct MentionIndex {
    path: PathBuf,
    postings: RwLock<Postings>,
}

impl MentionIndex {
    /// Create an empty index that saves to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            postings: RwLock::new(Postings::default()),
        }
    }

    /// Load a saved index, or start empty if none exists.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let index = Self::new(path);
        if index.path.exists() {
            let bytes = fs::read(&index.path)?;
            *index.postings.write() = decode_index(&bytes)?;
        }
        Ok(index)
    }

    /// Index every ID of a batch. Batches at or below the watermark are
    /// skipped.
    pub fn add(&self, batch: &Batch) {
        let mut postings = self.postings.write();
        if postings.watermark.map_or(false, |w| batch.id <= w) {
            return;
        }

        for role in Role::ALL {
            for id in batch.ids(role).iter() {
                postings.by_id.entry(id).or_default().push(Posting {
                    batch: batch.id,
                    role,
                });
            }
        }
        postings.watermark = Some(batch.id);
    }

    pub fn get(&self, id: u64) -> Vec<Posting> {
        self.postings
            .read()
            .by_id
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every ID that appears in at least one batch.
    pub fn known_ids(&self) -> IdSet {
        self.postings.read().by_id.keys().copied().collect()
    }

    pub fn id_count(&self) -> usize {
        self.postings.read().by_id.len()
    }

    pub fn watermark(&self) -> Option<BatchId> {
        self.postings.read().watermark
    }

    /// Drop everything, e.g. after the saved copy turned out to be ahead of
    /// the log.
    pub fn clear(&self) {
        *self.postings.write() = Postings::default();
    }

    /// Write the index next to the log, replacing the previous copy.
    pub fn save(&self) -> Result<()> {
        let encoded = encode_index(&self.postings.read());

        let tmp_path = self.path.with_extension("idx.tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&encoded)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}

fn encode_index(postings: &Postings) -> Vec<u8> {
    let mut ids: Vec<_> = postings.by_id.keys().copied().collect();
    ids.sort_unstable();

    let mut out = Vec::with_capacity(INDEX_HEADER_SIZE + ids.len() * 24);
    out.extend_from_slice(INDEX_MAGIC);
    out.push(INDEX_VERSION);
    out.extend_from_slice(&postings.watermark.map_or(0, |w| w.0).to_le_bytes());
    out.extend_from_slice(&(ids.len() as u64).to_le_bytes());

    for id in ids {
        let entries = &postings.by_id[&id];
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for posting in entries {
            out.extend_from_slice(&posting.batch.0.to_le_bytes());
            out.push(posting.role.to_byte());
        }
    }

    let checksum = crc32fast::hash(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

fn decode_index(bytes: &[u8]) -> Result<Postings> {
    if bytes.len() < INDEX_HEADER_SIZE + 4 {
        return Err(StoreError::InvalidFormat("Mention index too short".into()));
    }
    if &bytes[..4] != INDEX_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid mention index magic".into()));
    }
    if bytes[4] != INDEX_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported mention index version: {}",
            bytes[4]
        )));
    }

    let (content, checksum) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
    let got = crc32fast::hash(content);
    if expected != got {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }

    let mut cursor = Cursor {
        bytes: content,
        position: 5,
    };
    let watermark = match cursor.u64()? {
        0 => None,
        id => Some(BatchId(id)),
    };
    let id_count = cursor.u64()? as usize;

    let mut by_id = HashMap::with_capacity(id_count.min(content.len() / 12));
    for _ in 0..id_count {
        let id = cursor.u64()?;
        let count = cursor.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(content.len() / 9));
        for _ in 0..count {
            let batch = BatchId(cursor.u64()?);
            let role = Role::from_byte(cursor.u8()?)
                .ok_or_else(|| StoreError::Corruption("Unknown role in mention index".into()))?;
            entries.push(Posting { batch, role });
        }
        by_id.insert(id, entries);
    }

    if cursor.position != content.len() {
        return Err(StoreError::Corruption(
            "Trailing bytes in mention index".into(),
        ));
    }

    Ok(Postings { by_id, watermark })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.position + len;
        let slice = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| StoreError::Corruption("Truncated mention index".into()))?;
        self.position = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}
