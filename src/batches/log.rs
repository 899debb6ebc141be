//! Append-only batch log.
//!
//! Record layout:
//!
//! ```text
//! magic(4) version(1) flags(1) body_len(4) body(body_len) crc32(body)(4)
//! body = id(8) account(8) sequence(8) timestamp(8)
//!        4 x [count(4) byte_len(4) delta-varint ids(byte_len)]
//! ```
//!
//! The four ID blocks are, in order: follower additions, follower removals,
//! followed additions, followed removals. All integers are little-endian.

use crate::diff::Change;
use crate::error::{Result, StoreError};
use crate::ids::{codec, IdSet};
use crate::types::{AccountId, Batch, BatchId, BatchInput, Sequence, Timestamp};
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Magic bytes for batch records.
const LOG_MAGIC: &[u8; 4] = b"FLB\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Record header size: magic + version + flags + body length.
const RECORD_HEADER_SIZE: usize = 4 + 1 + 1 + 4;

/// Fixed part of the body: id + account + sequence + timestamp.
const BODY_FIXED_SIZE: usize = 8 * 4;

/// Trailing checksum size.
const CHECKSUM_SIZE: usize = 4;

/// Identity of a batch, readable without decoding its ID blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchHeader {
    pub id: BatchId,
    pub account: AccountId,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
}

/// A checksummed record found while scanning the log.
pub struct ScannedRecord<'a> {
    pub offset: u64,
    pub header: BatchHeader,
    body: &'a [u8],
}

impl ScannedRecord<'_> {
    /// Decode the full batch, ID blocks included.
    pub fn decode(&self) -> Result<Batch> {
        decode_body(self.body)
    }
}

struct LogFile {
    file: File,
    /// Next batch ID to assign.
    next_id: u64,
    /// End of the last complete record.
    size: u64,
    writes_since_sync: u64,
    /// Make the next sync fail, to exercise rollback.
    #[cfg(test)]
    fail_next_sync: bool,
}

impl LogFile {
    fn sync_data(&mut self) -> std::io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected sync failure"));
        }
        self.file.sync_data()
    }
}

/// Append-only batch log.
pub struct BatchLog {
    inner: Mutex<LogFile>,
    /// Sync every N appends (0 and 1 both mean every append).
    sync_interval: u64,
}

impl BatchLog {
    /// Open or create a batch log, truncating any torn record at the tail.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (valid_size, max_id) = recover_tail(&file, file_size)?;

        if valid_size < file_size {
            warn!(
                path = %path.display(),
                valid_size,
                discarded = file_size - valid_size,
                "truncating torn batch log tail"
            );
            file.set_len(valid_size)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), size = valid_size, max_id, "opened batch log");

        Ok(Self {
            inner: Mutex::new(LogFile {
                file,
                next_id: max_id + 1,
                size: valid_size,
                writes_since_sync: 0,
                #[cfg(test)]
                fail_next_sync: false,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append a batch, assigning its ID.
    ///
    /// Returns the batch and the offset where it was written. On failure the
    /// log is cut back to its previous end so no partial record remains.
    pub fn append(&self, input: &BatchInput, sequence: Sequence) -> Result<(Batch, u64)> {
        let mut inner = self.inner.lock();

        let batch = Batch {
            id: BatchId(inner.next_id),
            account: input.account,
            sequence,
            timestamp: input.timestamp,
            next_id: None,
            follower_change: input.follower_change.clone(),
            followed_change: input.followed_change.clone(),
        };
        let bytes = encode_record(&batch);

        let offset = inner.size;
        let written = write_at(&mut inner.file, offset, &bytes).and_then(|()| {
            if inner.writes_since_sync + 1 >= self.sync_interval {
                inner.sync_data()?;
                inner.writes_since_sync = 0;
            } else {
                inner.writes_since_sync += 1;
            }
            Ok(())
        });

        if let Err(e) = written {
            // Cut back to the last acknowledged record.
            if let Err(truncate) = inner.file.set_len(offset) {
                warn!(offset, error = %truncate, "could not roll back failed append");
            }
            return Err(e.into());
        }

        inner.size = offset + bytes.len() as u64;
        inner.next_id += 1;

        Ok((batch, offset))
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        self.inner.lock().fail_next_sync = true;
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Read the batch at a given offset.
    pub fn read_at(&self, offset: u64) -> Result<Batch> {
        let mut inner = self.inner.lock();
        if offset >= inner.size {
            return Err(StoreError::Corruption(format!(
                "Batch offset {} beyond log end {}",
                offset, inner.size
            )));
        }

        let file = &mut inner.file;
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let body_len = parse_record_header(&header)?;

        let mut rest = vec![0u8; body_len + CHECKSUM_SIZE];
        file.read_exact(&mut rest)?;
        let (body, checksum) = rest.split_at(body_len);
        verify_checksum(body, checksum)?;

        decode_body(body)
    }

    /// Visit every record in log order.
    ///
    /// The log is memory-mapped for the duration of the scan; appends wait.
    pub fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(ScannedRecord<'_>) -> Result<()>,
    {
        let inner = self.inner.lock();
        if inner.size == 0 {
            return Ok(());
        }

        // SAFETY: the store holds an exclusive lock file for this directory and
        // the log mutex is held, so nothing truncates or rewrites the mapped range.
        let map = unsafe { Mmap::map(&inner.file)? };
        let data = &map[..inner.size as usize];

        let mut position = 0;
        while position < data.len() {
            let (record_len, body) = split_record(&data[position..])?;
            visit(ScannedRecord {
                offset: position as u64,
                header: parse_body_header(body)?,
                body,
            })?;
            position += record_len;
        }

        Ok(())
    }

    /// Get current log size.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// ID the next append will receive.
    pub fn next_id(&self) -> BatchId {
        BatchId(self.inner.lock().next_id)
    }
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

/// Walk the file, returning the end of the last intact record and the highest
/// batch ID seen.
fn recover_tail(file: &File, file_size: u64) -> Result<(u64, u64)> {
    if file_size == 0 {
        return Ok((0, 0));
    }

    // SAFETY: called during open, before the log is shared, under the store lock.
    let map = unsafe { Mmap::map(file)? };
    let data = &map[..file_size as usize];

    let mut position = 0;
    let mut max_id = 0;

    while position < data.len() {
        let rest = &data[position..];
        match split_record(rest).and_then(|(len, body)| {
            parse_body_header(body).map(|header| (len, header))
        }) {
            Ok((len, header)) => {
                max_id = max_id.max(header.id.0);
                position += len;
            }
            Err(e) if is_torn_tail(rest) => {
                warn!(offset = position, error = %e, "batch log ends in a partial record");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok((position as u64, max_id))
}

/// An invalid record is only a torn write if nothing follows it.
fn is_torn_tail(rest: &[u8]) -> bool {
    if rest.len() < RECORD_HEADER_SIZE {
        return true;
    }

    match parse_record_header(&rest[..RECORD_HEADER_SIZE]) {
        Ok(body_len) => rest.len() <= RECORD_HEADER_SIZE + body_len + CHECKSUM_SIZE,
        Err(_) => false,
    }
}

/// Validate the framing of the record at the start of `data`; returns the
/// total record length and its body.
fn split_record(data: &[u8]) -> Result<(usize, &[u8])> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(StoreError::Corruption("Truncated batch header".into()));
    }

    let body_len = parse_record_header(&data[..RECORD_HEADER_SIZE])?;
    let total = RECORD_HEADER_SIZE + body_len + CHECKSUM_SIZE;
    if data.len() < total {
        return Err(StoreError::Corruption("Truncated batch record".into()));
    }

    let body = &data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + body_len];
    verify_checksum(body, &data[RECORD_HEADER_SIZE + body_len..total])?;

    Ok((total, body))
}

fn parse_record_header(header: &[u8]) -> Result<usize> {
    if &header[0..4] != LOG_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid batch magic".into()));
    }

    if header[4] != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported batch log version: {}",
            header[4]
        )));
    }

    // header[5] is reserved for flags.
    let body_len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    if body_len < BODY_FIXED_SIZE + 4 * 8 {
        return Err(StoreError::Corruption(format!(
            "Batch body too short: {} bytes",
            body_len
        )));
    }

    Ok(body_len)
}

fn verify_checksum(body: &[u8], stored: &[u8]) -> Result<()> {
    let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    let got = crc32fast::hash(body);
    if expected != got {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }
    Ok(())
}

fn encode_record(batch: &Batch) -> Vec<u8> {
    let mut body = Vec::with_capacity(BODY_FIXED_SIZE + 4 * 8);

    body.extend_from_slice(&batch.id.0.to_le_bytes());
    body.extend_from_slice(&batch.account.0.to_le_bytes());
    body.extend_from_slice(&batch.sequence.0.to_le_bytes());
    body.extend_from_slice(&batch.timestamp.0.to_le_bytes());

    for ids in [
        &batch.follower_change.additions,
        &batch.follower_change.removals,
        &batch.followed_change.additions,
        &batch.followed_change.removals,
    ] {
        let encoded = codec::encode(ids.as_slice());
        body.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        body.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        body.extend_from_slice(&encoded);
    }

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + body.len() + CHECKSUM_SIZE);
    record.extend_from_slice(LOG_MAGIC);
    record.push(LOG_VERSION);
    record.push(0u8);
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(&body);
    record.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    record
}

/// Little-endian reader over a record body.
struct BodyReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StoreError::Corruption("Batch body overrun".into()))?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn id_set(&mut self) -> Result<IdSet> {
        let count = self.u32()? as usize;
        let byte_len = self.u32()? as usize;
        let ids = codec::decode(self.take(byte_len)?, count)?;
        Ok(IdSet::from_sorted(ids))
    }
}

fn parse_body_header(body: &[u8]) -> Result<BatchHeader> {
    let mut reader = BodyReader {
        data: body,
        position: 0,
    };

    Ok(BatchHeader {
        id: BatchId(reader.u64()?),
        account: AccountId(reader.u64()?),
        sequence: Sequence(reader.u64()?),
        timestamp: Timestamp(reader.u64()? as i64),
    })
}

fn decode_body(body: &[u8]) -> Result<Batch> {
    let header = parse_body_header(body)?;
    let mut reader = BodyReader {
        data: body,
        position: BODY_FIXED_SIZE,
    };

    let follower_change = Change::new(reader.id_set()?, reader.id_set()?);
    let followed_change = Change::new(reader.id_set()?, reader.id_set()?);

    if reader.position != body.len() {
        return Err(StoreError::Corruption(format!(
            "Batch {} has {} trailing bytes",
            header.id,
            body.len() - reader.position
        )));
    }

    Ok(Batch {
        id: header.id,
        account: header.account,
        sequence: header.sequence,
        timestamp: header.timestamp,
        next_id: None,
        follower_change,
        followed_change,
    })
}
