//! Framed entry log.
//!
//! A small append-only file of MessagePack entries, each framed with a length
//! prefix and a CRC32. Used for side tables that are rare to write and read
//! back in full on open: account display names and state checkpoints.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;
use tracing::warn;

/// Magic bytes for framed logs.
const FRAME_MAGIC: &[u8; 4] = b"FRM\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// File header size.
const FILE_HEADER_SIZE: u64 = 5;

/// Sanity limit for a single entry.
const MAX_ENTRY_SIZE: usize = 1024 * 1024 * 1024;

struct FrameFile {
    file: File,
    size: u64,
}

/// Append-only log of serialized `T` entries.
pub struct FrameLog<T> {
    inner: Mutex<FrameFile>,
    _entry: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> FrameLog<T> {
    /// Open or create a framed log.
    ///
    /// Returns the log and every intact entry with its offset. A torn final
    /// entry is cut off.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<(u64, T)>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let mut entries = Vec::new();

        let size = if file_size == 0 {
            file.write_all(FRAME_MAGIC)?;
            file.write_all(&[FRAME_VERSION])?;
            file.sync_all()?;
            FILE_HEADER_SIZE
        } else {
            let mut reader = BufReader::new(file.try_clone()?);

            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != FRAME_MAGIC {
                return Err(StoreError::InvalidFormat(format!(
                    "Invalid frame magic in {}",
                    path.display()
                )));
            }

            let mut version = [0u8; 1];
            reader.read_exact(&mut version)?;
            if version[0] != FRAME_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "Unsupported frame version: {}",
                    version[0]
                )));
            }

            let mut position = FILE_HEADER_SIZE;
            while position < file_size {
                match Self::read_entry(&mut reader) {
                    Ok((len, entry)) => {
                        entries.push((position, entry));
                        position += len;
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            offset = position,
                            error = %e,
                            "truncating framed log at unreadable entry"
                        );
                        file.set_len(position)?;
                        file.sync_all()?;
                        break;
                    }
                }
            }
            position
        };

        Ok((
            Self {
                inner: Mutex::new(FrameFile { file, size }),
                _entry: PhantomData,
            },
            entries,
        ))
    }

    /// Append an entry and make it durable. Returns its offset.
    pub fn append(&self, entry: &T) -> Result<u64> {
        let encoded = rmp_serde::to_vec(entry)?;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());

        let mut inner = self.inner.lock();
        let offset = inner.size;

        if let Err(e) = write_frame(&mut inner.file, offset, &frame) {
            let _ = inner.file.set_len(offset);
            return Err(e.into());
        }

        inner.size = offset + frame.len() as u64;
        Ok(offset)
    }

    /// Read the entry at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<T> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut inner.file);
        Self::read_entry(&mut reader).map(|(_, entry)| entry)
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<(u64, T)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(StoreError::Corruption("Frame entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((len as u64 + 8, entry))
    }
}

fn write_frame(file: &mut File, offset: u64, frame: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(frame)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        seq: u64,
        text: String,
    }

    fn note(seq: u64) -> Note {
        Note {
            seq,
            text: format!("note {}", seq),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.log");

        let offsets: Vec<u64> = {
            let (log, entries) = FrameLog::<Note>::open(&path).unwrap();
            assert!(entries.is_empty());
            (1..=3).map(|i| log.append(&note(i)).unwrap()).collect()
        };

        let (log, entries) = FrameLog::<Note>::open(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], (offsets[1], note(2)));
        assert_eq!(log.read_at(offsets[2]).unwrap(), note(3));
    }

    #[test]
    fn test_torn_entry_is_cut() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.log");

        let size = {
            let (log, _) = FrameLog::<Note>::open(&path).unwrap();
            log.append(&note(1)).unwrap();
            log.size()
        };

        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[50, 0, 0, 0, 1, 2]).unwrap();
        }

        let (log, entries) = FrameLog::<Note>::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(log.size(), size);

        // Appends continue after the surviving entry.
        let offset = log.append(&note(2)).unwrap();
        assert_eq!(offset, size);
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.log");
        std::fs::write(&path, b"nope!").unwrap();

        let result = FrameLog::<Note>::open(&path);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }
}
