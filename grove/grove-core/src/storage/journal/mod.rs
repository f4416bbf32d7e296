//! Append-only journal of committed transactions.
//!
//! Each commit is written as one frame before the transaction releases its
//! lock: `len: u32 | json entry | crc32: u32`, where `len` counts the entry and
//! the checksum. Replay stops at the first frame that is short or fails its
//! checksum, and that torn tail is cut off when the journal is reopened.

use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, BytesMut};
use chrono::Utc;
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

use crate::storage::{Item, ItemMembership};

const MAGIC: &[u8] = b"GROVEJ01";
const FILE_NAME: &str = "journal.log";
const MAX_FRAME: usize = 64 * 1024 * 1024;

/// A row change inside a committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    PutItem { item: Item },
    DeleteItem { id: Uuid },
    PutMembership { membership: ItemMembership },
    DeleteMembership { id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub ops: Vec<JournalOp>,
}

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
    sequence: AtomicU64,
    /// Set when a failed append could not be cut back off the file.
    poisoned: AtomicBool,
}

/// The file operations needed to undo a failed append.
trait LogFile: Write + Seek {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// A failed append whose partial frame is still in the file.
#[derive(Debug, thiserror::Error)]
#[error("failed append could not be cut back to {len} bytes: {source}")]
struct TornAppend {
    len: u64,
    source: io::Error,
}

/// Writes one frame at the end of `file` and syncs it. If either step fails
/// the file is cut back to its previous length, so a frame is on disk only
/// when the append succeeded.
fn append_frame<F: LogFile>(file: &mut F, frame: &[u8]) -> Result<()> {
    let start = file.seek(SeekFrom::End(0))?;
    let Err(e) = file.write_all(frame).and_then(|()| file.sync()) else {
        return Ok(());
    };
    file.truncate(start)
        .and_then(|()| file.seek(SeekFrom::Start(start)).map(|_| ()))
        .map_err(|source| TornAppend { len: start, source })?;
    Err(anyhow::Error::new(e).context("writing journal frame"))
}

impl Journal {
    /// Opens the journal in `dir`, creating it if needed, and returns the
    /// entries it already holds.
    pub fn open(dir: impl AsRef<Path>) -> Result<(Self, Vec<JournalEntry>)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating journal directory {}", dir.display()))?;
        let path = dir.join(FILE_NAME);

        let (entries, valid_len) = if path.exists() {
            Self::read_all(&path)?
        } else {
            (Vec::new(), 0)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if valid_len == 0 {
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.sync_data()?;
        } else {
            let on_disk = file.metadata()?.len();
            if on_disk > valid_len {
                tracing::warn!(
                    path = %path.display(),
                    dropped = on_disk - valid_len,
                    "Discarding torn journal tail"
                );
                file.set_len(valid_len)?;
            }
        }
        file.seek(SeekFrom::End(0))?;

        let next = entries.last().map(|e| e.sequence + 1).unwrap_or(0);
        Ok((
            Self {
                path,
                file: Mutex::new(file),
                sequence: AtomicU64::new(next),
                poisoned: AtomicBool::new(false),
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one committed transaction and syncs it to disk.
    ///
    /// On error nothing of the entry is left in the file. If the partial
    /// frame cannot be removed, the journal refuses every later append.
    pub fn append(&self, ops: Vec<JournalOp>) -> Result<u64> {
        let mut file = self.file.lock();
        if self.poisoned.load(Ordering::SeqCst) {
            bail!("journal {} is unusable after a failed append", self.path.display());
        }

        let sequence = self.sequence.load(Ordering::SeqCst);
        let entry = JournalEntry {
            sequence,
            timestamp: Utc::now().timestamp_millis(),
            ops,
        };
        let encoded = Self::encode_entry(&entry)?;

        if let Err(e) = append_frame(&mut *file, &encoded) {
            if e.is::<TornAppend>() {
                self.poisoned.store(true, Ordering::SeqCst);
                tracing::error!(path = %self.path.display(), error = %e, "Journal poisoned");
            }
            return Err(e);
        }
        self.sequence.store(sequence + 1, Ordering::SeqCst);
        Ok(sequence)
    }

    /// Replaces the whole journal with a single entry holding `ops`.
    pub fn rewrite(&self, ops: Vec<JournalOp>) -> Result<()> {
        let mut file = self.file.lock();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let entry = JournalEntry {
            sequence,
            timestamp: Utc::now().timestamp_millis(),
            ops,
        };

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            temp.write_all(MAGIC)?;
            temp.write_all(&Self::encode_entry(&entry)?)?;
            temp.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;

        let mut reopened = OpenOptions::new().read(true).write(true).open(&self.path)?;
        reopened.seek(SeekFrom::End(0))?;
        *file = reopened;
        self.poisoned.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_all(path: &Path) -> Result<(Vec<JournalEntry>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        if reader.read_exact(&mut magic).is_err() {
            return Ok((Vec::new(), 0));
        }
        if &magic[..] != MAGIC {
            bail!("{} is not a grove journal", path.display());
        }

        let mut entries = Vec::new();
        let mut offset = MAGIC.len() as u64;
        while let Ok((entry, size)) = Self::decode_entry(&mut reader) {
            offset += size;
            entries.push(entry);
        }
        Ok((entries, offset))
    }

    fn encode_entry(entry: &JournalEntry) -> Result<Vec<u8>> {
        let data = serde_json::to_vec(entry)?;

        let mut hasher = Hasher::new();
        hasher.update(&data);
        let crc = hasher.finalize();

        let mut buf = BytesMut::with_capacity(data.len() + 8);
        buf.put_u32(data.len() as u32 + 4);
        buf.put_slice(&data);
        buf.put_u32(crc);
        Ok(buf.to_vec())
    }

    /// Returns the entry and the number of bytes it took.
    fn decode_entry<R: Read>(reader: &mut R) -> Result<(JournalEntry, u64)> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if !(4..=MAX_FRAME).contains(&len) {
            bail!("bad frame length {}", len);
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;

        let (data, crc_bytes) = buf.split_at(len - 4);
        let crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let mut hasher = Hasher::new();
        hasher.update(data);
        if hasher.finalize() != crc {
            return Err(anyhow!("CRC mismatch"));
        }

        let entry = serde_json::from_slice(data)?;
        Ok((entry, 4 + len as u64))
    }
}

#[cfg(test)]
mod tests;
