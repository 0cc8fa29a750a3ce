//! File-backed read-state store.
//!
//! Writes are appended to a journal as checksummed frames and fsynced before
//! they are acknowledged. The full key set is held in memory and rebuilt by
//! replaying the journal on open. A torn or corrupt tail is truncated at the
//! last good frame, and a write that fails part way is cut back off the file
//! before the error is returned. Once enough writes have been superseded the
//! journal is rewritten as a single frame of the live keys.

use super::{ReadStateOp, ReadStateStore};
use crate::error::{IndexError, Result};
use crate::types::MessageId;
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"RDS\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Magic + version.
const HEADER_SIZE: u64 = 5;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const JOURNAL_FILE: &str = "readstate.journal";
const LOCK_FILE: &str = "LOCK";

/// Journal configuration.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// Directory holding the journal and its lock file.
    pub path: PathBuf,

    /// Rewrite the journal once this many written ops no longer contribute
    /// to the live key set. 0 disables automatic compaction.
    pub compact_after: u64,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./readstate"),
            compact_after: 10_000,
            create_if_missing: true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Frame {
    ops: Vec<ReadStateOp>,
}

struct Journal {
    read: HashSet<MessageId>,
    /// Opened in append mode; frames are written whole, unbuffered.
    file: File,
    /// Ops currently stored in the journal file.
    ops_written: u64,
}

/// Durable read-state store backed by an append-only journal.
pub struct JournalReadState {
    config: JournalConfig,
    journal_path: PathBuf,
    _lock_file: File,
    journal: RwLock<Journal>,
}

impl JournalReadState {
    /// Open the journal in `config.path`, replaying it into memory.
    pub fn open(config: JournalConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(IndexError::InvalidConfig(format!(
                    "read-state directory {} does not exist",
                    config.path.display()
                )));
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;
        let journal_path = config.path.join(JOURNAL_FILE);

        if !journal_path.exists() {
            Self::write_header(&journal_path)?;
        }

        let (read, ops_written) = Self::replay(&journal_path)?;
        tracing::info!(
            path = %journal_path.display(),
            keys = read.len(),
            ops = ops_written,
            "read-state journal replayed"
        );

        let file = OpenOptions::new().append(true).open(&journal_path)?;

        Ok(Self {
            config,
            journal_path,
            _lock_file: lock_file,
            journal: RwLock::new(Journal {
                read,
                file,
                ops_written,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.journal_path
    }

    /// Number of keys marked read.
    pub fn len(&self) -> usize {
        self.journal.read().read.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the journal as a single frame holding the live keys.
    pub fn compact(&self) -> Result<()> {
        let mut journal = self.journal.write();
        self.compact_locked(&mut journal)
    }

    fn compact_locked(&self, journal: &mut Journal) -> Result<()> {
        let tmp_path = self.journal_path.with_extension("journal.tmp");
        let mut live: Vec<MessageId> = journal.read.iter().cloned().collect();
        live.sort();
        let frame = Frame {
            ops: live.into_iter().map(ReadStateOp::Put).collect(),
        };

        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            tmp.write_all(JOURNAL_MAGIC)?;
            tmp.write_all(&[JOURNAL_VERSION])?;
            if !frame.ops.is_empty() {
                tmp.write_all(&Self::encode_frame(&frame)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        // the handle follows the file across the rename
        let file = OpenOptions::new().append(true).open(&tmp_path)?;
        fs::rename(&tmp_path, &self.journal_path)?;
        journal.file = file;

        let before = journal.ops_written;
        journal.ops_written = frame.ops.len() as u64;
        tracing::info!(
            path = %self.journal_path.display(),
            before,
            after = journal.ops_written,
            "read-state journal compacted"
        );
        Ok(())
    }

    fn append(&self, ops: Vec<ReadStateOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut journal = self.journal.write();
        let frame = Frame { ops };
        let bytes = Self::encode_frame(&frame)?;

        let start = journal.file.metadata()?.len();
        if let Err(e) = Self::write_durably(&mut journal.file, &bytes) {
            self.roll_back(&journal.file, start);
            return Err(e);
        }

        journal.ops_written += frame.ops.len() as u64;
        for op in frame.ops {
            apply(&mut journal.read, op);
        }

        let superseded = journal
            .ops_written
            .saturating_sub(journal.read.len() as u64);
        if self.config.compact_after > 0 && superseded >= self.config.compact_after {
            // the write itself is durable; a failed rewrite is retried on the next one
            if let Err(e) = self.compact_locked(&mut journal) {
                tracing::warn!(
                    path = %self.journal_path.display(),
                    error = %e,
                    "read-state journal compaction failed"
                );
            }
        }
        Ok(())
    }

    fn write_durably(file: &mut File, bytes: &[u8]) -> Result<()> {
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }

    /// Cut a partly written frame back off the journal.
    fn roll_back(&self, file: &File, len: u64) {
        match file.set_len(len).and_then(|()| file.sync_data()) {
            Ok(()) => tracing::warn!(
                path = %self.journal_path.display(),
                len,
                "rolled back failed read-state write"
            ),
            Err(e) => tracing::error!(
                path = %self.journal_path.display(),
                len,
                error = %e,
                "could not roll back failed read-state write"
            ),
        }
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| IndexError::Locked)?;

        Ok(lock_file)
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Rebuild the key set. Truncates the file after the last good frame.
    fn replay(path: &Path) -> Result<(HashSet<MessageId>, u64)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(IndexError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(IndexError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut read = HashSet::new();
        let mut ops_written = 0u64;
        let mut good_offset = HEADER_SIZE;

        loop {
            match Self::read_frame(&mut reader) {
                Ok(frame) => {
                    ops_written += frame.ops.len() as u64;
                    for op in frame.ops {
                        apply(&mut read, op);
                    }
                    good_offset = reader.stream_position()?;
                }
                Err(IndexError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = good_offset,
                        error = %e,
                        "discarding corrupt read-state journal tail"
                    );
                    break;
                }
            }
        }

        if good_offset < file_len {
            tracing::warn!(
                path = %path.display(),
                good_offset,
                file_len,
                "truncating read-state journal"
            );
            let file = reader.into_inner();
            file.set_len(good_offset)?;
            file.sync_all()?;
        }

        Ok((read, ops_written))
    }

    /// Length prefix, payload, then CRC32 of the payload.
    fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(frame)?;

        let mut bytes = Vec::with_capacity(encoded.len() + 8);
        bytes.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&encoded);
        bytes.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(bytes)
    }

    fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(IndexError::Corruption("journal frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(IndexError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}

fn apply(read: &mut HashSet<MessageId>, op: ReadStateOp) {
    match op {
        ReadStateOp::Put(key) => {
            read.insert(key);
        }
        ReadStateOp::Delete(key) => {
            read.remove(&key);
        }
    }
}

impl ReadStateStore for JournalReadState {
    fn get(&self, key: &MessageId) -> Result<bool> {
        Ok(self.journal.read().read.contains(key))
    }

    fn put(&self, key: &MessageId) -> Result<()> {
        self.append(vec![ReadStateOp::Put(key.clone())])
    }

    fn delete(&self, key: &MessageId) -> Result<()> {
        self.append(vec![ReadStateOp::Delete(key.clone())])
    }

    fn batch(&self, ops: &[ReadStateOp]) -> Result<()> {
        self.append(ops.to_vec())
    }
}
