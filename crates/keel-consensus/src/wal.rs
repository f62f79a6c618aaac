//! Write-ahead log of consensus events.
//!
//! Everything that can change the state machine (received proposals and votes, our own
//! messages, fired timeouts, candidate blocks) is appended and synced to disk before it is
//! acted upon. After a crash the engine replays the entries of the unfinished height through
//! a fresh machine, which reproduces the exact same decisions and signatures.
//!
//! # Frame format
//!
//! ```text
//! +----------------+------------------+--------------------+
//! | len: u32 (LE)  | sha256(body)[..4]| body: JSON record  |
//! +----------------+------------------+--------------------+
//! ```
//!
//! A frame cut short at the end of the file is the remnant of a crash mid-write. It was never
//! acted upon, so it is trimmed with a warning. A complete frame that fails its checksum or
//! cannot be decoded is corruption and stops startup, and so is a length prefix that is too
//! large or that reaches over later frames.

use crate::state::Event;
use bytes::{BufMut, BytesMut};
use keel_types::{Height, RoundStep};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Bytes before the body of each frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// Bodies must be shorter than this, which keeps the top byte of every length prefix zero.
pub const MAX_RECORD_LEN: usize = 1 << 24;

/// Errors raised by the write-ahead log.
#[derive(Debug, Error)]
pub enum WalError {
    /// The log file could not be opened.
    #[error("could not open {path}: {source}")]
    Open {
        /// Path of the log.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Reading, writing or syncing failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded.
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// A complete frame failed its checksum or could not be decoded.
    #[error("corrupted record at offset {offset}: {reason}")]
    Corrupted {
        /// Offset of the frame in the file.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A record is too large for the length prefix.
    #[error("record of {0} bytes is too large")]
    TooLarge(usize),
}

/// What the log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    /// An input to the state machine.
    Event(Event),
    /// The machine reached this step. Checked during replay.
    RoundStep(RoundStep),
    /// The height was decided and applied.
    EndHeight(Height),
}

/// A log entry with its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Height the entry belongs to.
    pub height: Height,
    /// Sequence number, increasing across the life of the log.
    pub seq: u64,
    /// The entry.
    pub entry: WalEntry,
}

/// Durable storage for consensus events.
pub trait Wal: Send {
    /// Appends an entry. Returns only once it is durable.
    fn append(&mut self, height: Height, entry: WalEntry) -> Result<(), WalError>;

    /// Returns the records written after the last [`WalEntry::EndHeight`].
    fn replay(&mut self) -> Result<Vec<WalRecord>, WalError>;
}

/// Encodes a record into a frame.
pub fn encode_frame(record: &WalRecord) -> Result<Vec<u8>, WalError> {
    let body = serde_json::to_vec(record)?;
    if body.len() >= MAX_RECORD_LEN {
        return Err(WalError::TooLarge(body.len()));
    }
    let len = u32::try_from(body.len()).map_err(|_| WalError::TooLarge(body.len()))?;
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32_le(len);
    frame.put_slice(&checksum(&body));
    frame.put_slice(&body);
    Ok(frame.to_vec())
}

fn checksum(body: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(body);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Frames decoded from a byte buffer.
#[derive(Debug, Default)]
pub struct DecodedFrames {
    /// Complete, valid records in order.
    pub records: Vec<WalRecord>,
    /// Length of the buffer covered by complete frames.
    pub valid_len: u64,
}

/// Decodes every complete frame in `data`. A trailing partial frame is left out of
/// `valid_len`; a complete invalid frame or a damaged length prefix is an error.
pub fn decode_frames(data: &[u8]) -> Result<DecodedFrames, WalError> {
    let mut decoded = DecodedFrames::default();
    let mut offset = 0usize;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < FRAME_HEADER_LEN {
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len >= MAX_RECORD_LEN {
            return Err(WalError::Corrupted {
                offset: offset as u64,
                reason: format!("declared length {len} exceeds the record limit"),
            });
        }
        let Some(body) = rest.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len) else {
            if !is_torn_tail(&rest[FRAME_HEADER_LEN..]) {
                return Err(WalError::Corrupted {
                    offset: offset as u64,
                    reason: format!("declared length {len} reaches over later records"),
                });
            }
            break;
        };
        if checksum(body) != rest[4..FRAME_HEADER_LEN] {
            return Err(WalError::Corrupted {
                offset: offset as u64,
                reason: "checksum mismatch".into(),
            });
        }
        let record: WalRecord =
            serde_json::from_slice(body).map_err(|e| WalError::Corrupted {
                offset: offset as u64,
                reason: e.to_string(),
            })?;
        decoded.records.push(record);
        offset += FRAME_HEADER_LEN + len;
    }

    decoded.valid_len = offset as u64;
    Ok(decoded)
}

/// Whether the bytes after a frame header can be an interrupted body write.
///
/// Bodies are JSON text and never contain a NUL byte, while every frame header does. A run of
/// zeros up to the end is a file extended by the crash but never written.
fn is_torn_tail(partial: &[u8]) -> bool {
    match partial.iter().position(|b| *b == 0) {
        None => true,
        Some(i) => partial[i..].iter().all(|b| *b == 0),
    }
}

fn after_last_end_height(records: Vec<WalRecord>) -> Vec<WalRecord> {
    let start = records
        .iter()
        .rposition(|r| matches!(r.entry, WalEntry::EndHeight(_)))
        .map_or(0, |i| i + 1);
    records.into_iter().skip(start).collect()
}

/// A log backed by a single append-only file.
#[derive(Debug)]
pub struct FileWal {
    path: PathBuf,
    file: File,
    len: u64,
    next_seq: u64,
    max_size: u64,
}

impl FileWal {
    /// Opens or creates the log at `path`, trimming a torn final frame.
    ///
    /// Once the file grows beyond `max_size` it is truncated at the next height boundary.
    pub fn open(path: impl AsRef<Path>, max_size: u64) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WalError::Open {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| WalError::Open {
                path: path.clone(),
                source,
            })?;

        let mut wal = Self {
            path,
            file,
            len: 0,
            next_seq: 0,
            max_size,
        };
        let records = wal.read_all()?;
        wal.next_seq = records.last().map_or(0, |r| r.seq + 1);
        Ok(wal)
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn read_all(&mut self) -> Result<Vec<WalRecord>, WalError> {
        let mut data = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut data)?;

        let decoded = decode_frames(&data)?;
        if decoded.valid_len < data.len() as u64 {
            warn!(
                path = %self.path.display(),
                removed = data.len() as u64 - decoded.valid_len,
                "removing incomplete record from wal"
            );
            self.file.set_len(decoded.valid_len)?;
            self.file.sync_all()?;
        }
        self.len = decoded.valid_len;
        Ok(decoded.records)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), WalError> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.len += frame.len() as u64;
        Ok(())
    }
}

impl Wal for FileWal {
    fn append(&mut self, height: Height, entry: WalEntry) -> Result<(), WalError> {
        let is_end = matches!(entry, WalEntry::EndHeight(_));
        let record = WalRecord {
            height,
            seq: self.next_seq,
            entry,
        };
        let frame = encode_frame(&record)?;
        self.write_frame(&frame)?;
        self.next_seq += 1;

        if is_end && self.len > self.max_size {
            // Everything up to here belongs to finished heights.
            tracing::info!(
                path = %self.path.display(),
                size = self.len,
                height,
                "truncating wal"
            );
            self.file.set_len(0)?;
            self.len = 0;
            self.write_frame(&frame)?;
        }
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<WalRecord>, WalError> {
        let records = self.read_all()?;
        Ok(after_last_end_height(records))
    }
}

/// An in-memory log. Clones share the same records, so a test can hand one clone to an
/// engine and keep another to inspect or to restart from.
#[derive(Debug, Clone, Default)]
pub struct MemoryWal {
    records: Arc<Mutex<Vec<WalRecord>>>,
}

impl MemoryWal {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log holding `records`.
    pub fn from_records(records: Vec<WalRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
        }
    }

    /// All records ever appended.
    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().clone()
    }
}

impl Wal for MemoryWal {
    fn append(&mut self, height: Height, entry: WalEntry) -> Result<(), WalError> {
        let mut records = self.records.lock();
        let seq = records.last().map_or(0, |r| r.seq + 1);
        records.push(WalRecord { height, seq, entry });
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<WalRecord>, WalError> {
        Ok(after_last_end_height(self.records.lock().clone()))
    }
}
