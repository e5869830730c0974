use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use agora_types::EntityId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::oplog::OperationRecord;

/// One atomic change to the entity tables.
///
/// A single apply, eviction batch or erasure is written as one frame, so
/// recovery sees either all of it or none of it.
///
/// On-disk format of a frame:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized WalCommit)]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalCommit {
    /// Rows removed together with all their operation records.
    pub removed: Vec<EntityId>,
    /// New state of the written entity, if any.
    pub upsert: Option<Entity>,
    /// Operation records appended by this commit.
    pub records: Vec<OperationRecord>,
}

/// Flush strategy for the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every commit.
    EveryWrite,
    /// Flush to the OS and let it decide when to hit the disk.
    #[default]
    OsDefault,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub sync_mode: SyncMode,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

struct WalWriter {
    writer: BufWriter<File>,
    offset: u64,
}

/// Crash-recoverable log of entity store commits.
///
/// Frames that fail the CRC check are skipped on recovery; a frame cut off
/// by a crash ends recovery at the last complete frame.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    config: WalConfig,
}

impl WriteAheadLog {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path, config: WalConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            config,
        })
    }

    /// Append one commit. Returns the byte offset of its frame.
    pub fn append(&self, commit: &WalCommit) -> StoreResult<u64> {
        let payload =
            bincode::serialize(commit).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut w = self
            .writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned("wal writer"))?;
        let offset = w.offset;
        write_frame(&mut w.writer, &payload)?;
        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_all()?;
        }
        w.offset += (HEADER_SIZE + payload.len()) as u64;

        debug!(offset, len = payload.len(), "wal append");
        Ok(offset)
    }

    /// Read back every intact commit, front to back.
    ///
    /// A torn frame at the tail is cut off the file, so commits appended
    /// after recovery follow the last good frame.
    pub fn recover(&self) -> StoreResult<Vec<WalCommit>> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned("wal writer"))?;
        w.writer.flush()?;

        let mut data = Vec::new();
        BufReader::new(File::open(&self.path)?).read_to_end(&mut data)?;
        let (commits, valid_end) = decode_frames(&data);

        if valid_end < data.len() {
            warn!(
                valid_end,
                file_len = data.len(),
                "truncating torn wal tail"
            );
            w.writer.get_ref().set_len(valid_end as u64)?;
            w.writer.get_ref().sync_all()?;
        }
        w.offset = valid_end as u64;

        debug!(recovered = commits.len(), "wal recovery complete");
        Ok(commits)
    }

    /// Replace the whole log with `commits`.
    ///
    /// The new log is written beside the old one and renamed over it, so a
    /// crash mid-rewrite leaves the previous log in place.
    pub fn rewrite<'a>(&self, commits: impl IntoIterator<Item = &'a WalCommit>) -> StoreResult<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned("wal writer"))?;

        let tmp_path = self.path.with_extension("wal.tmp");
        let mut tmp = BufWriter::new(File::create(&tmp_path)?);
        let mut written = 0u64;
        for commit in commits {
            let payload =
                bincode::serialize(commit).map_err(|e| StoreError::Serialization(e.to_string()))?;
            write_frame(&mut tmp, &payload)?;
            written += (HEADER_SIZE + payload.len()) as u64;
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = written;
        debug!(bytes = written, "wal rewritten");
        Ok(())
    }

    /// Current end-of-log offset.
    pub fn offset(&self) -> u64 {
        self.writer.lock().map(|w| w.offset).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decode frames until the data runs out or a frame is cut short.
/// Returns the commits and the end offset of the last complete frame.
fn decode_frames(data: &[u8]) -> (Vec<WalCommit>, usize) {
    let mut commits = Vec::new();
    let mut offset = 0usize;
    while offset + HEADER_SIZE <= data.len() {
        let header = &data[offset..offset + HEADER_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let start = offset + HEADER_SIZE;
        if length == 0 || start + length > data.len() {
            warn!(offset, length, file_len = data.len(), "truncated wal frame; stopping recovery");
            return (commits, offset);
        }
        let payload = &data[start..start + length];
        offset = start + length;

        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            warn!(offset, expected = expected_crc, actual = actual_crc, "wal crc mismatch; skipping frame");
            continue;
        }
        match bincode::deserialize::<WalCommit>(payload) {
            Ok(commit) => commits.push(commit),
            Err(e) => warn!(offset, error = %e, "undecodable wal frame; skipping"),
        }
    }
    (commits, offset)
}

fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let length = payload.len() as u32;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&crc32fast::hash(payload).to_le_bytes())?;
    writer.write_all(payload)
}
