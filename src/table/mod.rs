//! # Durable Table
//!
//! A small, ordered, crash-safe `String → V` table used for all service
//! metadata: snapshot rows, diff job rows, purged jobs, and report entries.
//!
//! ## Durability model
//!
//! Each table owns two files inside its directory:
//!
//! 1. **Ops log** (`<name>.log`) — an append-only record of `Put`/`Delete`
//!    operations. Every record is framed as `[u32 len][bytes][u32 crc32]`
//!    with the CRC computed over `len || bytes`, and fsynced before the
//!    operation is applied in memory.
//! 2. **Snapshot** (`<name>.tbl`) — a compact dump of the whole map, written
//!    to a temp file, fsynced, atomically renamed, and followed by a parent
//!    directory fsync. Writing a snapshot truncates the ops log.
//!
//! On open: load the snapshot if present (a corrupt snapshot is discarded
//! with a warning and the table rebuilds from the log alone), then replay the
//! ops log. Replay stops at the first torn or corrupt record — everything
//! before it is durable state, everything after never reached the caller.
//!
//! ## Ordering
//!
//! Keys are kept in a `BTreeMap`, so prefix scans and resumable range reads
//! come out in lexicographic order. That ordering is what makes diff report
//! pagination tokens stable.
//!
//! ## Thread safety
//!
//! The map and the log file handle sit behind a single `Mutex`; every public
//! method takes `&self`. Mutations are serialized, readers see the latest
//! applied state.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, Decode, Encode};

const LOG_MAGIC: &[u8; 4] = b"VTLG";
const SNAP_MAGIC: &[u8; 4] = b"VTSN";
const FORMAT_VERSION: u32 = 1;
const TMP_SUFFIX: &str = ".tmp";

/// Hard cap on a single log record (16 MiB). A larger length prefix is
/// treated as corruption.
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Table`] operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A snapshot or log frame failed its CRC check.
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(String),

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Log records
// ------------------------------------------------------------------------------------------------

/// One entry in the ops log.
#[derive(Debug)]
enum TableOp<V> {
    Put { key: String, value: V },
    Delete { key: String },
}

impl<V: Encode> Encode for TableOp<V> {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            TableOp::Put { key, value } => {
                0u8.encode(buf)?;
                key.encode(buf)?;
                value.encode(buf)?;
            }
            TableOp::Delete { key } => {
                1u8.encode(buf)?;
                key.encode(buf)?;
            }
        }
        Ok(())
    }
}

impl<V: Decode> Decode for TableOp<V> {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (tag, mut offset) = u8::decode(buf)?;
        match tag {
            0 => {
                let (key, n) = String::decode(&buf[offset..])?;
                offset += n;
                let (value, n) = V::decode(&buf[offset..])?;
                offset += n;
                Ok((TableOp::Put { key, value }, offset))
            }
            1 => {
                let (key, n) = String::decode(&buf[offset..])?;
                offset += n;
                Ok((TableOp::Delete { key }, offset))
            }
            _ => Err(CodecError::InvalidTag {
                tag,
                type_name: "TableOp",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table core
// ------------------------------------------------------------------------------------------------

/// Marker bound for values a [`Table`] can persist.
pub trait TableValue: Encode + Decode + Clone + std::fmt::Debug + Send + Sync {}
impl<T> TableValue for T where T: Encode + Decode + Clone + std::fmt::Debug + Send + Sync {}

struct TableInner<V> {
    map: BTreeMap<String, V>,
    log: File,
    /// True when the map has diverged from the last snapshot file.
    dirty: bool,
}

/// A durable, ordered `String → V` table. See the module docs for the
/// on-disk model.
pub struct Table<V: TableValue> {
    name: String,
    dir: PathBuf,
    inner: Mutex<TableInner<V>>,
}

impl<V: TableValue> std::fmt::Debug for Table<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<V: TableValue> Table<V> {
    /// Opens (or creates) the table `<name>` inside `dir`.
    ///
    /// Recovers the last durable state: snapshot first, then ops-log replay.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, TableError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snap_path = dir.join(format!("{name}.tbl"));
        let mut map = match read_snapshot::<V>(&snap_path) {
            Ok(Some(map)) => {
                debug!(table = name, entries = map.len(), "loaded table snapshot");
                map
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                // The log is the ground truth; a bad snapshot only costs a
                // longer replay.
                warn!(table = name, %e, "discarding corrupt table snapshot");
                BTreeMap::new()
            }
        };

        let log_path = dir.join(format!("{name}.log"));
        let mut log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        if log.metadata()?.len() == 0 {
            write_log_header(&mut log)?;
        } else {
            validate_log_header(&mut log, name)?;
        }

        let replayed = replay_log::<V>(&mut log, name, &mut map)?;
        info!(
            table = name,
            entries = map.len(),
            replayed,
            "table opened"
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            inner: Mutex::new(TableInner {
                map,
                log,
                dirty: false,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TableInner<V>>, TableError> {
        self.inner
            .lock()
            .map_err(|_| TableError::Internal("table mutex poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<V>, TableError> {
        Ok(self.lock()?.map.get(key).cloned())
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> Result<bool, TableError> {
        Ok(self.lock()?.map.contains_key(key))
    }

    /// Number of rows.
    pub fn len(&self) -> Result<usize, TableError> {
        Ok(self.lock()?.map.len())
    }

    /// True when the table holds no rows.
    pub fn is_empty(&self) -> Result<bool, TableError> {
        Ok(self.lock()?.map.is_empty())
    }

    /// All rows in key order.
    pub fn entries(&self) -> Result<Vec<(String, V)>, TableError> {
        Ok(self
            .lock()?
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Rows whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, V)>, TableError> {
        let inner = self.lock()?;
        Ok(inner
            .map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Up to `limit` rows under `prefix`, strictly after `start_after` when
    /// given. `limit == 0` means unbounded. This is the pagination primitive.
    pub fn scan_prefix_after(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, V)>, TableError> {
        let inner = self.lock()?;
        let lower = match start_after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Included(prefix),
        };
        let iter = inner
            .map
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Inserts or replaces a row. Durable once this returns.
    pub fn put(&self, key: &str, value: V) -> Result<(), TableError> {
        let mut inner = self.lock()?;
        let op = TableOp::Put {
            key: key.to_string(),
            value: value.clone(),
        };
        append_record(&mut inner.log, &op)?;
        inner.map.insert(key.to_string(), value);
        inner.dirty = true;
        Ok(())
    }

    /// Removes a row. Returns the previous value, if any. A delete of a
    /// missing key is a durable no-op.
    pub fn delete(&self, key: &str) -> Result<Option<V>, TableError> {
        let mut inner = self.lock()?;
        let op = TableOp::<V>::Delete {
            key: key.to_string(),
        };
        append_record(&mut inner.log, &op)?;
        let previous = inner.map.remove(key);
        inner.dirty = true;
        Ok(previous)
    }

    /// Writes a snapshot of the whole map and truncates the ops log.
    pub fn checkpoint(&self) -> Result<(), TableError> {
        let mut inner = self.lock()?;
        if !inner.dirty {
            return Ok(());
        }

        let snap_path = self.dir.join(format!("{}.tbl", self.name));
        let tmp_path = self.dir.join(format!("{}.tbl{}", self.name, TMP_SUFFIX));

        let mut payload = Vec::new();
        payload.extend_from_slice(SNAP_MAGIC);
        FORMAT_VERSION.encode(&mut payload)?;
        let rows: Vec<(String, V)> = inner
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (rows.len() as u32).encode(&mut payload)?;
        for (key, value) in &rows {
            key.encode(&mut payload)?;
            value.encode(&mut payload)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();
        payload.extend_from_slice(&checksum.to_le_bytes());

        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&payload)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &snap_path)?;
        fsync_dir(&self.dir)?;

        // Log truncation is safe only after the snapshot is durable.
        inner.log.set_len(0)?;
        inner.log.seek(SeekFrom::Start(0))?;
        write_log_header(&mut inner.log)?;
        inner.dirty = false;

        debug!(table = %self.name, rows = rows.len(), "table checkpoint written");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Log framing
// ------------------------------------------------------------------------------------------------

fn write_log_header(log: &mut File) -> Result<(), TableError> {
    let mut header = Vec::with_capacity(8);
    header.extend_from_slice(LOG_MAGIC);
    header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    log.write_all(&header)?;
    log.sync_all()?;
    Ok(())
}

fn validate_log_header(log: &mut File, name: &str) -> Result<(), TableError> {
    log.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; 8];
    log.read_exact(&mut header)?;
    if &header[..4] != LOG_MAGIC {
        return Err(TableError::Internal(format!(
            "table {name}: bad ops log magic"
        )));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(TableError::Internal(format!(
            "table {name}: unsupported ops log version {version}"
        )));
    }
    log.seek(SeekFrom::End(0))?;
    Ok(())
}

fn append_record<V: Encode>(log: &mut File, op: &TableOp<V>) -> Result<(), TableError> {
    let bytes = codec::to_vec(op)?;
    let len = bytes.len() as u32;

    let mut hasher = Crc32::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(&bytes);
    let checksum = hasher.finalize();

    log.write_all(&len.to_le_bytes())?;
    log.write_all(&bytes)?;
    log.write_all(&checksum.to_le_bytes())?;
    log.sync_all()?;
    Ok(())
}

/// Replays every intact record onto `map`. A torn or corrupt tail is logged
/// and ignored — it belongs to a write that never completed.
fn replay_log<V: TableValue>(
    log: &mut File,
    name: &str,
    map: &mut BTreeMap<String, V>,
) -> Result<u64, TableError> {
    log.seek(SeekFrom::Start(8))?;
    let mut replayed = 0u64;

    loop {
        let mut len_bytes = [0u8; 4];
        match log.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(TableError::Io(e)),
        }
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_LEN {
            warn!(table = name, len, "oversized ops log record; stopping replay");
            break;
        }

        let mut bytes = vec![0u8; len as usize];
        if log.read_exact(&mut bytes).is_err() {
            warn!(table = name, "torn ops log record; stopping replay");
            break;
        }
        let mut crc_bytes = [0u8; 4];
        if log.read_exact(&mut crc_bytes).is_err() {
            warn!(table = name, "torn ops log checksum; stopping replay");
            break;
        }

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&bytes);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            warn!(table = name, "ops log checksum mismatch; stopping replay");
            break;
        }

        let (op, _) = codec::from_slice::<TableOp<V>>(&bytes)?;
        match op {
            TableOp::Put { key, value } => {
                map.insert(key, value);
            }
            TableOp::Delete { key } => {
                map.remove(&key);
            }
        }
        replayed += 1;
    }

    log.seek(SeekFrom::End(0))?;
    Ok(replayed)
}

// ------------------------------------------------------------------------------------------------
// Snapshot file
// ------------------------------------------------------------------------------------------------

/// Reads a snapshot file. `Ok(None)` when the file does not exist.
fn read_snapshot<V: TableValue>(path: &Path) -> Result<Option<BTreeMap<String, V>>, TableError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < 12 {
        return Err(TableError::ChecksumMismatch(path.display().to_string()));
    }
    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let mut hasher = Crc32::new();
    hasher.update(payload);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if hasher.finalize() != stored {
        return Err(TableError::ChecksumMismatch(path.display().to_string()));
    }

    if &payload[..4] != SNAP_MAGIC {
        return Err(TableError::Internal("bad table snapshot magic".into()));
    }
    let mut offset = 4;
    let (version, n) = u32::decode(&payload[offset..])?;
    offset += n;
    if version != FORMAT_VERSION {
        return Err(TableError::Internal(format!(
            "unsupported table snapshot version {version}"
        )));
    }
    let (count, n) = u32::decode(&payload[offset..])?;
    offset += n;

    let mut map = BTreeMap::new();
    for _ in 0..count {
        let (key, n) = String::decode(&payload[offset..])?;
        offset += n;
        let (value, n) = V::decode(&payload[offset..])?;
        offset += n;
        map.insert(key, value);
    }
    Ok(Some(map))
}

fn fsync_dir(dir: &Path) -> Result<(), TableError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
