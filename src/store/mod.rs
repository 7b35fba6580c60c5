//! # Live Segment Store & Checkpoints
//!
//! The mutable, log-structured store whose state gets checkpointed and
//! diffed. It is deliberately small: an in-memory write buffer, flush to
//! immutable segment files, a single full-merge compaction, and atomic
//! checkpoint creation. Every flush and compaction is reported synchronously
//! to the [`LineageTracker`] the store owns.
//!
//! ## Checkpoints
//!
//! [`LiveStore::checkpoint`] freezes the current durable state into a
//! directory: the write buffer is flushed, every live segment file is
//! hard-linked (copied when linking fails) into the target, and a manifest
//! naming the segment set, the lineage anchor, and the compaction-disabled
//! flag is written last via temp-file + rename. A directory without a
//! manifest is not a checkpoint — partially created ones are invisible.
//!
//! [`Checkpoint`] is the read-only view: point lookups and merged range
//! scans over the frozen segment set. Checkpoints never compact and never
//! feed events to the lineage tracker. Dropping the last handle to a
//! checkpoint marked for purge removes its directory — that is what defers
//! snapshot deletion past in-flight diff reads.

#[cfg(test)]
mod tests;

pub mod merge;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, Decode, Encode};
use crate::lineage::{LineageError, LineageTracker};
use crate::segment::{Segment, SegmentEntry, SegmentError, SegmentId, SegmentMeta, SegmentWriter};
use self::merge::{LiveEntries, MergedEntries};

const SEGMENT_FILE_EXT: &str = "seg";
const CHECKPOINT_MANIFEST: &str = "CHECKPOINT";
const MANIFEST_MAGIC: &[u8; 4] = b"VCKP";
const MANIFEST_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by live store and checkpoint operations.
#[derive(Debug, Error)]
pub enum LiveStoreError {
    /// Underlying filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment read or write failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Lineage tracker failure.
    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),

    /// Encoding or decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Structurally invalid checkpoint.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Live store
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Buffered {
    value: Option<Vec<u8>>,
    lsn: u64,
}

struct LiveStoreInner {
    dir: PathBuf,
    buffer: BTreeMap<Vec<u8>, Buffered>,
    buffer_bytes: usize,
    segments: Vec<Arc<Segment>>,
    next_lsn: u64,
    next_segment_id: SegmentId,
}

/// The live, mutable, log-structured key-value store.
///
/// Thread-safe; clone freely — clones share state.
pub struct LiveStore {
    inner: Arc<RwLock<LiveStoreInner>>,
    lineage: Arc<LineageTracker>,
    write_buffer_size: usize,
}

impl Clone for LiveStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lineage: Arc::clone(&self.lineage),
            write_buffer_size: self.write_buffer_size,
        }
    }
}

impl std::fmt::Debug for LiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStore").finish_non_exhaustive()
    }
}

impl LiveStore {
    /// Opens (or creates) the store rooted at `dir`, reloading any segment
    /// files already present.
    pub fn open(dir: impl AsRef<Path>, write_buffer_size: usize) -> Result<Self, LiveStoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lineage = Arc::new(LineageTracker::new());
        let mut segments = Vec::new();
        let mut next_segment_id = 1u64;
        let mut next_lsn = 1u64;

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(SEGMENT_FILE_EXT))
            .collect();
        paths.sort();

        for path in paths {
            let segment = Segment::open(&path)?;
            next_segment_id = next_segment_id.max(segment.id() + 1);
            next_lsn = next_lsn.max(segment.max_lsn() + 1);
            // Reloaded segments are flush-equivalent births for the fresh
            // tracker: their pre-restart history is gone either way.
            lineage.record_flush(segment.meta())?;
            segments.push(Arc::new(segment));
        }

        info!(
            path = %dir.display(),
            segments = segments.len(),
            "live store opened"
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(LiveStoreInner {
                dir,
                buffer: BTreeMap::new(),
                buffer_bytes: 0,
                segments,
                next_lsn,
                next_segment_id,
            })),
            lineage,
            write_buffer_size,
        })
    }

    /// The lineage tracker owned by this store.
    pub fn lineage(&self) -> &Arc<LineageTracker> {
        &self.lineage
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, LiveStoreInner>, LiveStoreError> {
        self.inner
            .read()
            .map_err(|_| LiveStoreError::Internal("store lock poisoned".into()))
    }

    fn write_lock(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, LiveStoreInner>, LiveStoreError> {
        self.inner
            .write()
            .map_err(|_| LiveStoreError::Internal("store lock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), LiveStoreError> {
        let mut inner = self.write_lock()?;
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        inner.buffer_bytes += key.len() + value.len();
        inner.buffer.insert(
            key,
            Buffered {
                value: Some(value),
                lsn,
            },
        );
        let full = inner.buffer_bytes >= self.write_buffer_size;
        drop(inner);
        if full {
            self.flush()?;
        }
        Ok(())
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), LiveStoreError> {
        let mut inner = self.write_lock()?;
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        inner.buffer_bytes += key.len();
        inner.buffer.insert(key, Buffered { value: None, lsn });
        Ok(())
    }

    /// Moves the value of `old_key` to `new_key` in one batch: the value is
    /// rewritten under the new key and the old key is tombstoned.
    ///
    /// Returns `false` when `old_key` has no live value.
    pub fn rename(&self, old_key: Vec<u8>, new_key: Vec<u8>) -> Result<bool, LiveStoreError> {
        let Some(value) = self.get(&old_key)? else {
            return Ok(false);
        };
        let mut inner = self.write_lock()?;
        let put_lsn = inner.next_lsn;
        let del_lsn = inner.next_lsn + 1;
        inner.next_lsn += 2;
        inner.buffer_bytes += new_key.len() + value.len() + old_key.len();
        inner.buffer.insert(
            new_key,
            Buffered {
                value: Some(value),
                lsn: put_lsn,
            },
        );
        inner
            .buffer
            .insert(old_key, Buffered { value: None, lsn: del_lsn });
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Returns the live value for `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, LiveStoreError> {
        let inner = self.read_lock()?;
        if let Some(buffered) = inner.buffer.get(key) {
            return Ok(buffered.value.clone());
        }
        let mut best: Option<SegmentEntry> = None;
        for segment in &inner.segments {
            if let Some(entry) = segment.get(key)? {
                if best.as_ref().is_none_or(|b| entry.lsn > b.lsn) {
                    best = Some(entry);
                }
            }
        }
        Ok(best.and_then(|e| e.value))
    }

    /// Number of live segment files (read-only introspection).
    pub fn segment_count(&self) -> Result<usize, LiveStoreError> {
        Ok(self.read_lock()?.segments.len())
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Writes the buffer to a new segment file and registers its birth with
    /// the lineage tracker. Returns `false` when the buffer was empty.
    pub fn flush(&self) -> Result<bool, LiveStoreError> {
        let mut inner = self.write_lock()?;
        if inner.buffer.is_empty() {
            return Ok(false);
        }

        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        let path = segment_path(&inner.dir, id);

        let entries: Vec<SegmentEntry> = inner
            .buffer
            .iter()
            .map(|(key, buffered)| SegmentEntry {
                key: key.clone(),
                value: buffered.value.clone(),
                lsn: buffered.lsn,
            })
            .collect();
        let count = entries.len();
        let meta = SegmentWriter::new(&path, id).build(entries.into_iter(), count)?;

        self.lineage.record_flush(meta)?;
        inner.segments.push(Arc::new(Segment::open(&path)?));
        inner.buffer.clear();
        inner.buffer_bytes = 0;

        debug!(id, entries = count, "flushed write buffer");
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Merges all live segments into one, dropping superseded versions and
    /// spent tombstones, and records the lineage event. Returns `false`
    /// when fewer than two segments exist.
    pub fn compact(&self) -> Result<bool, LiveStoreError> {
        let mut inner = self.write_lock()?;
        if inner.segments.len() < 2 {
            return Ok(false);
        }

        let input_ids: Vec<SegmentId> = inner.segments.iter().map(|s| s.id()).collect();
        let sources: Vec<Box<dyn Iterator<Item = SegmentEntry> + '_>> = inner
            .segments
            .iter()
            .map(|s| Box::new(s.iter()) as Box<dyn Iterator<Item = SegmentEntry> + '_>)
            .collect();
        // Full merge: the whole segment set participates, so nothing can
        // resurrect — tombstones are spent and dropped.
        let survivors: Vec<SegmentEntry> = MergedEntries::new(sources)
            .filter(|e| !e.is_tombstone())
            .collect();

        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        let path = segment_path(&inner.dir, id);
        let count = survivors.len();
        let meta = SegmentWriter::new(&path, id).build(survivors.into_iter(), count)?;

        self.lineage.record_compaction(&input_ids, vec![meta])?;

        let dir = inner.dir.clone();
        inner.segments.clear();
        inner.segments.push(Arc::new(Segment::open(&path)?));
        drop(inner);

        for old_id in &input_ids {
            let old_path = segment_path(&dir, *old_id);
            if let Err(e) = fs::remove_file(&old_path) {
                warn!(id = old_id, %e, "failed to remove compacted segment file");
            }
        }

        info!(output = id, inputs = ?input_ids, "compaction complete");
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoints
    // --------------------------------------------------------------------------------------------

    /// Freezes the current durable state into `target`: flushes the buffer,
    /// links every live segment file into the directory, and commits the
    /// checkpoint by writing its manifest last. Returns the lineage anchor
    /// captured for the checkpoint.
    pub fn checkpoint(&self, target: impl AsRef<Path>) -> Result<u64, LiveStoreError> {
        self.flush()?;

        let target = target.as_ref();
        fs::create_dir_all(target)?;

        let inner = self.read_lock()?;
        let mut metas = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            let id = segment.id();
            let src = segment_path(&inner.dir, id);
            let dst = segment_path(target, id);
            // Hard links share the immutable file; fall back to a copy on
            // filesystems that refuse them.
            if fs::hard_link(&src, &dst).is_err() {
                fs::copy(&src, &dst)?;
            }
            metas.push(segment.meta());
        }
        let anchor = self.lineage.cursor()?;
        drop(inner);

        write_checkpoint_manifest(target, anchor, &metas)?;

        info!(
            path = %target.display(),
            segments = metas.len(),
            anchor,
            "checkpoint created"
        );
        Ok(anchor)
    }
}

fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id:06}.{SEGMENT_FILE_EXT}"))
}

// ------------------------------------------------------------------------------------------------
// Checkpoint manifest
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct CheckpointManifest {
    anchor: u64,
    compaction_disabled: bool,
    segments: Vec<SegmentMeta>,
}

impl Encode for CheckpointManifest {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.anchor.encode(buf)?;
        self.compaction_disabled.encode(buf)?;
        codec::encode_seq(&self.segments, buf)?;
        Ok(())
    }
}

impl Decode for CheckpointManifest {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut offset = 0;
        let (anchor, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (compaction_disabled, n) = bool::decode(&buf[offset..])?;
        offset += n;
        let (segments, n) = codec::decode_seq::<SegmentMeta>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                anchor,
                compaction_disabled,
                segments,
            },
            offset,
        ))
    }
}

fn write_checkpoint_manifest(
    dir: &Path,
    anchor: u64,
    segments: &[SegmentMeta],
) -> Result<(), LiveStoreError> {
    let manifest = CheckpointManifest {
        anchor,
        // Checkpoints are immutable by construction; recorded explicitly so
        // readers can verify the contract.
        compaction_disabled: true,
        segments: segments.to_vec(),
    };

    let mut payload = Vec::new();
    payload.extend_from_slice(MANIFEST_MAGIC);
    MANIFEST_VERSION.encode(&mut payload)?;
    manifest.encode(&mut payload)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    payload.extend_from_slice(&hasher.finalize().to_le_bytes());

    let tmp = dir.join(format!("{CHECKPOINT_MANIFEST}.tmp"));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&payload)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, dir.join(CHECKPOINT_MANIFEST))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn read_checkpoint_manifest(dir: &Path) -> Result<CheckpointManifest, LiveStoreError> {
    let path = dir.join(CHECKPOINT_MANIFEST);
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;

    if bytes.len() < 12 {
        return Err(LiveStoreError::InvalidCheckpoint(format!(
            "{}: manifest too short",
            dir.display()
        )));
    }
    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if hasher.finalize() != stored {
        return Err(LiveStoreError::InvalidCheckpoint(format!(
            "{}: manifest checksum mismatch",
            dir.display()
        )));
    }
    if &payload[..4] != MANIFEST_MAGIC {
        return Err(LiveStoreError::InvalidCheckpoint(format!(
            "{}: bad manifest magic",
            dir.display()
        )));
    }
    let mut offset = 4;
    let (version, n) = u32::decode(&payload[offset..])?;
    offset += n;
    if version != MANIFEST_VERSION {
        return Err(LiveStoreError::InvalidCheckpoint(format!(
            "{}: unsupported manifest version {version}",
            dir.display()
        )));
    }
    let (manifest, _) = CheckpointManifest::decode(&payload[offset..])?;
    Ok(manifest)
}

/// True when `dir` holds a committed checkpoint (its manifest exists).
pub fn is_checkpoint_dir(dir: &Path) -> bool {
    dir.join(CHECKPOINT_MANIFEST).is_file()
}

// ------------------------------------------------------------------------------------------------
// Checkpoint view
// ------------------------------------------------------------------------------------------------

/// A read-only, point-in-time view over a checkpoint directory.
///
/// Cheap to share (`Arc` internally via the caller); holding a handle defers
/// physical deletion of a snapshot marked for purge.
pub struct Checkpoint {
    dir: PathBuf,
    segments: Vec<Arc<Segment>>,
    manifest: CheckpointManifest,
    purge_on_drop: AtomicBool,
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("dir", &self.dir)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}

impl Checkpoint {
    /// Opens a committed checkpoint directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LiveStoreError> {
        let dir = dir.as_ref().to_path_buf();
        let manifest = read_checkpoint_manifest(&dir)?;

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for meta in &manifest.segments {
            let segment = Segment::open(segment_path(&dir, meta.id))?;
            segments.push(Arc::new(segment));
        }

        Ok(Self {
            dir,
            segments,
            manifest,
            purge_on_drop: AtomicBool::new(false),
        })
    }

    /// Lineage cursor captured when the checkpoint was created.
    pub fn lineage_anchor(&self) -> u64 {
        self.manifest.anchor
    }

    /// Always true: checkpoints never compact.
    pub fn compaction_disabled(&self) -> bool {
        self.manifest.compaction_disabled
    }

    /// The checkpoint's segment id set.
    pub fn segment_ids(&self) -> BTreeSet<SegmentId> {
        self.segments.iter().map(|s| s.id()).collect()
    }

    /// The frozen segments themselves.
    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    /// Resolved point lookup: live value or `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, LiveStoreError> {
        let mut best: Option<SegmentEntry> = None;
        for segment in &self.segments {
            if let Some(entry) = segment.get(key)? {
                if best.as_ref().is_none_or(|b| entry.lsn > b.lsn) {
                    best = Some(entry);
                }
            }
        }
        Ok(best.and_then(|e| e.value))
    }

    /// Merged, tombstone-free iterator over live `(key, value)` pairs in
    /// `[start, end)`.
    pub fn iter_range(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<LiveEntries<'_>, LiveStoreError> {
        let mut sources: Vec<Box<dyn Iterator<Item = SegmentEntry> + '_>> =
            Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            sources.push(Box::new(segment.scan(start, end)?));
        }
        Ok(LiveEntries::new(MergedEntries::new(sources)))
    }

    /// Marks the backing directory for removal once the last handle drops.
    pub fn purge_on_drop(&self) {
        self.purge_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for Checkpoint {
    fn drop(&mut self) {
        if self.purge_on_drop.load(Ordering::Acquire) {
            // Unmap before unlinking.
            self.segments.clear();
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!(dir = %self.dir.display(), %e, "failed to purge checkpoint directory");
            } else {
                debug!(dir = %self.dir.display(), "checkpoint directory purged");
            }
        }
    }
}
