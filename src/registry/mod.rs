//! # Snapshot Registry
//!
//! Owns every snapshot record and the volume/bucket namespace rows they hang
//! off. Enforces the lifecycle invariants:
//!
//! - a snapshot name is unique within its bucket while the snapshot lives;
//! - checkpoint content and metadata commit together — a checkpoint
//!   directory without a committed row is an orphan and is swept at open;
//! - ACTIVE → DELETED is the only transition, and physical removal of the
//!   checkpoint is deferred until the last in-flight read handle drops;
//! - a bucket cannot be deleted while it still holds an ACTIVE snapshot.
//!
//! A snapshot whose deletion is still pending (its checkpoint directory is
//! held open by a running diff) blocks reuse of its name; the stale row is
//! swept once the directory is gone — at open, or by the cleanup reaper.


use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, Decode, Encode};
use crate::store::{Checkpoint, LiveStore, LiveStoreError};
use crate::table::{Table, TableError};
use uuid::Uuid;

const NAMESPACE_TABLE: &str = "namespaces";
const SNAPSHOT_TABLE: &str = "snapshots";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by registry operations, following the service-wide
/// taxonomy: invalid arguments are rejected synchronously, lookups that miss
/// are `NotFound`, name and lifecycle collisions are `AlreadyExists` /
/// `Conflict`.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A required identifier was empty.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown volume, bucket, or snapshot.
    #[error("not found: {0}")]
    NotFound(String),

    /// The name is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation conflicts with live state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Metadata table failure.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Live store / checkpoint failure.
    #[error("store error: {0}")]
    Store(#[from] LiveStoreError),

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Rows
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a snapshot row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// Serving reads; checkpoint content is immutable.
    Active,
    /// Deletion requested; physical purge may still be pending.
    Deleted,
}

impl Encode for SnapshotState {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            SnapshotState::Active => 0u8.encode(buf),
            SnapshotState::Deleted => 1u8.encode(buf),
        }
    }
}

impl Decode for SnapshotState {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (tag, n) = u8::decode(buf)?;
        match tag {
            0 => Ok((SnapshotState::Active, n)),
            1 => Ok((SnapshotState::Deleted, n)),
            _ => Err(CodecError::InvalidTag {
                tag,
                type_name: "SnapshotState",
            }),
        }
    }
}

/// One snapshot's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    /// Globally unique snapshot id.
    pub id: String,
    /// Owning volume.
    pub volume: String,
    /// Owning bucket.
    pub bucket: String,
    /// Snapshot name, unique within the bucket while live.
    pub name: String,
    /// Creation time, unix millis.
    pub created_ms: u64,
    /// Checkpoint directory, relative to the snapshots root.
    pub checkpoint_dir: String,
    /// Lifecycle state.
    pub state: SnapshotState,
    /// Lineage cursor captured at creation.
    pub anchor: u64,
}

impl Encode for SnapshotRow {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.id.encode(buf)?;
        self.volume.encode(buf)?;
        self.bucket.encode(buf)?;
        self.name.encode(buf)?;
        self.created_ms.encode(buf)?;
        self.checkpoint_dir.encode(buf)?;
        self.state.encode(buf)?;
        self.anchor.encode(buf)?;
        Ok(())
    }
}

impl Decode for SnapshotRow {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut offset = 0;
        let (id, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (volume, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (bucket, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (name, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (created_ms, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (checkpoint_dir, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (state, n) = SnapshotState::decode(&buf[offset..])?;
        offset += n;
        let (anchor, n) = u64::decode(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                volume,
                bucket,
                name,
                created_ms,
                checkpoint_dir,
                state,
                anchor,
            },
            offset,
        ))
    }
}

/// A volume or bucket row. Buckets key as `volume/bucket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRow {
    /// Creation time, unix millis.
    pub created_ms: u64,
}

impl Encode for NamespaceRow {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.created_ms.encode(buf)
    }
}

impl Decode for NamespaceRow {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (created_ms, n) = u64::decode(buf)?;
        Ok((Self { created_ms }, n))
    }
}

/// Table key for a snapshot: `volume/bucket/name`.
pub fn snapshot_key(volume: &str, bucket: &str, name: &str) -> String {
    format!("{volume}/{bucket}/{name}")
}

fn bucket_key(volume: &str, bucket: &str) -> String {
    format!("{volume}/{bucket}")
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Registry
// ------------------------------------------------------------------------------------------------

/// The snapshot registry. One per store; owns the snapshot and namespace
/// tables and the cache of open checkpoint handles.
pub struct SnapshotRegistry {
    live: LiveStore,
    namespaces: Table<NamespaceRow>,
    snapshots: Table<SnapshotRow>,
    snapshots_dir: PathBuf,
    handles: Mutex<HashMap<String, Arc<Checkpoint>>>,
}

impl std::fmt::Debug for SnapshotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotRegistry").finish_non_exhaustive()
    }
}

impl SnapshotRegistry {
    /// Opens the registry: loads tables, sweeps orphan checkpoint
    /// directories, and clears deletion leftovers from a previous run.
    pub fn open(
        meta_dir: impl AsRef<Path>,
        snapshots_dir: impl AsRef<Path>,
        live: LiveStore,
    ) -> Result<Self, RegistryError> {
        let snapshots_dir = snapshots_dir.as_ref().to_path_buf();
        fs::create_dir_all(&snapshots_dir)?;

        let registry = Self {
            live,
            namespaces: Table::open(&meta_dir, NAMESPACE_TABLE)?,
            snapshots: Table::open(&meta_dir, SNAPSHOT_TABLE)?,
            snapshots_dir,
            handles: Mutex::new(HashMap::new()),
        };
        registry.sweep()?;
        Ok(registry)
    }

    fn handles_lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<Checkpoint>>>, RegistryError> {
        self.handles
            .lock()
            .map_err(|_| RegistryError::Internal("handle cache mutex poisoned".into()))
    }

    /// Removes (a) checkpoint directories no committed row points at, and
    /// (b) rows whose deferred deletion finished (DELETED with the directory
    /// already gone — or removable now, since a fresh process holds no read
    /// handles).
    fn sweep(&self) -> Result<(), RegistryError> {
        let rows = self.snapshots.entries()?;

        let mut referenced: HashMap<String, (String, SnapshotState)> = HashMap::new();
        for (key, row) in &rows {
            referenced.insert(row.checkpoint_dir.clone(), (key.clone(), row.state));
        }

        for entry in fs::read_dir(&self.snapshots_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            match referenced.get(&dir_name) {
                None => {
                    // Crash window between checkpoint creation and row
                    // commit, or a partially created checkpoint.
                    warn!(dir = %dir_name, "sweeping orphan checkpoint directory");
                    let _ = fs::remove_dir_all(entry.path());
                }
                Some((key, SnapshotState::Deleted)) => {
                    debug!(dir = %dir_name, "completing deferred snapshot deletion");
                    let _ = fs::remove_dir_all(entry.path());
                    self.snapshots.delete(key)?;
                }
                Some((_, SnapshotState::Active)) => {}
            }
        }

        // Deleted rows whose directory is already gone.
        for (key, row) in rows {
            if row.state == SnapshotState::Deleted
                && !self.snapshots_dir.join(&row.checkpoint_dir).exists()
            {
                self.snapshots.delete(&key)?;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Namespace operations
    // --------------------------------------------------------------------------------------------

    /// Creates a volume.
    pub fn create_volume(&self, volume: &str) -> Result<(), RegistryError> {
        if volume.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "volume name must not be empty".into(),
            ));
        }
        if self.namespaces.contains(volume)? {
            return Err(RegistryError::AlreadyExists(format!("volume {volume}")));
        }
        self.namespaces
            .put(volume, NamespaceRow { created_ms: now_ms() })?;
        info!(volume, "volume created");
        Ok(())
    }

    /// Creates a bucket inside an existing volume.
    pub fn create_bucket(&self, volume: &str, bucket: &str) -> Result<(), RegistryError> {
        if volume.is_empty() || bucket.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "volume and bucket names must not be empty".into(),
            ));
        }
        if !self.namespaces.contains(volume)? {
            return Err(RegistryError::NotFound(format!("volume {volume}")));
        }
        let key = bucket_key(volume, bucket);
        if self.namespaces.contains(&key)? {
            return Err(RegistryError::AlreadyExists(format!("bucket {key}")));
        }
        self.namespaces
            .put(&key, NamespaceRow { created_ms: now_ms() })?;
        info!(volume, bucket, "bucket created");
        Ok(())
    }

    /// Deletes a bucket. Fails with `Conflict` while any ACTIVE snapshot
    /// exists under it.
    pub fn delete_bucket(&self, volume: &str, bucket: &str) -> Result<(), RegistryError> {
        if volume.is_empty() || bucket.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "volume and bucket names must not be empty".into(),
            ));
        }
        let key = bucket_key(volume, bucket);
        if !self.namespaces.contains(&key)? {
            return Err(RegistryError::NotFound(format!("bucket {key}")));
        }
        let live_snapshots = self
            .snapshots
            .scan_prefix(&format!("{key}/"))?
            .into_iter()
            .filter(|(_, row)| row.state == SnapshotState::Active)
            .count();
        if live_snapshots > 0 {
            return Err(RegistryError::Conflict(format!(
                "bucket {key} contains {live_snapshots} snapshot(s)"
            )));
        }
        self.namespaces.delete(&key)?;
        info!(volume, bucket, "bucket deleted");
        Ok(())
    }

    /// True when both the volume and the bucket exist.
    pub fn namespace_exists(&self, volume: &str, bucket: &str) -> Result<bool, RegistryError> {
        Ok(self.namespaces.contains(volume)?
            && self.namespaces.contains(&bucket_key(volume, bucket))?)
    }

    // --------------------------------------------------------------------------------------------
    // Snapshot operations
    // --------------------------------------------------------------------------------------------

    fn validate_identifiers(
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<(), RegistryError> {
        if volume.is_empty() || bucket.is_empty() || name.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "volume, bucket, and snapshot name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Creates a snapshot of the bucket's current state.
    ///
    /// The checkpoint directory is written first; the metadata row commits
    /// after it. A crash in between leaves an orphan directory that the next
    /// open sweeps — never a row without content.
    pub fn create_snapshot(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<SnapshotRow, RegistryError> {
        Self::validate_identifiers(volume, bucket, name)?;
        if !self.namespace_exists(volume, bucket)? {
            return Err(RegistryError::NotFound(format!(
                "volume {volume} or bucket {bucket}"
            )));
        }

        let key = snapshot_key(volume, bucket, name);
        match self.snapshots.get(&key)? {
            Some(row) if row.state == SnapshotState::Active => {
                return Err(RegistryError::AlreadyExists(format!("snapshot {key}")));
            }
            Some(_) => {
                return Err(RegistryError::Conflict(format!(
                    "snapshot {key} is pending deletion"
                )));
            }
            None => {}
        }

        let id = Uuid::new_v4().to_string();
        let dir = self.snapshots_dir.join(&id);
        let anchor = match self.live.checkpoint(&dir) {
            Ok(anchor) => anchor,
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e.into());
            }
        };

        let row = SnapshotRow {
            id: id.clone(),
            volume: volume.to_string(),
            bucket: bucket.to_string(),
            name: name.to_string(),
            created_ms: now_ms(),
            checkpoint_dir: id,
            state: SnapshotState::Active,
            anchor,
        };
        self.snapshots.put(&key, row.clone())?;

        info!(volume, bucket, name, id = %row.id, "snapshot created");
        Ok(row)
    }

    /// Marks a snapshot DELETED. The checkpoint directory is removed now if
    /// no read handle is outstanding, otherwise when the last one drops.
    pub fn delete_snapshot(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<(), RegistryError> {
        Self::validate_identifiers(volume, bucket, name)?;
        if !self.namespace_exists(volume, bucket)? {
            return Err(RegistryError::NotFound(format!(
                "volume {volume} or bucket {bucket}"
            )));
        }

        let key = snapshot_key(volume, bucket, name);
        let row = match self.snapshots.get(&key)? {
            Some(row) if row.state == SnapshotState::Active => row,
            _ => return Err(RegistryError::NotFound(format!("snapshot {key}"))),
        };

        let handle = self.handles_lock()?.remove(&row.id);
        match handle {
            Some(checkpoint) => {
                checkpoint.purge_on_drop();
                let deferred = Arc::strong_count(&checkpoint) > 1;
                drop(checkpoint);
                if deferred {
                    // A diff still reads the checkpoint; keep the tombstoned
                    // row so the name stays blocked until the purge lands.
                    let mut deleted = row;
                    deleted.state = SnapshotState::Deleted;
                    self.snapshots.put(&key, deleted)?;
                    debug!(key, "snapshot deletion deferred to open read handles");
                } else {
                    self.snapshots.delete(&key)?;
                }
            }
            None => {
                let dir = self.snapshots_dir.join(&row.checkpoint_dir);
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                self.snapshots.delete(&key)?;
            }
        }

        info!(volume, bucket, name, "snapshot deleted");
        Ok(())
    }

    /// Resolves an ACTIVE snapshot by identity.
    pub fn get(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<SnapshotRow, RegistryError> {
        Self::validate_identifiers(volume, bucket, name)?;
        let key = snapshot_key(volume, bucket, name);
        match self.snapshots.get(&key)? {
            Some(row) if row.state == SnapshotState::Active => Ok(row),
            _ => Err(RegistryError::NotFound(format!("snapshot {key}"))),
        }
    }

    /// Lists ACTIVE snapshots in a bucket, name-ordered. An empty bucket
    /// yields an empty list.
    pub fn list(&self, volume: &str, bucket: &str) -> Result<Vec<SnapshotRow>, RegistryError> {
        if volume.is_empty() || bucket.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "volume and bucket names must not be empty".into(),
            ));
        }
        if !self.namespace_exists(volume, bucket)? {
            return Err(RegistryError::NotFound(format!(
                "volume {volume} or bucket {bucket}"
            )));
        }
        Ok(self
            .snapshots
            .scan_prefix(&format!("{}/", bucket_key(volume, bucket)))?
            .into_iter()
            .filter(|(_, row)| row.state == SnapshotState::Active)
            .map(|(_, row)| row)
            .collect())
    }

    /// Looks up an ACTIVE snapshot row by its id.
    pub fn find_by_id(&self, id: &str) -> Result<Option<SnapshotRow>, RegistryError> {
        Ok(self
            .snapshots
            .entries()?
            .into_iter()
            .map(|(_, row)| row)
            .find(|row| row.id == id && row.state == SnapshotState::Active))
    }

    /// Opens (or returns the cached) read handle for a snapshot's
    /// checkpoint. Clones of the returned `Arc` defer physical deletion.
    pub fn checkpoint_handle(&self, row: &SnapshotRow) -> Result<Arc<Checkpoint>, RegistryError> {
        let mut handles = self.handles_lock()?;
        if let Some(handle) = handles.get(&row.id) {
            return Ok(Arc::clone(handle));
        }
        let checkpoint = Checkpoint::open(self.snapshots_dir.join(&row.checkpoint_dir))?;
        let handle = Arc::new(checkpoint);
        handles.insert(row.id.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Oldest lineage anchor among ACTIVE snapshots — the eviction gate for
    /// lineage history. `None` when no snapshot lives.
    pub fn oldest_live_anchor(&self) -> Result<Option<u64>, RegistryError> {
        Ok(self
            .snapshots
            .entries()?
            .into_iter()
            .filter(|(_, row)| row.state == SnapshotState::Active)
            .map(|(_, row)| row.anchor)
            .min())
    }

    /// Reaper hook: finishes deferred deletions whose read handles are gone
    /// (directory already purged) by clearing the leftover rows.
    pub fn sweep_deleted_rows(&self) -> Result<usize, RegistryError> {
        let mut cleared = 0;
        for (key, row) in self.snapshots.entries()? {
            if row.state == SnapshotState::Deleted
                && !self.snapshots_dir.join(&row.checkpoint_dir).exists()
            {
                self.snapshots.delete(&key)?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Number of rows in the snapshot table, pending deletions included
    /// (read-only introspection).
    pub fn row_count(&self) -> Result<usize, RegistryError> {
        Ok(self.snapshots.len()?)
    }

    /// True when a snapshot id refers to an ACTIVE row (used by the reaper's
    /// orphan-job check).
    pub fn is_active_id(&self, id: &str) -> Result<bool, RegistryError> {
        Ok(self.find_by_id(id)?.is_some())
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(e: std::io::Error) -> Self {
        RegistryError::Store(LiveStoreError::Io(e))
    }
}
