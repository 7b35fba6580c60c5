//! # VantageDB
//!
//! Point-in-time, read-only **snapshots** of a log-structured key-value
//! store, and an engine that computes the key-level changes between any two
//! snapshots without re-scanning the full keyspace.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vantagedb::{Store, StoreConfig, JobStatus};
//!
//! let store = Store::open("/tmp/my_store", StoreConfig::default()).unwrap();
//!
//! store.create_volume("vol").unwrap();
//! store.create_bucket("vol", "buck").unwrap();
//!
//! store.put_key("vol", "buck", "key-1", b"hello").unwrap();
//! store.create_snapshot("vol", "buck", "before").unwrap();
//!
//! store.put_key("vol", "buck", "key-2", b"world").unwrap();
//! store.create_snapshot("vol", "buck", "after").unwrap();
//!
//! // Submit the diff job and poll until it finishes.
//! let report = loop {
//!     let response = store
//!         .snapshot_diff("vol", "buck", "before", "after", None, 0, false, false)
//!         .unwrap();
//!     match response.status {
//!         JobStatus::Done => break response.report.unwrap(),
//!         _ => std::thread::sleep(std::time::Duration::from_millis(response.wait_time_ms)),
//!     }
//! };
//! assert_eq!(report.entries.len(), 1); // CREATE key-2
//!
//! store.close().unwrap();
//! ```
//!
//! ## Architecture
//!
//! - **Live store** — write buffer, immutable sorted segment files,
//!   full-merge compaction.
//! - **Lineage tracker** — append-only DAG of compaction events, used to
//!   restrict a diff to the segments that actually changed.
//! - **Snapshot registry** — snapshot identity, immutability, and
//!   deletion-ordering invariants.
//! - **Diff engine** — persisted, crash-recoverable diff jobs with
//!   cancellation and stable pagination.
//! - **Cleanup reaper** — retires terminal jobs into a purge table.

#![allow(dead_code)]

pub(crate) mod codec;
pub(crate) mod diff;
pub(crate) mod lineage;
pub(crate) mod reaper;
pub(crate) mod registry;
pub(crate) mod segment;
pub(crate) mod store;
pub(crate) mod table;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use thiserror::Error;
use tracing::info;

use diff::{DiffConfig, DiffEngine, DiffError};
use lineage::LineageError;
use reaper::{CleanupReaper, ReaperError};
use registry::{RegistryError, SnapshotRegistry};
use store::{LiveStore, LiveStoreError};
use table::TableError;

pub use diff::{
    CancelResult, DiffEntry, DiffJobRow, DiffReportPage, DiffResponse, DiffType, JobStatus,
};
pub use registry::{SnapshotRow, SnapshotState};

/// On-disk layout version written by this build.
pub const CURRENT_LAYOUT_VERSION: u32 = 2;

/// Minimum layout version the snapshot subsystem requires.
pub const SNAPSHOT_LAYOUT_VERSION: u32 = 2;

const LAYOUT_FILE: &str = "LAYOUT";
const LIVE_DIR: &str = "live";
const META_DIR: &str = "meta";
const SNAPSHOTS_DIR: &str = "snapshots";

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance.
///
/// All fields have sensible defaults via [`StoreConfig::default()`]; the
/// configuration is validated by [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum size of the in-memory write buffer in bytes before an
    /// automatic flush. Default: 256 KiB. Must be ≥ 1024.
    pub write_buffer_size: usize,

    /// Worker threads computing snapshot diffs — the cap on concurrently
    /// running jobs. Default: 2. Must be ≥ 1.
    pub diff_pool_size: usize,

    /// Poll delay (ms) suggested to callers while a diff job is QUEUED or
    /// IN_PROGRESS. Default: 200.
    pub diff_wait_time_ms: u64,

    /// Grace period (ms) before the reaper retires DONE/FAILED jobs.
    /// Default: 24 hours.
    pub job_retention_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 256 * 1024,
            diff_pool_size: 2,
            diff_wait_time_ms: 200,
            job_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), StoreError> {
        if self.write_buffer_size < 1024 {
            return Err(StoreError::InvalidConfig(
                "write_buffer_size must be >= 1024".into(),
            ));
        }
        if self.diff_pool_size < 1 {
            return Err(StoreError::InvalidConfig(
                "diff_pool_size must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
///
/// The taxonomy variants (`InvalidArgument`, `NotFound`, `AlreadyExists`,
/// `Conflict`, `NotReady`) let callers match on the condition without
/// knowing which subsystem raised it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A required identifier was empty or a parameter was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown volume, bucket, snapshot, job, or pagination token.
    #[error("not found: {0}")]
    NotFound(String),

    /// The name is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation conflicts with live state (e.g. deleting a bucket that
    /// still holds a snapshot).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The snapshot subsystem is gated behind a layout upgrade that has not
    /// completed. Distinct from [`StoreError::NotFound`]: the resource may
    /// exist once the store is finalized.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Metadata table failure.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Live store, segment, or checkpoint failure.
    #[error("storage error: {0}")]
    Storage(#[from] LiveStoreError),

    /// Lineage tracker failure.
    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for StoreError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidArgument(m) => StoreError::InvalidArgument(m),
            RegistryError::NotFound(m) => StoreError::NotFound(m),
            RegistryError::AlreadyExists(m) => StoreError::AlreadyExists(m),
            RegistryError::Conflict(m) => StoreError::Conflict(m),
            RegistryError::Table(e) => StoreError::Table(e),
            RegistryError::Store(e) => StoreError::Storage(e),
            RegistryError::Internal(m) => StoreError::Internal(m),
        }
    }
}

impl From<DiffError> for StoreError {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::InvalidArgument(m) => StoreError::InvalidArgument(m),
            DiffError::NotFound(m) => StoreError::NotFound(m),
            DiffError::Table(e) => StoreError::Table(e),
            DiffError::Store(e) => StoreError::Storage(e),
            DiffError::Lineage(e) => StoreError::Lineage(e),
            DiffError::Internal(m) => StoreError::Internal(m),
        }
    }
}

impl From<ReaperError> for StoreError {
    fn from(e: ReaperError) -> Self {
        match e {
            ReaperError::Table(e) => StoreError::Table(e),
            ReaperError::Registry(e) => e.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(LiveStoreError::Io(e))
    }
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle: the live key-value store plus its snapshot,
/// diff, and cleanup subsystems.
///
/// # Thread safety
///
/// `Store` is `Send + Sync` — share it across threads via `Arc<Store>`.
/// Diff computations run on an internal bounded worker pool; submission and
/// polling never block on them.
///
/// # Shutdown
///
/// [`Store::close`] drains in-flight diff computations and joins the pool.
/// Dropping the handle without closing performs the same cleanup with
/// errors ignored.
pub struct Store {
    live: LiveStore,
    registry: Arc<SnapshotRegistry>,
    diff: DiffEngine,
    reaper: CleanupReaper,
    layout_version: AtomicU32,
    root: PathBuf,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store at the given directory.
    ///
    /// On an existing directory the metadata tables are recovered, orphan
    /// checkpoints are swept, and diff jobs interrupted mid-computation are
    /// discarded per the crash-recovery contract.
    pub fn open(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let layout_version = read_or_init_layout(&root)?;

        let live = LiveStore::open(root.join(LIVE_DIR), config.write_buffer_size)?;
        let registry = Arc::new(SnapshotRegistry::open(
            root.join(META_DIR),
            root.join(SNAPSHOTS_DIR),
            live.clone(),
        )?);
        let diff = DiffEngine::open(
            root.join(META_DIR),
            Arc::clone(&registry),
            Arc::clone(live.lineage()),
            DiffConfig {
                pool_size: config.diff_pool_size,
                wait_time_ms: config.diff_wait_time_ms,
            },
        )?;
        let reaper = CleanupReaper::open(
            root.join(META_DIR),
            diff.jobs_table(),
            diff.reports_table(),
            Arc::clone(&registry),
            config.job_retention_ms,
        )?;

        info!(path = %root.display(), layout_version, "store opened");
        Ok(Self {
            live,
            registry,
            diff,
            reaper,
            layout_version: AtomicU32::new(layout_version),
            root,
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down: drains diff computations and joins the pool.
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.diff.close();
        info!("store closed");
        Ok(())
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Snapshot and diff features require the current layout; a store
    /// written by an older build must be finalized first.
    fn check_snapshot_ready(&self) -> Result<(), StoreError> {
        let version = self.layout_version.load(Ordering::Acquire);
        if version < SNAPSHOT_LAYOUT_VERSION {
            return Err(StoreError::NotReady(format!(
                "snapshot feature requires layout version {SNAPSHOT_LAYOUT_VERSION}, \
                 store is at {version}; run finalize_layout()"
            )));
        }
        Ok(())
    }

    /// Upgrades the on-disk layout to the current version, unlocking the
    /// snapshot subsystem on stores created by older builds.
    pub fn finalize_layout(&self) -> Result<(), StoreError> {
        self.check_open()?;
        write_layout(&self.root, CURRENT_LAYOUT_VERSION)?;
        self.layout_version
            .store(CURRENT_LAYOUT_VERSION, Ordering::Release);
        info!(version = CURRENT_LAYOUT_VERSION, "layout finalized");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Namespace operations
    // --------------------------------------------------------------------------------------------

    /// Creates a volume.
    pub fn create_volume(&self, volume: &str) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.registry.create_volume(volume)?)
    }

    /// Creates a bucket inside an existing volume.
    pub fn create_bucket(&self, volume: &str, bucket: &str) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.registry.create_bucket(volume, bucket)?)
    }

    /// Deletes a bucket. Fails with [`StoreError::Conflict`] while any
    /// ACTIVE snapshot exists under it.
    pub fn delete_bucket(&self, volume: &str, bucket: &str) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.registry.delete_bucket(volume, bucket)?)
    }

    // --------------------------------------------------------------------------------------------
    // Key operations
    // --------------------------------------------------------------------------------------------

    fn composite_key(
        &self,
        volume: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<u8>, StoreError> {
        if volume.is_empty() || bucket.is_empty() || key.is_empty() {
            return Err(StoreError::InvalidArgument(
                "volume, bucket, and key must not be empty".into(),
            ));
        }
        if !self.registry.namespace_exists(volume, bucket)? {
            return Err(StoreError::NotFound(format!(
                "volume {volume} or bucket {bucket}"
            )));
        }
        Ok(format!("{volume}/{bucket}/{key}").into_bytes())
    }

    /// Writes a key into a bucket.
    pub fn put_key(
        &self,
        volume: &str,
        bucket: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        self.check_open()?;
        if value.is_empty() {
            return Err(StoreError::InvalidArgument("value must not be empty".into()));
        }
        let composite = self.composite_key(volume, bucket, key)?;
        self.live.put(composite, value.to_vec())?;
        Ok(())
    }

    /// Deletes a key from a bucket.
    pub fn delete_key(&self, volume: &str, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let composite = self.composite_key(volume, bucket, key)?;
        self.live.delete(composite)?;
        Ok(())
    }

    /// Renames a key, preserving its content.
    pub fn rename_key(
        &self,
        volume: &str,
        bucket: &str,
        key: &str,
        new_key: &str,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let old = self.composite_key(volume, bucket, key)?;
        let new = self.composite_key(volume, bucket, new_key)?;
        if !self.live.rename(old, new)? {
            return Err(StoreError::NotFound(format!(
                "key {volume}/{bucket}/{key}"
            )));
        }
        Ok(())
    }

    /// Reads a key's live value.
    pub fn get_key(
        &self,
        volume: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        let composite = self.composite_key(volume, bucket, key)?;
        Ok(self.live.get(&composite)?)
    }

    /// Flushes the write buffer to a segment file.
    pub fn flush(&self) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.live.flush()?)
    }

    /// Merges all live segments into one.
    pub fn compact(&self) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.live.compact()?)
    }

    // --------------------------------------------------------------------------------------------
    // Snapshot operations
    // --------------------------------------------------------------------------------------------

    /// Creates a snapshot of the bucket's current state.
    pub fn create_snapshot(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<SnapshotRow, StoreError> {
        self.check_open()?;
        self.check_snapshot_ready()?;
        Ok(self.registry.create_snapshot(volume, bucket, name)?)
    }

    /// Deletes a snapshot and releases lineage history no live snapshot
    /// anchors anymore.
    pub fn delete_snapshot(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        self.check_snapshot_ready()?;
        self.registry.delete_snapshot(volume, bucket, name)?;

        let evict_below = match self.registry.oldest_live_anchor()? {
            Some(anchor) => anchor,
            None => self.live.lineage().cursor()?,
        };
        self.live.lineage().evict_up_to(evict_below)?;
        Ok(())
    }

    /// Lists a bucket's ACTIVE snapshots in name order.
    pub fn list_snapshots(
        &self,
        volume: &str,
        bucket: &str,
    ) -> Result<Vec<SnapshotRow>, StoreError> {
        self.check_open()?;
        self.check_snapshot_ready()?;
        Ok(self.registry.list(volume, bucket)?)
    }

    /// Fetches one ACTIVE snapshot's metadata.
    pub fn get_snapshot(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<SnapshotRow, StoreError> {
        self.check_open()?;
        self.check_snapshot_ready()?;
        Ok(self.registry.get(volume, bucket, name)?)
    }

    // --------------------------------------------------------------------------------------------
    // Diff operations
    // --------------------------------------------------------------------------------------------

    /// Submits, polls, cancels, or pages through a snapshot diff.
    ///
    /// The job state machine: QUEUED → IN_PROGRESS → {DONE, FAILED}, with a
    /// cooperative QUEUED|IN_PROGRESS → CANCELLED transition. `(from, to)`
    /// is an ordered pair; at most one non-terminal job exists per pair, and
    /// resubmission attaches to it. A `token` pages through a DONE report;
    /// `cancel` applies the cancel-result matrix instead of submitting.
    #[allow(clippy::too_many_arguments)]
    pub fn snapshot_diff(
        &self,
        volume: &str,
        bucket: &str,
        from_snapshot: &str,
        to_snapshot: &str,
        token: Option<&str>,
        page_size: usize,
        force_full_diff: bool,
        cancel: bool,
    ) -> Result<DiffResponse, StoreError> {
        self.check_open()?;
        self.check_snapshot_ready()?;
        Ok(self.diff.submit(
            volume,
            bucket,
            from_snapshot,
            to_snapshot,
            token,
            page_size,
            force_full_diff,
            cancel,
        )?)
    }

    /// Lists diff jobs for a namespace. `list_all` bypasses the status
    /// filter; otherwise `status_filter` must parse to a job status.
    pub fn list_snapshot_diff_jobs(
        &self,
        volume: &str,
        bucket: &str,
        status_filter: &str,
        list_all: bool,
    ) -> Result<Vec<DiffJobRow>, StoreError> {
        self.check_open()?;
        self.check_snapshot_ready()?;
        Ok(self.diff.list_jobs(volume, bucket, status_filter, list_all)?)
    }

    /// Job-table row for an ordered snapshot-id pair (read-only
    /// introspection).
    pub fn diff_job(&self, from_id: &str, to_id: &str) -> Result<Option<DiffJobRow>, StoreError> {
        self.check_open()?;
        Ok(self.diff.job_for(from_id, to_id)?)
    }

    // --------------------------------------------------------------------------------------------
    // Cleanup
    // --------------------------------------------------------------------------------------------

    /// Runs one cleanup reaper pass (the schedule is the caller's concern).
    /// Returns the number of jobs retired into the purge table.
    pub fn run_reaper(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.reaper.run()?)
    }

    /// Audit lookup into the purge table.
    pub fn purged_diff_job(&self, job_id: &str) -> Result<Option<DiffJobRow>, StoreError> {
        self.check_open()?;
        Ok(self.reaper.purged(job_id)?)
    }

    /// Number of segment nodes the lineage tracker currently holds
    /// (read-only introspection).
    pub fn lineage_node_count(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.live.lineage().node_count()?)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.diff.close();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Layout gate
// ------------------------------------------------------------------------------------------------

fn layout_path(root: &Path) -> PathBuf {
    root.join(LAYOUT_FILE)
}

fn read_or_init_layout(root: &Path) -> Result<u32, StoreError> {
    let path = layout_path(root);
    if path.exists() {
        let bytes = fs::read(&path)?;
        if bytes.len() != 4 {
            return Err(StoreError::Internal(format!(
                "malformed layout file {}",
                path.display()
            )));
        }
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    } else {
        write_layout(root, CURRENT_LAYOUT_VERSION)?;
        Ok(CURRENT_LAYOUT_VERSION)
    }
}

fn write_layout(root: &Path, version: u32) -> Result<(), StoreError> {
    let tmp = root.join(format!("{LAYOUT_FILE}.tmp"));
    fs::write(&tmp, version.to_le_bytes())?;
    fs::rename(&tmp, layout_path(root))?;
    Ok(())
}
