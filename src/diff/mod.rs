//! # Snapshot Diff Engine
//!
//! Accepts diff requests between two ACTIVE snapshots, deduplicates
//! concurrent identical requests into one persisted job, computes the diff
//! on a bounded worker pool, and serves the finished report in stable,
//! token-resumable pages.
//!
//! ## Job state machine
//!
//! ```text
//! QUEUED → IN_PROGRESS → {DONE, FAILED}
//! QUEUED | IN_PROGRESS → CANCELLED        (cooperative)
//! ```
//!
//! A job is keyed by the ordered pair `(from id, to id)` — `(A,B)` and
//! `(B,A)` are distinct jobs. At most one non-terminal job exists per key:
//! resubmission attaches to it. Terminal rows are immutable until the
//! cleanup reaper retires them to the purge table.
//!
//! All transitions run under one short-held admission lock, so concurrent
//! cancel and status polls observe a single consistent sequence. The
//! long-running computation itself runs off-lock on the pool and observes
//! cancellation once per key batch.
//!
//! ## Durability & recovery
//!
//! The job row and every report entry live in durable tables. A worker
//! persists all entries first and flips the row to DONE last — that row
//! write is the terminal marker. On restart, rows still QUEUED or
//! IN_PROGRESS lost their computation: they are discarded (with any partial
//! entries) and the key is treated as unsubmitted. DONE rows keep serving
//! pages across restarts; their tokens stay valid.

#[cfg(test)]
mod tests;

mod compute;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{CodecError, Decode, Encode};
use crate::lineage::{LineageError, LineageTracker};
use crate::registry::{RegistryError, SnapshotRegistry, SnapshotRow};
use crate::store::{Checkpoint, LiveStoreError};
use crate::table::{Table, TableError};

const JOB_TABLE: &str = "diff_jobs";
const REPORT_TABLE: &str = "diff_reports";
const TOKEN_PREFIX: &str = "v1";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by diff engine operations.
#[derive(Debug, Error)]
pub enum DiffError {
    /// A required identifier was empty or a parameter was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown snapshot, namespace, or pagination token.
    #[error("not found: {0}")]
    NotFound(String),

    /// Metadata table failure.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Checkpoint read failure.
    #[error("store error: {0}")]
    Store(#[from] LiveStoreError),

    /// Lineage query failure.
    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for DiffError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidArgument(msg) => DiffError::InvalidArgument(msg),
            RegistryError::NotFound(msg) => DiffError::NotFound(msg),
            RegistryError::AlreadyExists(msg) | RegistryError::Conflict(msg) => {
                DiffError::Internal(msg)
            }
            RegistryError::Table(e) => DiffError::Table(e),
            RegistryError::Store(e) => DiffError::Store(e),
            RegistryError::Internal(msg) => DiffError::Internal(msg),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Public types
// ------------------------------------------------------------------------------------------------

/// The kind of change one report entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffType {
    /// Key exists only in the `to` snapshot.
    Create,
    /// Key exists only in the `from` snapshot.
    Delete,
    /// Key exists in both with different content.
    Modify,
    /// A DELETE/CREATE pair with identical content, collapsed.
    Rename,
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiffType::Create => "CREATE",
            DiffType::Delete => "DELETE",
            DiffType::Modify => "MODIFY",
            DiffType::Rename => "RENAME",
        };
        f.write_str(s)
    }
}

impl Encode for DiffType {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let tag: u8 = match self {
            DiffType::Create => 0,
            DiffType::Delete => 1,
            DiffType::Modify => 2,
            DiffType::Rename => 3,
        };
        tag.encode(buf)
    }
}

impl Decode for DiffType {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (tag, n) = u8::decode(buf)?;
        let diff_type = match tag {
            0 => DiffType::Create,
            1 => DiffType::Delete,
            2 => DiffType::Modify,
            3 => DiffType::Rename,
            _ => {
                return Err(CodecError::InvalidTag {
                    tag,
                    type_name: "DiffType",
                });
            }
        };
        Ok((diff_type, n))
    }
}

/// One entry of a diff report. Keys are bucket-relative paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    /// What happened to the key.
    pub diff_type: DiffType,
    /// Primary key path (the source path for a RENAME).
    pub key: String,
    /// Target path; populated only for RENAME.
    pub target: Option<String>,
}

impl Encode for DiffEntry {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.diff_type.encode(buf)?;
        self.key.encode(buf)?;
        self.target.encode(buf)?;
        Ok(())
    }
}

impl Decode for DiffEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut offset = 0;
        let (diff_type, n) = DiffType::decode(&buf[offset..])?;
        offset += n;
        let (key, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (target, n) = Option::<String>::decode(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                diff_type,
                key,
                target,
            },
            offset,
        ))
    }
}

/// Lifecycle status of a diff job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Accepted, waiting for a pool slot.
    Queued,
    /// Computation running.
    InProgress,
    /// Report complete and persisted.
    Done,
    /// Computation failed; retained until reaped.
    Failed,
    /// Cancelled cooperatively.
    Cancelled,
    /// Rejected before admission (never persisted).
    Rejected,
}

impl JobStatus {
    /// True for DONE, FAILED, and CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Parses a caller-supplied filter string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "in_progress" => Some(JobStatus::InProgress),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "rejected" => Some(JobStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

impl Encode for JobStatus {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let tag: u8 = match self {
            JobStatus::Queued => 0,
            JobStatus::InProgress => 1,
            JobStatus::Done => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelled => 4,
            JobStatus::Rejected => 5,
        };
        tag.encode(buf)
    }
}

impl Decode for JobStatus {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (tag, n) = u8::decode(buf)?;
        let status = match tag {
            0 => JobStatus::Queued,
            1 => JobStatus::InProgress,
            2 => JobStatus::Done,
            3 => JobStatus::Failed,
            4 => JobStatus::Cancelled,
            5 => JobStatus::Rejected,
            _ => {
                return Err(CodecError::InvalidTag {
                    tag,
                    type_name: "JobStatus",
                });
            }
        };
        Ok((status, n))
    }
}

/// Outcome of the cancel half of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// Nothing to cancel — no job exists for the key.
    NewJob,
    /// A non-terminal job was transitioned to CANCELLED.
    CancellationSuccess,
    /// The job was already CANCELLED (idempotent, not an error).
    JobAlreadyCancelled,
    /// The job reached DONE or FAILED; cancellation does not apply.
    JobNotCancelled,
}

/// One persisted diff job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffJobRow {
    /// Opaque job token (UUID).
    pub job_id: String,
    /// Namespace the snapshots belong to.
    pub volume: String,
    /// Bucket the snapshots belong to.
    pub bucket: String,
    /// `from` snapshot name.
    pub from_name: String,
    /// `to` snapshot name.
    pub to_name: String,
    /// `from` snapshot id.
    pub from_id: String,
    /// `to` snapshot id.
    pub to_id: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Cooperative cancellation flag observed by the running computation.
    pub cancel_requested: bool,
    /// Submission time, unix millis.
    pub submitted_ms: u64,
    /// Total report entries once DONE.
    pub total_entries: u64,
    /// Whether the lineage filter was bypassed.
    pub force_full: bool,
}

impl Encode for DiffJobRow {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.job_id.encode(buf)?;
        self.volume.encode(buf)?;
        self.bucket.encode(buf)?;
        self.from_name.encode(buf)?;
        self.to_name.encode(buf)?;
        self.from_id.encode(buf)?;
        self.to_id.encode(buf)?;
        self.status.encode(buf)?;
        self.cancel_requested.encode(buf)?;
        self.submitted_ms.encode(buf)?;
        self.total_entries.encode(buf)?;
        self.force_full.encode(buf)?;
        Ok(())
    }
}

impl Decode for DiffJobRow {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut offset = 0;
        let (job_id, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (volume, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (bucket, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (from_name, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (to_name, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (from_id, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (to_id, n) = String::decode(&buf[offset..])?;
        offset += n;
        let (status, n) = JobStatus::decode(&buf[offset..])?;
        offset += n;
        let (cancel_requested, n) = bool::decode(&buf[offset..])?;
        offset += n;
        let (submitted_ms, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (total_entries, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (force_full, n) = bool::decode(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                job_id,
                volume,
                bucket,
                from_name,
                to_name,
                from_id,
                to_id,
                status,
                cancel_requested,
                submitted_ms,
                total_entries,
                force_full,
            },
            offset,
        ))
    }
}

/// One page of a finished report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReportPage {
    /// Entries in deterministic lexicographic order.
    pub entries: Vec<DiffEntry>,
    /// Token for the next page; `None` when this page is the last.
    pub next_token: Option<String>,
    /// Total entries in the whole report.
    pub total_entries: u64,
}

/// Response to one `submit` call.
#[derive(Debug, Clone)]
pub struct DiffResponse {
    /// Job status observed at response time.
    pub status: JobStatus,
    /// Cancel outcome; `JobNotCancelled` on plain submissions.
    pub cancel_result: CancelResult,
    /// Suggested poll delay for non-terminal statuses.
    pub wait_time_ms: u64,
    /// Report page, present when the job is DONE.
    pub report: Option<DiffReportPage>,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning knobs for the diff engine.
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// Worker threads computing diffs — the cap on concurrently
    /// IN_PROGRESS jobs.
    pub pool_size: usize,
    /// Poll delay suggested to callers of non-terminal jobs.
    pub wait_time_ms: u64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            wait_time_ms: 200,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// Shared state handed to pool workers.
#[derive(Clone)]
struct EngineCtx {
    jobs: Arc<Table<DiffJobRow>>,
    reports: Arc<Table<DiffEntry>>,
    lineage: Arc<LineageTracker>,
    /// Serializes every job-table transition (admission, cancel, terminal
    /// writes). Held only for table mutations, never during computation.
    admission: Arc<Mutex<()>>,
}

impl EngineCtx {
    fn lock_admission(&self) -> Result<std::sync::MutexGuard<'_, ()>, DiffError> {
        self.admission
            .lock()
            .map_err(|_| DiffError::Internal("admission mutex poisoned".into()))
    }
}

/// Holds the worker pool sender and join handles. Taken on shutdown.
struct WorkerPool {
    sender: crossbeam::channel::Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// The snapshot diff engine. One per store.
pub struct DiffEngine {
    ctx: EngineCtx,
    registry: Arc<SnapshotRegistry>,
    pool: Mutex<Option<WorkerPool>>,
    wait_time_ms: u64,
}

impl std::fmt::Debug for DiffEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffEngine").finish_non_exhaustive()
    }
}

/// Job-table key for an ordered snapshot pair. NOT symmetric: `(A,B)` and
/// `(B,A)` are distinct jobs.
fn job_key(from_id: &str, to_id: &str) -> String {
    format!("{from_id}/{to_id}")
}

fn report_key(job_id: &str, ordinal: u64) -> String {
    format!("{job_id}/{ordinal:010}")
}

fn encode_token(job_id: &str, next_ordinal: u64) -> String {
    format!("{TOKEN_PREFIX}/{job_id}/{next_ordinal}")
}

fn parse_token(token: &str) -> Option<(String, u64)> {
    let rest = token.strip_prefix(TOKEN_PREFIX)?.strip_prefix('/')?;
    let (job_id, ordinal) = rest.rsplit_once('/')?;
    Some((job_id.to_string(), ordinal.parse().ok()?))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl DiffEngine {
    /// Opens the engine: loads the job and report tables, discards jobs that
    /// were mid-flight when the process died, and starts the worker pool.
    pub fn open(
        meta_dir: impl AsRef<Path>,
        registry: Arc<SnapshotRegistry>,
        lineage: Arc<LineageTracker>,
        config: DiffConfig,
    ) -> Result<Self, DiffError> {
        let jobs = Arc::new(Table::open(&meta_dir, JOB_TABLE)?);
        let reports = Arc::new(Table::open(&meta_dir, REPORT_TABLE)?);

        let ctx = EngineCtx {
            jobs,
            reports,
            lineage,
            admission: Arc::new(Mutex::new(())),
        };

        let engine = Self {
            ctx,
            registry,
            pool: Mutex::new(None),
            wait_time_ms: config.wait_time_ms,
        };
        engine.recover()?;
        engine.start_pool(config.pool_size)?;
        Ok(engine)
    }

    /// Restart recovery: a row still QUEUED or IN_PROGRESS lost its
    /// computation — no terminal marker was written. Discard it and any
    /// partial entries; the key becomes unsubmitted. Terminal rows and
    /// their entries are untouched, keeping token streams valid.
    fn recover(&self) -> Result<(), DiffError> {
        for (key, row) in self.ctx.jobs.entries()? {
            if row.status.is_terminal() {
                continue;
            }
            warn!(
                job_id = %row.job_id,
                status = %row.status,
                "discarding diff job interrupted by restart"
            );
            self.delete_report_entries(&row.job_id)?;
            self.ctx.jobs.delete(&key)?;
        }
        Ok(())
    }

    fn delete_report_entries(&self, job_id: &str) -> Result<(), DiffError> {
        for (key, _) in self.ctx.reports.scan_prefix(&format!("{job_id}/"))? {
            self.ctx.reports.delete(&key)?;
        }
        Ok(())
    }

    fn start_pool(&self, pool_size: usize) -> Result<(), DiffError> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Box<dyn FnOnce() + Send>>();
        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("vantagedb-diff-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(|e| DiffError::Internal(format!("failed to spawn diff worker: {e}")))?;
            workers.push(handle);
        }
        drop(receiver);
        *self
            .pool
            .lock()
            .map_err(|_| DiffError::Internal("pool mutex poisoned".into()))? =
            Some(WorkerPool { sender, workers });
        Ok(())
    }

    /// Drains queued work and joins the pool. Idempotent.
    pub fn close(&self) {
        let taken = self.pool.lock().ok().and_then(|mut guard| guard.take());
        if let Some(pool) = taken {
            drop(pool.sender);
            for worker in pool.workers {
                let _ = worker.join();
            }
        }
    }

    /// Job table handle for the cleanup reaper.
    pub(crate) fn jobs_table(&self) -> Arc<Table<DiffJobRow>> {
        Arc::clone(&self.ctx.jobs)
    }

    /// Report table handle for the cleanup reaper.
    pub(crate) fn reports_table(&self) -> Arc<Table<DiffEntry>> {
        Arc::clone(&self.ctx.reports)
    }

    /// Job row for an ordered snapshot-id pair (read-only introspection).
    pub fn job_for(&self, from_id: &str, to_id: &str) -> Result<Option<DiffJobRow>, DiffError> {
        Ok(self.ctx.jobs.get(&job_key(from_id, to_id))?)
    }

    // --------------------------------------------------------------------------------------------
    // Submission
    // --------------------------------------------------------------------------------------------

    /// The one entry point: submit, poll, cancel, or page through a diff of
    /// `(from, to)` depending on `token` / `cancel`.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        volume: &str,
        bucket: &str,
        from_name: &str,
        to_name: &str,
        token: Option<&str>,
        page_size: usize,
        force_full: bool,
        cancel: bool,
    ) -> Result<DiffResponse, DiffError> {
        if volume.is_empty() || bucket.is_empty() {
            return Err(DiffError::InvalidArgument(
                "volume and bucket names must not be empty".into(),
            ));
        }
        if from_name.is_empty() || to_name.is_empty() {
            return Err(DiffError::NotFound(
                "from and to snapshot names must not be empty".into(),
            ));
        }

        let from = self.registry.get(volume, bucket, from_name)?;
        let to = self.registry.get(volume, bucket, to_name)?;
        let key = job_key(&from.id, &to.id);

        if cancel {
            return self.cancel_job(&key);
        }

        if let Some(token) = token {
            return self.serve_token(&key, token, page_size);
        }

        // Admission: attach to an existing job or create a fresh one.
        let guard = self.ctx.lock_admission()?;
        if let Some(row) = self.ctx.jobs.get(&key)? {
            drop(guard);
            let report = if row.status == JobStatus::Done {
                Some(self.page(&row, 0, page_size)?)
            } else {
                None
            };
            return Ok(DiffResponse {
                status: row.status,
                cancel_result: CancelResult::JobNotCancelled,
                wait_time_ms: self.wait_time_ms,
                report,
            });
        }

        let row = DiffJobRow {
            job_id: Uuid::new_v4().to_string(),
            volume: volume.to_string(),
            bucket: bucket.to_string(),
            from_name: from_name.to_string(),
            to_name: to_name.to_string(),
            from_id: from.id.clone(),
            to_id: to.id.clone(),
            status: JobStatus::Queued,
            cancel_requested: false,
            submitted_ms: now_ms(),
            total_entries: 0,
            force_full,
        };
        self.ctx.jobs.put(&key, row.clone())?;
        drop(guard);

        self.enqueue(key.clone(), row.clone(), &from, &to)?;

        info!(
            volume,
            bucket,
            from = from_name,
            to = to_name,
            job_id = %row.job_id,
            force_full,
            "diff job queued"
        );
        Ok(DiffResponse {
            status: JobStatus::Queued,
            cancel_result: CancelResult::JobNotCancelled,
            wait_time_ms: self.wait_time_ms,
            report: None,
        })
    }

    /// Lists jobs for a namespace, optionally filtered by status.
    /// `list_all` bypasses the filter.
    pub fn list_jobs(
        &self,
        volume: &str,
        bucket: &str,
        status_filter: &str,
        list_all: bool,
    ) -> Result<Vec<DiffJobRow>, DiffError> {
        if !self.registry.namespace_exists(volume, bucket)? {
            return Err(DiffError::NotFound(format!(
                "Provided volume name {volume} or bucket name {bucket} doesn't exist"
            )));
        }
        let filter = if list_all {
            None
        } else {
            match JobStatus::parse(status_filter) {
                Some(status) => Some(status),
                None => {
                    return Err(DiffError::InvalidArgument(format!(
                        "Invalid job status: {status_filter}"
                    )));
                }
            }
        };

        Ok(self
            .ctx
            .jobs
            .entries()?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| row.volume == volume && row.bucket == bucket)
            .filter(|row| filter.is_none_or(|status| row.status == status))
            .collect())
    }

    // --------------------------------------------------------------------------------------------
    // Cancellation
    // --------------------------------------------------------------------------------------------

    fn cancel_job(&self, key: &str) -> Result<DiffResponse, DiffError> {
        let _guard = self.ctx.lock_admission()?;
        let response = match self.ctx.jobs.get(key)? {
            // Nothing to cancel; nothing is created either.
            None => DiffResponse {
                status: JobStatus::Queued,
                cancel_result: CancelResult::NewJob,
                wait_time_ms: self.wait_time_ms,
                report: None,
            },
            Some(row) if row.status == JobStatus::Cancelled => DiffResponse {
                status: JobStatus::Cancelled,
                cancel_result: CancelResult::JobAlreadyCancelled,
                wait_time_ms: self.wait_time_ms,
                report: None,
            },
            Some(row) if row.status.is_terminal() => DiffResponse {
                status: row.status,
                cancel_result: CancelResult::JobNotCancelled,
                wait_time_ms: self.wait_time_ms,
                report: None,
            },
            Some(mut row) => {
                row.status = JobStatus::Cancelled;
                row.cancel_requested = true;
                self.ctx.jobs.put(key, row.clone())?;
                info!(job_id = %row.job_id, "diff job cancelled");
                DiffResponse {
                    status: JobStatus::Cancelled,
                    cancel_result: CancelResult::CancellationSuccess,
                    wait_time_ms: self.wait_time_ms,
                    report: None,
                }
            }
        };
        Ok(response)
    }

    // --------------------------------------------------------------------------------------------
    // Pagination
    // --------------------------------------------------------------------------------------------

    fn serve_token(
        &self,
        key: &str,
        token: &str,
        page_size: usize,
    ) -> Result<DiffResponse, DiffError> {
        let (job_id, next_ordinal) = parse_token(token)
            .ok_or_else(|| DiffError::NotFound(format!("unrecognized token {token}")))?;

        let row = self
            .ctx
            .jobs
            .get(key)?
            .filter(|row| row.job_id == job_id)
            .ok_or_else(|| {
                DiffError::NotFound(format!("no diff job matches token {token}"))
            })?;
        if row.status != JobStatus::Done {
            return Err(DiffError::NotFound(format!(
                "token {token} refers to a job that is {}",
                row.status
            )));
        }

        let report = self.page(&row, next_ordinal, page_size)?;
        Ok(DiffResponse {
            status: JobStatus::Done,
            cancel_result: CancelResult::JobNotCancelled,
            wait_time_ms: self.wait_time_ms,
            report: Some(report),
        })
    }

    fn page(
        &self,
        row: &DiffJobRow,
        next_ordinal: u64,
        page_size: usize,
    ) -> Result<DiffReportPage, DiffError> {
        let prefix = format!("{}/", row.job_id);
        let start_after = if next_ordinal == 0 {
            None
        } else {
            Some(report_key(&row.job_id, next_ordinal - 1))
        };
        let rows = self
            .ctx
            .reports
            .scan_prefix_after(&prefix, start_after.as_deref(), page_size)?;
        let entries: Vec<DiffEntry> = rows.into_iter().map(|(_, entry)| entry).collect();

        let delivered = next_ordinal + entries.len() as u64;
        let next_token = if delivered < row.total_entries {
            Some(encode_token(&row.job_id, delivered))
        } else {
            None
        };
        Ok(DiffReportPage {
            entries,
            next_token,
            total_entries: row.total_entries,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Worker side
    // --------------------------------------------------------------------------------------------

    /// Clones checkpoint read handles (pinning both snapshots against
    /// physical deletion) and hands the computation to the pool.
    fn enqueue(
        &self,
        key: String,
        row: DiffJobRow,
        from: &SnapshotRow,
        to: &SnapshotRow,
    ) -> Result<(), DiffError> {
        let from_ckpt = self.registry.checkpoint_handle(from)?;
        let to_ckpt = self.registry.checkpoint_handle(to)?;
        let ctx = self.ctx.clone();
        let prefix = format!("{}/{}/", row.volume, row.bucket);

        let task = move || {
            if let Err(e) = run_diff_job(&ctx, &key, &row, from_ckpt, to_ckpt, &prefix) {
                error!(job_id = %row.job_id, %e, "diff job failed");
                let _ = mark_failed(&ctx, &key);
            }
        };

        let guard = self
            .pool
            .lock()
            .map_err(|_| DiffError::Internal("pool mutex poisoned".into()))?;
        match guard.as_ref() {
            Some(pool) => {
                pool.sender
                    .send(Box::new(task))
                    .map_err(|_| DiffError::Internal("diff pool is shut down".into()))?;
                Ok(())
            }
            None => Err(DiffError::Internal("diff pool is shut down".into())),
        }
    }
}

impl Drop for DiffEngine {
    fn drop(&mut self) {
        self.close();
    }
}

// ------------------------------------------------------------------------------------------------
// Worker body
// ------------------------------------------------------------------------------------------------

fn mark_failed(ctx: &EngineCtx, key: &str) -> Result<(), DiffError> {
    let _guard = ctx.lock_admission()?;
    if let Some(mut row) = ctx.jobs.get(key)? {
        // Cancellation that raced the failure wins; both are terminal.
        if !row.status.is_terminal() {
            row.status = JobStatus::Failed;
            ctx.jobs.put(key, row)?;
        }
    }
    Ok(())
}

fn run_diff_job(
    ctx: &EngineCtx,
    key: &str,
    row: &DiffJobRow,
    from_ckpt: Arc<Checkpoint>,
    to_ckpt: Arc<Checkpoint>,
    prefix: &str,
) -> Result<(), DiffError> {
    // Claim: flip QUEUED → IN_PROGRESS unless a cancel won the race.
    {
        let _guard = ctx.lock_admission()?;
        match ctx.jobs.get(key)? {
            Some(mut current) if current.status == JobStatus::Queued => {
                current.status = JobStatus::InProgress;
                ctx.jobs.put(key, current)?;
            }
            other => {
                debug!(job_id = %row.job_id, ?other, "diff job not runnable; skipping");
                return Ok(());
            }
        }
    }

    let range_start = prefix.as_bytes().to_vec();
    let mut range_end = prefix.as_bytes().to_vec();
    range_end.push(0xFF);

    let jobs = Arc::clone(&ctx.jobs);
    let cancel_key = key.to_string();
    let should_cancel = move || -> bool {
        match jobs.get(&cancel_key) {
            Ok(Some(row)) => row.cancel_requested || row.status == JobStatus::Cancelled,
            // A vanished row means the job was discarded; stop quietly.
            _ => true,
        }
    };

    let outcome = if row.force_full {
        compute::full_diff(
            &from_ckpt,
            &to_ckpt,
            &range_start,
            &range_end,
            prefix.len(),
            &should_cancel,
        )?
    } else {
        let interesting = ctx.lineage.changed_segments(
            &from_ckpt.segment_ids(),
            &to_ckpt.segment_ids(),
            &range_start,
            &range_end,
        )?;
        let candidates = compute::collect_candidates(
            &from_ckpt,
            &to_ckpt,
            &interesting,
            &range_start,
            &range_end,
        )?;
        compute::classify_candidates(
            &from_ckpt,
            &to_ckpt,
            candidates,
            prefix.len(),
            &should_cancel,
        )?
    };

    let entries = match outcome {
        compute::ComputeOutcome::Cancelled => {
            // Nothing was persisted; the row already reads CANCELLED.
            debug!(job_id = %row.job_id, "diff computation halted by cancel");
            return Ok(());
        }
        compute::ComputeOutcome::Finished(entries) => entries,
    };

    // Persist the report, then commit DONE as the terminal marker. A crash
    // in between leaves an IN_PROGRESS row that restart recovery discards
    // together with these entries.
    for (ordinal, entry) in entries.iter().enumerate() {
        ctx.reports
            .put(&report_key(&row.job_id, ordinal as u64), entry.clone())?;
    }

    let _guard = ctx.lock_admission()?;
    match ctx.jobs.get(key)? {
        Some(mut current) if current.status == JobStatus::InProgress => {
            current.total_entries = entries.len() as u64;
            current.status = JobStatus::Done;
            ctx.jobs.put(key, current)?;
            info!(job_id = %row.job_id, entries = entries.len(), "diff job done");
        }
        _ => {
            // Cancelled (or discarded) while persisting: terminal states are
            // immutable, so withdraw the partial report instead.
            for (ordinal, _) in entries.iter().enumerate() {
                ctx.reports.delete(&report_key(&row.job_id, ordinal as u64))?;
            }
            debug!(job_id = %row.job_id, "report withdrawn after late cancel");
        }
    }
    Ok(())
}
