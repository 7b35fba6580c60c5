//! # Cleanup Reaper
//!
//! Periodic retirement of finished diff jobs. Each run walks the active job
//! table and moves rows into the purge table when they are:
//!
//! - CANCELLED (no grace period — the report was never produced),
//! - DONE or FAILED and older than the retention grace period, or
//! - orphaned: referencing a snapshot that is no longer ACTIVE.
//!
//! Retired jobs lose their report entries; the purge table keeps the row
//! itself (keyed by job id) for verification and audit. QUEUED and
//! IN_PROGRESS jobs are never touched. Runs are idempotent and safe
//! alongside concurrent submissions for other keys — every table operation
//! is atomic, and a second run simply finds nothing left to do.
//!
//! The owner supplies the schedule; [`CleanupReaper::run`] is a single pass.


use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::diff::{DiffEntry, DiffJobRow, JobStatus};
use crate::registry::{RegistryError, SnapshotRegistry};
use crate::table::{Table, TableError};

const PURGE_TABLE: &str = "diff_purged";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by reaper passes.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// Metadata table failure.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Registry lookup failure.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

// ------------------------------------------------------------------------------------------------
// Reaper
// ------------------------------------------------------------------------------------------------

/// Background retirement of terminal diff jobs. One per store.
pub struct CleanupReaper {
    jobs: Arc<Table<DiffJobRow>>,
    reports: Arc<Table<DiffEntry>>,
    purged: Table<DiffJobRow>,
    registry: Arc<SnapshotRegistry>,
    retention_ms: u64,
}

impl std::fmt::Debug for CleanupReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupReaper")
            .field("retention_ms", &self.retention_ms)
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl CleanupReaper {
    /// Opens the reaper and its purge table.
    pub fn open(
        meta_dir: impl AsRef<Path>,
        jobs: Arc<Table<DiffJobRow>>,
        reports: Arc<Table<DiffEntry>>,
        registry: Arc<SnapshotRegistry>,
        retention_ms: u64,
    ) -> Result<Self, ReaperError> {
        Ok(Self {
            jobs,
            reports,
            purged: Table::open(meta_dir, PURGE_TABLE)?,
            registry,
            retention_ms,
        })
    }

    /// One reaper pass. Returns the number of jobs retired.
    pub fn run(&self) -> Result<usize, ReaperError> {
        let now = now_ms();
        let mut retired = 0usize;

        for (key, row) in self.jobs.entries()? {
            if !row.status.is_terminal() {
                continue;
            }

            let orphaned = !self.registry.is_active_id(&row.from_id)?
                || !self.registry.is_active_id(&row.to_id)?;
            let expired = now.saturating_sub(row.submitted_ms) >= self.retention_ms;
            let cancelled = row.status == JobStatus::Cancelled;

            if !(orphaned || expired || cancelled) {
                continue;
            }

            debug!(
                job_id = %row.job_id,
                status = %row.status,
                orphaned,
                expired,
                "retiring diff job"
            );
            self.purged.put(&row.job_id, row.clone())?;
            for (report_key, _) in self.reports.scan_prefix(&format!("{}/", row.job_id))? {
                self.reports.delete(&report_key)?;
            }
            self.jobs.delete(&key)?;
            retired += 1;
        }

        // Finish deferred snapshot deletions whose checkpoints are gone.
        let cleared = self.registry.sweep_deleted_rows()?;

        // Compact the metadata ops logs while we are here anyway.
        self.jobs.checkpoint()?;
        self.reports.checkpoint()?;
        self.purged.checkpoint()?;

        if retired > 0 || cleared > 0 {
            info!(retired, cleared, "cleanup reaper pass complete");
        }
        Ok(retired)
    }

    /// Audit lookup into the purge table.
    pub fn purged(&self, job_id: &str) -> Result<Option<DiffJobRow>, ReaperError> {
        Ok(self.purged.get(job_id)?)
    }

    /// Number of rows in the purge table (read-only introspection).
    pub fn purged_count(&self) -> Result<usize, ReaperError> {
        Ok(self.purged.len()?)
    }
}
