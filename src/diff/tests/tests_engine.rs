//! Diff engine state machine: classification, deduplication, cancellation
//! matrix, job listing.

#[cfg(test)]
mod tests {
    use crate::diff::{
        CancelResult, DiffConfig, DiffEngine, DiffError, DiffJobRow, DiffReportPage, DiffType,
        JobStatus,
    };
    use crate::registry::SnapshotRegistry;
    use crate::store::LiveStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    struct Fixture {
        _temp: TempDir,
        live: LiveStore,
        registry: Arc<SnapshotRegistry>,
        engine: DiffEngine,
    }

    fn fixture() -> Fixture {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let live = LiveStore::open(temp.path().join("live"), 1024 * 1024).unwrap();
        let registry = Arc::new(
            SnapshotRegistry::open(
                temp.path().join("meta"),
                temp.path().join("snapshots"),
                live.clone(),
            )
            .unwrap(),
        );
        registry.create_volume("vol").unwrap();
        registry.create_bucket("vol", "buck").unwrap();

        let engine = DiffEngine::open(
            temp.path().join("meta"),
            Arc::clone(&registry),
            Arc::clone(live.lineage()),
            DiffConfig {
                pool_size: 2,
                wait_time_ms: 5,
            },
        )
        .unwrap();

        Fixture {
            _temp: temp,
            live,
            registry,
            engine,
        }
    }

    fn put(fx: &Fixture, key: &str, value: &[u8]) {
        fx.live
            .put(format!("vol/buck/{key}").into_bytes(), value.to_vec())
            .unwrap();
    }

    fn delete(fx: &Fixture, key: &str) {
        fx.live.delete(format!("vol/buck/{key}").into_bytes()).unwrap();
    }

    fn snap(fx: &Fixture, name: &str) {
        fx.registry.create_snapshot("vol", "buck", name).unwrap();
    }

    /// Polls until the job reaches DONE and returns the first page.
    fn wait_done(fx: &Fixture, from: &str, to: &str, page_size: usize) -> DiffReportPage {
        for _ in 0..1000 {
            let response = fx
                .engine
                .submit("vol", "buck", from, to, None, page_size, false, false)
                .unwrap();
            match response.status {
                JobStatus::Done => return response.report.expect("DONE without report"),
                JobStatus::Failed => panic!("diff job failed"),
                _ => std::thread::sleep(Duration::from_millis(response.wait_time_ms)),
            }
        }
        panic!("diff job did not finish in time");
    }

    // ================================================================
    // 1. Classification
    // ================================================================

    #[test]
    fn identical_snapshots_diff_empty() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");

        let report = wait_done(&fx, "s1", "s1", 0);
        assert!(report.entries.is_empty());
        assert_eq!(report.total_entries, 0);
    }

    #[test]
    fn create_delete_modify_are_classified() {
        let fx = fixture();
        put(&fx, "keep", b"same");
        put(&fx, "gone", b"bye");
        put(&fx, "edit", b"v1");
        snap(&fx, "s1");

        put(&fx, "fresh", b"hello");
        delete(&fx, "gone");
        put(&fx, "edit", b"v2");
        snap(&fx, "s2");

        let report = wait_done(&fx, "s1", "s2", 0);
        let mut kinds: Vec<(DiffType, &str)> = report
            .entries
            .iter()
            .map(|e| (e.diff_type, e.key.as_str()))
            .collect();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                (DiffType::Create, "fresh"),
                (DiffType::Delete, "gone"),
                (DiffType::Modify, "edit"),
            ]
        );
    }

    #[test]
    fn rename_collapses_delete_create_pair() {
        let fx = fixture();
        put(&fx, "original", b"payload-123");
        snap(&fx, "s1");

        delete(&fx, "original");
        put(&fx, "renamed", b"payload-123");
        snap(&fx, "s2");

        let report = wait_done(&fx, "s1", "s2", 0);
        assert_eq!(report.entries.len(), 1);
        let entry = &report.entries[0];
        assert_eq!(entry.diff_type, DiffType::Rename);
        assert_eq!(entry.key, "original");
        assert_eq!(entry.target.as_deref(), Some("renamed"));
    }

    #[test]
    fn diff_ignores_other_buckets() {
        let fx = fixture();
        fx.registry.create_bucket("vol", "other").unwrap();

        put(&fx, "mine", b"v1");
        snap(&fx, "s1");

        put(&fx, "mine2", b"v2");
        fx.live
            .put(b"vol/other/foreign".to_vec(), b"x".to_vec())
            .unwrap();
        snap(&fx, "s2");

        let report = wait_done(&fx, "s1", "s2", 0);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].key, "mine2");
    }

    #[test]
    fn ordered_pair_is_directional() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        put(&fx, "k2", b"v2");
        snap(&fx, "s2");

        let forward = wait_done(&fx, "s1", "s2", 0);
        assert_eq!(forward.entries[0].diff_type, DiffType::Create);

        let backward = wait_done(&fx, "s2", "s1", 0);
        assert_eq!(backward.entries[0].diff_type, DiffType::Delete);

        // Two distinct jobs exist, one per direction.
        let s1 = fx.registry.get("vol", "buck", "s1").unwrap();
        let s2 = fx.registry.get("vol", "buck", "s2").unwrap();
        let fwd = fx.engine.job_for(&s1.id, &s2.id).unwrap().unwrap();
        let bwd = fx.engine.job_for(&s2.id, &s1.id).unwrap().unwrap();
        assert_ne!(fwd.job_id, bwd.job_id);
    }

    #[test]
    fn force_full_diff_matches_filtered_diff_across_compaction() {
        let fx = fixture();
        put(&fx, "a", b"1");
        put(&fx, "b", b"2");
        snap(&fx, "s1");

        delete(&fx, "a");
        put(&fx, "c", b"3");
        fx.live.flush().unwrap();
        fx.live.compact().unwrap();
        snap(&fx, "s2");

        let filtered = wait_done(&fx, "s1", "s2", 0);

        let response = fx
            .engine
            .submit("vol", "buck", "s2", "s1", None, 0, true, false)
            .unwrap();
        assert_ne!(response.status, JobStatus::Failed);
        let full_reverse = wait_done(&fx, "s2", "s1", 0);

        // Same keys, mirrored kinds.
        let filtered_keys: Vec<&str> = filtered.entries.iter().map(|e| e.key.as_str()).collect();
        let reverse_keys: Vec<&str> =
            full_reverse.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(filtered_keys, vec!["a", "c"]);
        assert_eq!(reverse_keys, vec!["a", "c"]);
    }

    // ================================================================
    // 2. Validation
    // ================================================================

    #[test]
    fn empty_identifiers_are_rejected() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        snap(&fx, "s2");

        // Empty volume/bucket: invalid argument, never persisted.
        let err = fx
            .engine
            .submit("", "buck", "s1", "s2", None, 0, false, false)
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidArgument(_)));
        let err = fx
            .engine
            .submit("vol", "", "s1", "s2", None, 0, false, false)
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidArgument(_)));

        // Empty snapshot names resolve to nothing.
        let err = fx
            .engine
            .submit("vol", "buck", "", "s2", None, 0, false, false)
            .unwrap_err();
        assert!(matches!(err, DiffError::NotFound(_)));
        let err = fx
            .engine
            .submit("vol", "buck", "s1", "", None, 0, false, false)
            .unwrap_err();
        assert!(matches!(err, DiffError::NotFound(_)));
    }

    #[test]
    fn unknown_snapshots_are_not_found() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");

        let err = fx
            .engine
            .submit("vol", "buck", "s1", "ghost", None, 0, false, false)
            .unwrap_err();
        assert!(matches!(err, DiffError::NotFound(_)));

        let err = fx
            .engine
            .submit("vol", "buck", "ghost", "s1", None, 0, false, false)
            .unwrap_err();
        assert!(matches!(err, DiffError::NotFound(_)));
    }

    // ================================================================
    // 3. Submission idempotence
    // ================================================================

    #[test]
    fn resubmission_attaches_to_existing_job() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        put(&fx, "k2", b"v2");
        snap(&fx, "s2");

        let s1 = fx.registry.get("vol", "buck", "s1").unwrap();
        let s2 = fx.registry.get("vol", "buck", "s2").unwrap();

        fx.engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, false)
            .unwrap();
        let first = fx.engine.job_for(&s1.id, &s2.id).unwrap().unwrap();

        fx.engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, false)
            .unwrap();
        let second = fx.engine.job_for(&s1.id, &s2.id).unwrap().unwrap();

        assert_eq!(first.job_id, second.job_id, "no duplicate job per key");
    }

    // ================================================================
    // 4. Cancellation matrix
    // ================================================================

    fn queued_row(fx: &Fixture, from: &str, to: &str) -> (String, DiffJobRow) {
        let from = fx.registry.get("vol", "buck", from).unwrap();
        let to = fx.registry.get("vol", "buck", to).unwrap();
        let key = format!("{}/{}", from.id, to.id);
        let row = DiffJobRow {
            job_id: "test-job".into(),
            volume: "vol".into(),
            bucket: "buck".into(),
            from_name: from.name.clone(),
            to_name: to.name.clone(),
            from_id: from.id.clone(),
            to_id: to.id.clone(),
            status: JobStatus::Queued,
            cancel_requested: false,
            submitted_ms: 0,
            total_entries: 0,
            force_full: false,
        };
        (key, row)
    }

    #[test]
    fn cancel_without_job_reports_new_job() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        snap(&fx, "s2");

        let response = fx
            .engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, true)
            .unwrap();
        assert_eq!(response.cancel_result, CancelResult::NewJob);
        assert_eq!(response.status, JobStatus::Queued);

        // Nothing was created.
        let s1 = fx.registry.get("vol", "buck", "s1").unwrap();
        let s2 = fx.registry.get("vol", "buck", "s2").unwrap();
        assert!(fx.engine.job_for(&s1.id, &s2.id).unwrap().is_none());
    }

    #[test]
    fn cancel_is_idempotent_and_respects_terminal_states() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        snap(&fx, "s2");

        // Seed a QUEUED row directly so the matrix is deterministic.
        let (key, row) = queued_row(&fx, "s1", "s2");
        fx.engine.ctx.jobs.put(&key, row).unwrap();

        let response = fx
            .engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, true)
            .unwrap();
        assert_eq!(response.cancel_result, CancelResult::CancellationSuccess);
        assert_eq!(response.status, JobStatus::Cancelled);

        // Cancel again: idempotent, not an error.
        let response = fx
            .engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, true)
            .unwrap();
        assert_eq!(response.cancel_result, CancelResult::JobAlreadyCancelled);
        assert_eq!(response.status, JobStatus::Cancelled);
    }

    #[test]
    fn cancel_on_done_job_reports_not_cancelled() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        put(&fx, "k2", b"v2");
        snap(&fx, "s2");

        wait_done(&fx, "s1", "s2", 0);

        let response = fx
            .engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, true)
            .unwrap();
        assert_eq!(response.cancel_result, CancelResult::JobNotCancelled);
        assert_eq!(response.status, JobStatus::Done);
    }

    #[test]
    fn cancelled_job_stays_cancelled_and_produces_no_report() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        put(&fx, "k2", b"v2");
        snap(&fx, "s2");

        let (key, row) = queued_row(&fx, "s1", "s2");
        fx.engine.ctx.jobs.put(&key, row).unwrap();
        fx.engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, true)
            .unwrap();

        // Polling keeps reporting CANCELLED; the row never becomes DONE and
        // no report entries appear.
        std::thread::sleep(Duration::from_millis(50));
        let response = fx
            .engine
            .submit("vol", "buck", "s1", "s2", None, 0, false, false)
            .unwrap();
        assert_eq!(response.status, JobStatus::Cancelled);
        assert!(fx.engine.ctx.reports.is_empty().unwrap());
    }

    // ================================================================
    // 5. Job listing
    // ================================================================

    #[test]
    fn list_jobs_validates_namespace_and_filter() {
        let fx = fixture();

        let err = fx
            .engine
            .list_jobs("ghost", "buck", "", true)
            .unwrap_err();
        match err {
            DiffError::NotFound(msg) => assert_eq!(
                msg,
                "Provided volume name ghost or bucket name buck doesn't exist"
            ),
            other => panic!("expected NotFound, got {other:?}"),
        }

        // Valid namespace, no jobs yet: empty, not an error.
        assert!(fx.engine.list_jobs("vol", "buck", "", true).unwrap().is_empty());

        let err = fx
            .engine
            .list_jobs("vol", "buck", "invalid", false)
            .unwrap_err();
        match err {
            DiffError::InvalidArgument(msg) => {
                assert_eq!(msg, "Invalid job status: invalid");
            }
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[test]
    fn list_jobs_filters_by_status() {
        let fx = fixture();
        put(&fx, "k", b"v");
        snap(&fx, "s1");
        put(&fx, "k2", b"v2");
        snap(&fx, "s2");

        wait_done(&fx, "s1", "s2", 0);

        let done = fx.engine.list_jobs("vol", "buck", "done", false).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, JobStatus::Done);

        let queued = fx.engine.list_jobs("vol", "buck", "queued", false).unwrap();
        assert!(queued.is_empty());

        let all = fx.engine.list_jobs("vol", "buck", "", true).unwrap();
        assert_eq!(all.len(), 1);
    }
}
