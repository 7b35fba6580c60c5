//! Crash recovery: interrupted jobs are discarded, finished jobs and their
//! token streams survive restart.

#[cfg(test)]
mod tests {
    use crate::diff::{
        DiffConfig, DiffEngine, DiffEntry, DiffJobRow, DiffType, JobStatus,
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
        temp: TempDir,
        live: LiveStore,
        registry: Arc<SnapshotRegistry>,
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
        Fixture {
            temp,
            live,
            registry,
        }
    }

    fn engine(fx: &Fixture) -> DiffEngine {
        DiffEngine::open(
            fx.temp.path().join("meta"),
            Arc::clone(&fx.registry),
            Arc::clone(fx.live.lineage()),
            DiffConfig {
                pool_size: 2,
                wait_time_ms: 5,
            },
        )
        .unwrap()
    }

    fn wait_done(engine: &DiffEngine, page_size: usize) -> crate::diff::DiffReportPage {
        for _ in 0..1000 {
            let response = engine
                .submit("vol", "buck", "s1", "s2", None, page_size, false, false)
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
    // 1. Interrupted job is discarded at restart
    // ================================================================

    /// # Scenario
    /// Persist a job as IN_PROGRESS with some partial report entries — the
    /// state a crash mid-computation leaves behind — then open the engine.
    ///
    /// # Expected behavior
    /// The row and the partial entries are gone: no terminal marker was
    /// written, so the key reads as unsubmitted and a fresh request starts
    /// a new job. Never a partial DONE.
    #[test]
    fn in_progress_job_is_discarded_with_partial_entries() {
        let fx = fixture();
        fx.live.put(b"vol/buck/k".to_vec(), b"v".to_vec()).unwrap();
        let s1 = fx.registry.create_snapshot("vol", "buck", "s1").unwrap();
        fx.live.put(b"vol/buck/k2".to_vec(), b"v2".to_vec()).unwrap();
        let s2 = fx.registry.create_snapshot("vol", "buck", "s2").unwrap();

        // Simulate the crash leftovers.
        {
            let engine = engine(&fx);
            let key = format!("{}/{}", s1.id, s2.id);
            let row = DiffJobRow {
                job_id: "crashed-job".into(),
                volume: "vol".into(),
                bucket: "buck".into(),
                from_name: "s1".into(),
                to_name: "s2".into(),
                from_id: s1.id.clone(),
                to_id: s2.id.clone(),
                status: JobStatus::InProgress,
                cancel_requested: false,
                submitted_ms: 0,
                total_entries: 0,
                force_full: false,
            };
            engine.ctx.jobs.put(&key, row).unwrap();
            engine
                .ctx
                .reports
                .put(
                    "crashed-job/0000000000",
                    DiffEntry {
                        diff_type: DiffType::Create,
                        key: "partial".into(),
                        target: None,
                    },
                )
                .unwrap();
            engine.close();
        }

        let restarted = engine(&fx);
        assert!(
            restarted.job_for(&s1.id, &s2.id).unwrap().is_none(),
            "interrupted job must be discarded"
        );
        assert!(
            restarted
                .ctx
                .reports
                .scan_prefix("crashed-job/")
                .unwrap()
                .is_empty(),
            "partial entries must be discarded"
        );

        // A fresh request starts a new job and completes correctly.
        let report = wait_done(&restarted, 0);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].key, "k2");
    }

    // ================================================================
    // 2. DONE survives restart, tokens stay valid
    // ================================================================

    /// # Scenario
    /// Finish a diff, fetch one page, restart the engine between page
    /// fetches, continue with the pre-restart token.
    ///
    /// # Expected behavior
    /// The job is still DONE with the same job id; concatenated pages cover
    /// the full report with no gaps or duplicates.
    #[test]
    fn done_job_and_token_stream_survive_restart() {
        let fx = fixture();
        fx.live.put(b"vol/buck/base".to_vec(), b"v".to_vec()).unwrap();
        fx.registry.create_snapshot("vol", "buck", "s1").unwrap();
        for i in 0..30 {
            fx.live
                .put(format!("vol/buck/key-{i:02}").into_bytes(), b"v".to_vec())
                .unwrap();
        }
        fx.registry.create_snapshot("vol", "buck", "s2").unwrap();

        let (first_page, token, job_id) = {
            let engine = engine(&fx);
            let page = wait_done(&engine, 10);
            let job = engine
                .list_jobs("vol", "buck", "done", false)
                .unwrap()
                .remove(0);
            engine.close();
            (page.entries.clone(), page.next_token.unwrap(), job.job_id)
        };

        let restarted = engine(&fx);
        let job = restarted
            .list_jobs("vol", "buck", "done", false)
            .unwrap()
            .remove(0);
        assert_eq!(job.job_id, job_id, "DONE job survives restart unchanged");

        let mut entries = first_page;
        let mut token = Some(token);
        while let Some(current) = token {
            let page = restarted
                .submit("vol", "buck", "s1", "s2", Some(&current), 10, false, false)
                .unwrap()
                .report
                .unwrap();
            entries.extend(page.entries);
            token = page.next_token;
        }

        assert_eq!(entries.len(), 30);
        assert!(entries.windows(2).all(|w| w[0].key < w[1].key));
    }

    // ================================================================
    // 3. QUEUED rows are discarded too
    // ================================================================

    #[test]
    fn queued_job_is_discarded_at_restart() {
        let fx = fixture();
        fx.live.put(b"vol/buck/k".to_vec(), b"v".to_vec()).unwrap();
        let s1 = fx.registry.create_snapshot("vol", "buck", "s1").unwrap();
        let s2 = fx.registry.create_snapshot("vol", "buck", "s2").unwrap();

        {
            let engine = engine(&fx);
            let key = format!("{}/{}", s1.id, s2.id);
            let row = DiffJobRow {
                job_id: "queued-job".into(),
                volume: "vol".into(),
                bucket: "buck".into(),
                from_name: "s1".into(),
                to_name: "s2".into(),
                from_id: s1.id.clone(),
                to_id: s2.id.clone(),
                status: JobStatus::Queued,
                cancel_requested: false,
                submitted_ms: 0,
                total_entries: 0,
                force_full: false,
            };
            engine.ctx.jobs.put(&key, row).unwrap();
            engine.close();
        }

        let restarted = engine(&fx);
        assert!(restarted.job_for(&s1.id, &s2.id).unwrap().is_none());
    }
}
