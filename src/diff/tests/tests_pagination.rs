//! Pagination: stable tokens, completeness across page sizes, token
//! validation.

#[cfg(test)]
mod tests {
    use crate::diff::{DiffConfig, DiffEngine, DiffEntry, DiffError, DiffType, JobStatus};
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

    /// Creates two snapshots 100 created keys apart and waits for the diff.
    fn hundred_entry_diff(fx: &Fixture) {
        fx.live
            .put(b"vol/buck/base".to_vec(), b"v".to_vec())
            .unwrap();
        fx.registry.create_snapshot("vol", "buck", "s1").unwrap();
        for i in 0..100 {
            fx.live
                .put(format!("vol/buck/key-{i:03}").into_bytes(), b"v".to_vec())
                .unwrap();
        }
        fx.registry.create_snapshot("vol", "buck", "s2").unwrap();

        for _ in 0..1000 {
            let response = fx
                .engine
                .submit("vol", "buck", "s1", "s2", None, 0, false, false)
                .unwrap();
            match response.status {
                JobStatus::Done => return,
                JobStatus::Failed => panic!("diff job failed"),
                _ => std::thread::sleep(Duration::from_millis(response.wait_time_ms)),
            }
        }
        panic!("diff job did not finish in time");
    }

    /// Walks the whole token stream with the given page size.
    fn fetch_all(fx: &Fixture, page_size: usize) -> Vec<DiffEntry> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let response = fx
                .engine
                .submit(
                    "vol",
                    "buck",
                    "s1",
                    "s2",
                    token.as_deref(),
                    page_size,
                    false,
                    false,
                )
                .unwrap();
            assert_eq!(response.status, JobStatus::Done);
            let page = response.report.expect("DONE without report");
            assert_eq!(page.total_entries, 100);
            entries.extend(page.entries);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        entries
    }

    // ================================================================
    // 1. Completeness across page sizes
    // ================================================================

    /// # Scenario
    /// A 100-entry diff fetched with unbounded and small fixed page sizes.
    ///
    /// # Expected behavior
    /// Every walk yields exactly the total count, ordered, with no gaps or
    /// duplicates, regardless of page size.
    #[test]
    fn page_walks_are_complete_for_all_page_sizes() {
        let fx = fixture();
        hundred_entry_diff(&fx);

        let unbounded = fetch_all(&fx, 0);
        assert_eq!(unbounded.len(), 100);

        for page_size in [1, 7, 10, 33, 100, 250] {
            let entries = fetch_all(&fx, page_size);
            assert_eq!(entries, unbounded, "page size {page_size} must not change the stream");
        }

        // Ordered, unique, and all CREATEs.
        assert!(unbounded.windows(2).all(|w| w[0].key < w[1].key));
        assert!(unbounded.iter().all(|e| e.diff_type == DiffType::Create));
    }

    // ================================================================
    // 2. Token validation
    // ================================================================

    #[test]
    fn unrecognized_tokens_are_not_found() {
        let fx = fixture();
        hundred_entry_diff(&fx);

        for bad in ["garbage", "v1/wrong-job/0", "v1/", "v2/x/0"] {
            let err = fx
                .engine
                .submit("vol", "buck", "s1", "s2", Some(bad), 10, false, false)
                .unwrap_err();
            assert!(matches!(err, DiffError::NotFound(_)), "token {bad:?}");
        }
    }

    #[test]
    fn token_resumes_exactly_after_last_delivered_key() {
        let fx = fixture();
        hundred_entry_diff(&fx);

        let first = fx
            .engine
            .submit("vol", "buck", "s1", "s2", None, 10, false, false)
            .unwrap()
            .report
            .unwrap();
        assert_eq!(first.entries.len(), 10);
        let token = first.next_token.expect("more pages expected");

        let second = fx
            .engine
            .submit("vol", "buck", "s1", "s2", Some(&token), 10, false, false)
            .unwrap()
            .report
            .unwrap();
        assert_eq!(second.entries.len(), 10);
        assert!(
            first.entries.last().unwrap().key < second.entries.first().unwrap().key,
            "second page starts after the first ends"
        );
    }
}
