//! Checkpoint creation and the read-only checkpoint view.

#[cfg(test)]
mod tests {
    use crate::store::{Checkpoint, LiveStore, is_checkpoint_dir};
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn open(temp: &TempDir) -> LiveStore {
        LiveStore::open(temp.path().join("live"), 1024 * 1024).expect("store open failed")
    }

    // ================================================================
    // 1. Checkpoint is a frozen copy
    // ================================================================

    /// # Scenario
    /// Checkpoint, then keep mutating the live store.
    ///
    /// # Expected behavior
    /// The checkpoint keeps serving the state at creation time.
    #[test]
    fn checkpoint_is_immutable_under_live_writes() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let store = open(&temp);

        store.put(b"k1".to_vec(), b"v1".to_vec()).unwrap();
        let ckpt_dir = temp.path().join("ckpt");
        store.checkpoint(&ckpt_dir).unwrap();
        assert!(is_checkpoint_dir(&ckpt_dir));

        store.put(b"k1".to_vec(), b"changed".to_vec()).unwrap();
        store.put(b"k2".to_vec(), b"new".to_vec()).unwrap();
        store.flush().unwrap();
        store.compact().unwrap();

        let ckpt = Checkpoint::open(&ckpt_dir).unwrap();
        assert_eq!(ckpt.get(b"k1").unwrap().as_deref(), Some(b"v1".as_slice()));
        assert!(ckpt.get(b"k2").unwrap().is_none());
    }

    #[test]
    fn checkpoint_flushes_the_buffer_first() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let store = open(&temp);

        store.put(b"buffered".to_vec(), b"v".to_vec()).unwrap();
        let ckpt_dir = temp.path().join("ckpt");
        store.checkpoint(&ckpt_dir).unwrap();

        let ckpt = Checkpoint::open(&ckpt_dir).unwrap();
        assert_eq!(
            ckpt.get(b"buffered").unwrap().as_deref(),
            Some(b"v".as_slice())
        );
    }

    // ================================================================
    // 2. Checkpoint properties
    // ================================================================

    #[test]
    fn checkpoint_records_anchor_and_disables_compaction() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let store = open(&temp);

        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        store.flush().unwrap();
        let cursor = store.lineage().cursor().unwrap();

        let ckpt_dir = temp.path().join("ckpt");
        store.checkpoint(&ckpt_dir).unwrap();

        let ckpt = Checkpoint::open(&ckpt_dir).unwrap();
        assert!(ckpt.compaction_disabled());
        assert_eq!(ckpt.lineage_anchor(), cursor);
        assert_eq!(ckpt.segment_ids().len(), 1);
    }

    /// Opening a checkpoint must not feed events into the live tracker.
    #[test]
    fn checkpoint_open_emits_no_lineage_events() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let store = open(&temp);

        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        let ckpt_dir = temp.path().join("ckpt");
        store.checkpoint(&ckpt_dir).unwrap();

        let before = store.lineage().cursor().unwrap();
        let _ckpt = Checkpoint::open(&ckpt_dir).unwrap();
        assert_eq!(store.lineage().cursor().unwrap(), before);
    }

    // ================================================================
    // 3. Merged range iteration
    // ================================================================

    #[test]
    fn iter_range_resolves_versions_and_tombstones() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let store = open(&temp);

        store.put(b"a/1".to_vec(), b"old".to_vec()).unwrap();
        store.put(b"a/2".to_vec(), b"gone".to_vec()).unwrap();
        store.flush().unwrap();
        store.put(b"a/1".to_vec(), b"new".to_vec()).unwrap();
        store.delete(b"a/2".to_vec()).unwrap();
        store.put(b"a/3".to_vec(), b"three".to_vec()).unwrap();
        store.put(b"b/1".to_vec(), b"other".to_vec()).unwrap();

        let ckpt_dir = temp.path().join("ckpt");
        store.checkpoint(&ckpt_dir).unwrap();
        let ckpt = Checkpoint::open(&ckpt_dir).unwrap();

        let pairs: Vec<(Vec<u8>, Vec<u8>)> =
            ckpt.iter_range(b"a/", b"a0").unwrap().collect();
        assert_eq!(
            pairs,
            vec![
                (b"a/1".to_vec(), b"new".to_vec()),
                (b"a/3".to_vec(), b"three".to_vec()),
            ]
        );
    }

    // ================================================================
    // 4. Deferred purge
    // ================================================================

    /// # Scenario
    /// Mark a checkpoint for purge while a second handle is open.
    ///
    /// # Expected behavior
    /// The directory survives until the last handle drops.
    #[test]
    fn purge_waits_for_last_handle() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let store = open(&temp);

        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        let ckpt_dir = temp.path().join("ckpt");
        store.checkpoint(&ckpt_dir).unwrap();

        let reader = std::sync::Arc::new(Checkpoint::open(&ckpt_dir).unwrap());
        let holder = std::sync::Arc::clone(&reader);

        reader.purge_on_drop();
        drop(reader);
        assert!(ckpt_dir.exists(), "held checkpoint must not be removed");

        drop(holder);
        assert!(!ckpt_dir.exists(), "released checkpoint must be removed");
    }
}
