//! Segment build / open / lookup / scan coverage.

#[cfg(test)]
mod tests {
    use crate::segment::{Segment, SegmentEntry, SegmentWriter, content_fingerprint};
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn entry(key: &str, value: Option<&str>, lsn: u64) -> SegmentEntry {
        SegmentEntry {
            key: key.as_bytes().to_vec(),
            value: value.map(|v| v.as_bytes().to_vec()),
            lsn,
        }
    }

    fn build(temp: &TempDir, id: u64, entries: Vec<SegmentEntry>) -> Segment {
        let path = temp.path().join(format!("{id:06}.seg"));
        let count = entries.len();
        SegmentWriter::new(&path, id)
            .build(entries.into_iter(), count)
            .expect("segment build failed");
        Segment::open(&path).expect("segment open failed")
    }

    // ================================================================
    // 1. Build + metadata
    // ================================================================

    #[test]
    fn build_records_key_range_and_counts() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let seg = build(
            &temp,
            7,
            vec![
                entry("a/k1", Some("v1"), 1),
                entry("a/k2", None, 2),
                entry("a/k3", Some("v3"), 3),
            ],
        );

        assert_eq!(seg.id(), 7);
        let meta = seg.meta();
        assert_eq!(meta.min_key, b"a/k1");
        assert_eq!(meta.max_key, b"a/k3");
        assert_eq!(meta.entry_count, 3);
    }

    #[test]
    fn empty_segment_round_trips() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let seg = build(&temp, 1, Vec::new());
        assert_eq!(seg.entry_count(), 0);
        assert!(seg.iter().next().is_none());
        assert!(seg.get(b"anything").unwrap().is_none());
    }

    // ================================================================
    // 2. Point lookups
    // ================================================================

    #[test]
    fn get_finds_values_and_tombstones() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let seg = build(
            &temp,
            1,
            vec![entry("k1", Some("v1"), 1), entry("k2", None, 2)],
        );

        let hit = seg.get(b"k1").unwrap().unwrap();
        assert_eq!(hit.value.as_deref(), Some(b"v1".as_slice()));
        assert_eq!(hit.lsn, 1);

        let tomb = seg.get(b"k2").unwrap().unwrap();
        assert!(tomb.is_tombstone());

        assert!(seg.get(b"k3").unwrap().is_none());
        assert!(seg.get(b"k0").unwrap().is_none());
    }

    // ================================================================
    // 3. Range scans
    // ================================================================

    #[test]
    fn scan_respects_bounds() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let entries: Vec<SegmentEntry> = (0..10)
            .map(|i| entry(&format!("k{i}"), Some("v"), i))
            .collect();
        let seg = build(&temp, 1, entries);

        let keys: Vec<Vec<u8>> = seg
            .scan(b"k3", b"k7")
            .unwrap()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"k3".to_vec(), b"k4".to_vec(), b"k5".to_vec(), b"k6".to_vec()]);
    }

    #[test]
    fn full_iter_is_ascending() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let entries: Vec<SegmentEntry> = (0..50)
            .map(|i| entry(&format!("k{i:03}"), Some("v"), i))
            .collect();
        let seg = build(&temp, 1, entries);

        let keys: Vec<Vec<u8>> = seg.iter().map(|e| e.key).collect();
        assert_eq!(keys.len(), 50);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    // ================================================================
    // 4. Fingerprints
    // ================================================================

    #[test]
    fn fingerprint_tracks_content_not_key() {
        assert_eq!(
            content_fingerprint(b"same bytes"),
            content_fingerprint(b"same bytes")
        );
        assert_ne!(
            content_fingerprint(b"same bytes"),
            content_fingerprint(b"other bytes")
        );
    }
}
