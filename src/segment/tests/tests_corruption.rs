//! Corruption handling: a damaged segment must be rejected at open, never
//! served.

#[cfg(test)]
mod tests {
    use crate::segment::{Segment, SegmentEntry, SegmentError, SegmentWriter};
    use std::fs;
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn build_one(temp: &TempDir) -> std::path::PathBuf {
        let path = temp.path().join("000001.seg");
        let entries = vec![SegmentEntry {
            key: b"k".to_vec(),
            value: Some(b"v".to_vec()),
            lsn: 1,
        }];
        SegmentWriter::new(&path, 1)
            .build(entries.into_iter(), 1)
            .unwrap();
        path
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let path = build_one(&temp);

        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = Segment::open(&path).unwrap_err();
        assert!(matches!(err, SegmentError::ChecksumMismatch(_)));
    }

    #[test]
    fn truncated_file_is_invalid() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let path = build_one(&temp);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..10]).unwrap();

        let err = Segment::open(&path).unwrap_err();
        assert!(matches!(err, SegmentError::Invalid(_)));
    }

    #[test]
    fn bad_magic_is_invalid() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let path = build_one(&temp);

        let mut bytes = fs::read(&path).unwrap();
        bytes[0] = b'X';
        fs::write(&path, &bytes).unwrap();

        let err = Segment::open(&path).unwrap_err();
        assert!(matches!(err, SegmentError::Invalid(_)));
    }
}
