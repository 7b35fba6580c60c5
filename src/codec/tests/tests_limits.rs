//! Safety-limit tests: corrupted length prefixes must not allocate.

#[cfg(test)]
mod tests {
    use crate::codec::{self, CodecError, Encode, MAX_ITEM_LEN, MAX_SEQ_LEN};

    #[test]
    fn oversized_byte_length_is_rejected() {
        let mut buf = Vec::new();
        (MAX_ITEM_LEN + 1).encode(&mut buf).unwrap();
        // No payload follows — the limit check must fire before allocation.
        let err = codec::from_slice::<Vec<u8>>(&buf).unwrap_err();
        assert!(matches!(err, CodecError::LengthLimit { .. }));
    }

    #[test]
    fn oversized_seq_count_is_rejected() {
        let mut buf = Vec::new();
        (MAX_SEQ_LEN + 1).encode(&mut buf).unwrap();
        let err = codec::decode_seq::<u64>(&buf).unwrap_err();
        assert!(matches!(err, CodecError::LengthLimit { .. }));
    }

    #[test]
    fn byte_length_within_limit_but_missing_payload() {
        let mut buf = Vec::new();
        16u32.encode(&mut buf).unwrap();
        buf.extend_from_slice(&[0u8; 4]); // only 4 of 16 bytes present

        let err = codec::from_slice::<Vec<u8>>(&buf).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
