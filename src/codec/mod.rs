//! Deterministic binary encoding for all persisted metadata.
//!
//! Every durable structure in the crate (table ops log, table snapshots,
//! segment trailers, checkpoint manifests) goes through the [`Encode`] and
//! [`Decode`] traits defined here. The format is hand-written and byte-stable:
//! upgrading a dependency can never silently change what is on disk.
//!
//! # Wire format
//!
//! | Rust type         | Encoding                                 |
//! |-------------------|------------------------------------------|
//! | `u8`              | 1 byte                                   |
//! | `u32`             | 4 bytes, little-endian                   |
//! | `u64`             | 8 bytes, little-endian                   |
//! | `bool`            | 1 byte (`0x00` = false, `0x01` = true)   |
//! | `Vec<u8>`         | `[u32 len][bytes]`                       |
//! | `String`          | `[u32 len][utf-8 bytes]`                 |
//! | `Option<T>`       | `[u8 tag: 0=None, 1=Some][T if Some]`    |
//! | `Vec<T>`          | `[u32 count][T₁][T₂]…` (free functions)  |
//! | `enum`            | `[u8 variant][fields…]` (hand-written)   |
//!
//! Variable-length decoders enforce [`MAX_ITEM_LEN`] and [`MAX_SEQ_LEN`] so a
//! corrupted length prefix cannot trigger an allocation bomb. No function in
//! this module panics; all failures surface as [`CodecError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Maximum byte length accepted for a single `Vec<u8>` or `String` (64 MiB).
pub const MAX_ITEM_LEN: u32 = 64 * 1024 * 1024;

/// Maximum element count accepted for a `Vec<T>` of structs (1 M).
pub const MAX_SEQ_LEN: u32 = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ended before the value was fully decoded.
    #[error("truncated input (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum discriminant byte was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u8,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// A decoded length prefix exceeded its safety limit.
    #[error("length {len} exceeds limit {limit}")]
    LengthLimit {
        /// The length that was read.
        len: u32,
        /// The limit it violated.
        limit: u32,
    },

    /// String bytes were not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A value cannot be represented in the wire format.
    #[error("unencodable value: {0}")]
    Unencodable(String),
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Append the deterministic byte representation of `self` to `buf`.
///
/// The same logical value must always produce the same bytes.
pub trait Encode {
    /// Serialize into `buf`.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError>;
}

/// Decode one value from the front of `buf`.
///
/// Returns the value and the number of bytes consumed so callers can walk a
/// buffer holding several encoded items.
pub trait Decode: Sized {
    /// Deserialize from `buf[0..]`.
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError>;
}

/// Encode a value into a fresh `Vec<u8>`.
pub fn to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    value.encode(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`, returning `(value, consumed)`.
pub fn from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), CodecError> {
    T::decode(buf)
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn need(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[inline]
fn len_prefix(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::Unencodable(format!("length {len} exceeds u32")))
}

// ------------------------------------------------------------------------------------------------
// Primitives
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        need(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        need(buf, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        Ok((u32::from_le_bytes(bytes), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        need(buf, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        Ok((u64::from_le_bytes(bytes), 8))
    }
}

impl Encode for bool {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        need(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(CodecError::InvalidTag {
                tag: other,
                type_name: "bool",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Byte strings and text
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        len_prefix(self.len())?.encode(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (len, mut offset) = u32::decode(buf)?;
        if len > MAX_ITEM_LEN {
            return Err(CodecError::LengthLimit {
                len,
                limit: MAX_ITEM_LEN,
            });
        }
        let len = len as usize;
        need(&buf[offset..], len)?;
        let data = buf[offset..offset + len].to_vec();
        offset += len;
        Ok((data, offset))
    }
}

impl Encode for String {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        len_prefix(self.len())?.encode(buf)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Decode for String {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (raw, consumed) = Vec::<u8>::decode(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

impl Encode for &str {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        len_prefix(self.len())?.encode(buf)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Option<T>
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            None => buf.push(0),
            Some(value) => {
                buf.push(1);
                value.encode(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        need(buf, 1)?;
        match buf[0] {
            0 => Ok((None, 1)),
            1 => {
                let (value, consumed) = T::decode(&buf[1..])?;
                Ok((Some(value), 1 + consumed))
            }
            other => Err(CodecError::InvalidTag {
                tag: other,
                type_name: "Option<T>",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sequences of structs: [u32 count][T₁][T₂]…
//
// `Vec<u8>` has the raw-bytes impl above; coherence prevents a blanket impl
// from coexisting with it, so struct sequences use these free functions.
// ------------------------------------------------------------------------------------------------

/// Encode a slice of `T` as `[u32 count][T₁][T₂]…`.
pub fn encode_seq<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), CodecError> {
    len_prefix(items.len())?.encode(buf)?;
    for item in items {
        item.encode(buf)?;
    }
    Ok(())
}

/// Decode a `Vec<T>` written by [`encode_seq`], enforcing [`MAX_SEQ_LEN`].
pub fn decode_seq<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), CodecError> {
    let (count, mut offset) = u32::decode(buf)?;
    if count > MAX_SEQ_LEN {
        return Err(CodecError::LengthLimit {
            len: count,
            limit: MAX_SEQ_LEN,
        });
    }
    let count = count as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let (item, consumed) = T::decode(&buf[offset..])?;
        offset += consumed;
        items.push(item);
    }
    Ok((items, offset))
}
