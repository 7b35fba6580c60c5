//! # Segment Files
//!
//! An immutable, sorted unit of key-value data. Segments are produced by the
//! live store's flush path and by compaction, copied verbatim into snapshot
//! checkpoints, and read by the diff engine.
//!
//! ## On-disk layout
//!
//! ```text
//! [4B magic "VSEG"][4B version LE]
//! [entry 1][entry 2]…                 — codec-encoded, ascending key order
//! [u32 count][u64 offset]…            — absolute offset of every entry
//! [bloom bytes]                       — serialized bloom filter over keys
//! [props]                             — id, key range, entry/tombstone counts
//! [u64 index_off][u64 bloom_off][u64 props_off][u32 crc32]
//! ```
//!
//! The trailing CRC covers every byte before it; a segment that fails the
//! check is rejected at open. Entries are decoded lazily through a read-only
//! `mmap`, so iteration never materializes the whole file.
//!
//! ## Versioning
//!
//! Each entry carries the LSN assigned by the live store's write path. When
//! several segments hold the same key, the reader with the highest LSN wins;
//! a `None` value is a tombstone.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::codec::{self, CodecError, Decode, Encode};

const SEGMENT_MAGIC: &[u8; 4] = b"VSEG";
const SEGMENT_VERSION: u32 = 1;
const FOOTER_LEN: usize = 8 + 8 + 8 + 4;
const BLOOM_FP_RATE: f64 = 0.01;

/// Unique id of a segment file within one store.
pub type SegmentId = u64;

/// CRC32 content fingerprint used by the diff engine's rename heuristic.
pub fn content_fingerprint(value: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(value);
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The file-wide CRC did not match.
    #[error("segment checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Structurally invalid segment file.
    #[error("invalid segment: {0}")]
    Invalid(String),
}

// ------------------------------------------------------------------------------------------------
// Entries and metadata
// ------------------------------------------------------------------------------------------------

/// A single versioned key-value record. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Full composite key (`volume/bucket/key`).
    pub key: Vec<u8>,
    /// Live value, or `None` for a deletion marker.
    pub value: Option<Vec<u8>>,
    /// Write sequence number; higher wins across segments.
    pub lsn: u64,
}

impl SegmentEntry {
    /// True when this entry marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

impl Encode for SegmentEntry {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.key.encode(buf)?;
        self.value.encode(buf)?;
        self.lsn.encode(buf)?;
        Ok(())
    }
}

impl Decode for SegmentEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode(&buf[offset..])?;
        offset += n;
        let (value, n) = Option::<Vec<u8>>::decode(&buf[offset..])?;
        offset += n;
        let (lsn, n) = u64::decode(&buf[offset..])?;
        offset += n;
        Ok((Self { key, value, lsn }, offset))
    }
}

/// Descriptive metadata for one segment — what the lineage tracker and
/// checkpoint manifests record about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Segment id, unique within the store.
    pub id: SegmentId,
    /// Smallest key in the segment.
    pub min_key: Vec<u8>,
    /// Largest key in the segment.
    pub max_key: Vec<u8>,
    /// Total entries, tombstones included.
    pub entry_count: u64,
}

impl SegmentMeta {
    /// True when this segment's key range intersects `[start, end)`.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.min_key.as_slice() < end && self.max_key.as_slice() >= start
    }
}

impl Encode for SegmentMeta {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.id.encode(buf)?;
        self.min_key.encode(buf)?;
        self.max_key.encode(buf)?;
        self.entry_count.encode(buf)?;
        Ok(())
    }
}

impl Decode for SegmentMeta {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut offset = 0;
        let (id, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (min_key, n) = Vec::<u8>::decode(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Vec::<u8>::decode(&buf[offset..])?;
        offset += n;
        let (entry_count, n) = u64::decode(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                min_key,
                max_key,
                entry_count,
            },
            offset,
        ))
    }
}

#[derive(Debug)]
struct SegmentProps {
    id: SegmentId,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    entry_count: u64,
    tombstone_count: u64,
    max_lsn: u64,
}

impl Encode for SegmentProps {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.id.encode(buf)?;
        self.min_key.encode(buf)?;
        self.max_key.encode(buf)?;
        self.entry_count.encode(buf)?;
        self.tombstone_count.encode(buf)?;
        self.max_lsn.encode(buf)?;
        Ok(())
    }
}

impl Decode for SegmentProps {
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut offset = 0;
        let (id, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (min_key, n) = Vec::<u8>::decode(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Vec::<u8>::decode(&buf[offset..])?;
        offset += n;
        let (entry_count, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (tombstone_count, n) = u64::decode(&buf[offset..])?;
        offset += n;
        let (max_lsn, n) = u64::decode(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                min_key,
                max_key,
                entry_count,
                tombstone_count,
                max_lsn,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Builds one segment file from an ascending, deduplicated entry stream.
pub struct SegmentWriter {
    path: std::path::PathBuf,
    id: SegmentId,
}

impl SegmentWriter {
    /// Prepares a writer for segment `id` at `path`.
    pub fn new(path: impl AsRef<Path>, id: SegmentId) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            id,
        }
    }

    /// Writes `entries` (ascending key order, one entry per key) and returns
    /// the resulting metadata. `count` must equal the stream length — it
    /// sizes the bloom filter.
    pub fn build(
        self,
        entries: impl Iterator<Item = SegmentEntry>,
        count: usize,
    ) -> Result<SegmentMeta, SegmentError> {
        let mut bloom = Bloom::new_for_fp_rate(count.max(1), BLOOM_FP_RATE)
            .map_err(|e| SegmentError::Invalid(e.to_string()))?;

        let mut body = Vec::new();
        body.extend_from_slice(SEGMENT_MAGIC);
        body.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());

        let mut offsets: Vec<u64> = Vec::with_capacity(count);
        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Vec<u8> = Vec::new();
        let mut tombstone_count = 0u64;
        let mut max_lsn = 0u64;

        for entry in entries {
            offsets.push(body.len() as u64);
            bloom.set(&entry.key);
            if min_key.is_none() {
                min_key = Some(entry.key.clone());
            }
            max_key = entry.key.clone();
            if entry.is_tombstone() {
                tombstone_count += 1;
            }
            max_lsn = max_lsn.max(entry.lsn);
            entry.encode(&mut body)?;
        }

        let index_off = body.len() as u64;
        (offsets.len() as u32).encode(&mut body)?;
        for off in &offsets {
            off.encode(&mut body)?;
        }

        let bloom_off = body.len() as u64;
        bloom.as_slice().to_vec().encode(&mut body)?;

        let props_off = body.len() as u64;
        let props = SegmentProps {
            id: self.id,
            min_key: min_key.unwrap_or_default(),
            max_key,
            entry_count: offsets.len() as u64,
            tombstone_count,
            max_lsn,
        };
        props.encode(&mut body)?;

        body.extend_from_slice(&index_off.to_le_bytes());
        body.extend_from_slice(&bloom_off.to_le_bytes());
        body.extend_from_slice(&props_off.to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let checksum = hasher.finalize();
        body.extend_from_slice(&checksum.to_le_bytes());

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&body)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        debug!(
            id = self.id,
            entries = props.entry_count,
            tombstones = props.tombstone_count,
            path = %self.path.display(),
            "segment built"
        );

        Ok(SegmentMeta {
            id: props.id,
            min_key: props.min_key,
            max_key: props.max_key,
            entry_count: props.entry_count,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// A read-only, mmap-backed view of one segment file.
pub struct Segment {
    mmap: Mmap,
    offsets: Vec<u64>,
    bloom_bytes: Vec<u8>,
    props: SegmentProps,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.props.id)
            .field("entries", &self.props.entry_count)
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Opens and validates a segment file.
    ///
    /// The `unsafe` mmap is sound: segments are immutable once built, and
    /// the mapping is read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < 8 + FOOTER_LEN {
            return Err(SegmentError::Invalid(format!(
                "{}: too short ({} bytes)",
                path.display(),
                mmap.len()
            )));
        }
        if &mmap[..4] != SEGMENT_MAGIC {
            return Err(SegmentError::Invalid(format!(
                "{}: bad magic",
                path.display()
            )));
        }
        let version = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]);
        if version != SEGMENT_VERSION {
            return Err(SegmentError::Invalid(format!(
                "{}: unsupported version {version}",
                path.display()
            )));
        }

        let crc_start = mmap.len() - 4;
        let mut hasher = Crc32::new();
        hasher.update(&mmap[..crc_start]);
        let stored = u32::from_le_bytes([
            mmap[crc_start],
            mmap[crc_start + 1],
            mmap[crc_start + 2],
            mmap[crc_start + 3],
        ]);
        if hasher.finalize() != stored {
            return Err(SegmentError::ChecksumMismatch(path.display().to_string()));
        }

        let footer_start = mmap.len() - FOOTER_LEN;
        let read_u64 = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&mmap[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        let index_off = read_u64(footer_start) as usize;
        let bloom_off = read_u64(footer_start + 8) as usize;
        let props_off = read_u64(footer_start + 16) as usize;
        if index_off > bloom_off || bloom_off > props_off || props_off > footer_start {
            return Err(SegmentError::Invalid(format!(
                "{}: inconsistent footer offsets",
                path.display()
            )));
        }

        let (count, mut cursor) = u32::decode(&mmap[index_off..])?;
        let mut offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (off, n) = u64::decode(&mmap[index_off + cursor..])?;
            cursor += n;
            offsets.push(off);
        }

        let (bloom_bytes, _) = Vec::<u8>::decode(&mmap[bloom_off..])?;
        let (props, _) = SegmentProps::decode(&mmap[props_off..])?;

        Ok(Self {
            mmap,
            offsets,
            bloom_bytes,
            props,
        })
    }

    /// Segment id recorded at build time.
    pub fn id(&self) -> SegmentId {
        self.props.id
    }

    /// Descriptive metadata for this segment.
    pub fn meta(&self) -> SegmentMeta {
        SegmentMeta {
            id: self.props.id,
            min_key: self.props.min_key.clone(),
            max_key: self.props.max_key.clone(),
            entry_count: self.props.entry_count,
        }
    }

    /// Total entries, tombstones included.
    pub fn entry_count(&self) -> u64 {
        self.props.entry_count
    }

    /// Highest LSN stored in this segment.
    pub fn max_lsn(&self) -> u64 {
        self.props.max_lsn
    }

    /// Bloom filter pre-check. `false` means the key is definitely absent;
    /// `true` means "maybe" (and always `true` on a corrupt filter).
    pub fn bloom_may_contain(&self, key: &[u8]) -> bool {
        if self.bloom_bytes.is_empty() {
            return true;
        }
        match Bloom::from_slice(&self.bloom_bytes) {
            Ok(bloom) => bloom.check(&key.to_vec()),
            Err(_) => true,
        }
    }

    fn entry_at(&self, idx: usize) -> Result<SegmentEntry, SegmentError> {
        let off = self.offsets[idx] as usize;
        let (entry, _) = codec::from_slice::<SegmentEntry>(&self.mmap[off..])?;
        Ok(entry)
    }

    fn key_at(&self, idx: usize) -> Result<Vec<u8>, SegmentError> {
        let off = self.offsets[idx] as usize;
        let (key, _) = Vec::<u8>::decode(&self.mmap[off..])?;
        Ok(key)
    }

    /// Index of the first entry with key ≥ `key`.
    fn lower_bound(&self, key: &[u8]) -> Result<usize, SegmentError> {
        let mut lo = 0usize;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid)?.as_slice() < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Point lookup. Returns the entry (possibly a tombstone) or `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<SegmentEntry>, SegmentError> {
        if !self.bloom_may_contain(key) {
            return Ok(None);
        }
        let idx = self.lower_bound(key)?;
        if idx >= self.offsets.len() {
            return Ok(None);
        }
        let entry = self.entry_at(idx)?;
        if entry.key == key {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Streaming iterator over entries with keys in `[start, end)`.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<SegmentIter<'_>, SegmentError> {
        let begin = self.lower_bound(start)?;
        Ok(SegmentIter {
            segment: self,
            next: begin,
            end: end.to_vec(),
        })
    }

    /// Streaming iterator over every entry in the segment.
    pub fn iter(&self) -> SegmentIter<'_> {
        let mut end = self.props.max_key.clone();
        end.push(0xFF);
        SegmentIter {
            segment: self,
            next: 0,
            end,
        }
    }
}

/// Iterator over a key range of one segment, ascending.
pub struct SegmentIter<'a> {
    segment: &'a Segment,
    next: usize,
    end: Vec<u8>,
}

impl Iterator for SegmentIter<'_> {
    type Item = SegmentEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.segment.offsets.len() {
            return None;
        }
        let entry = self.segment.entry_at(self.next).ok()?;
        if entry.key >= self.end {
            return None;
        }
        self.next += 1;
        Some(entry)
    }
}
