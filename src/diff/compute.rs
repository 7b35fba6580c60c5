//! Diff computation: candidate collection, classification, and rename
//! collapsing.
//!
//! Two strategies produce the same ordered entry stream:
//!
//! - **Segment-filtered** (the default): the lineage tracker names the
//!   interesting segments; every key they hold inside the bucket range is a
//!   candidate, and each candidate is resolved against both checkpoints'
//!   authoritative views.
//! - **Full** (`force_full_diff`): a two-cursor merge over both checkpoints'
//!   live views of the bucket range.
//!
//! Classification is shared: a key live only at `to` is a CREATE, only at
//! `from` a DELETE, live at both with different bytes a MODIFY. A final pass
//! pairs DELETEs with CREATEs carrying the same content fingerprint and
//! collapses each pair into one RENAME.
//!
//! Cancellation is cooperative: the caller's probe runs once per key batch,
//! and a positive answer abandons the computation with nothing persisted.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::debug;

use crate::segment::{SegmentId, content_fingerprint};
use crate::store::{Checkpoint, LiveStoreError};

use super::{DiffEntry, DiffType};

/// How many keys are processed between two cancellation probes.
const CANCEL_CHECK_INTERVAL: usize = 64;

/// Result of a diff computation: either the full ordered entry list or an
/// acknowledgement that the job was cancelled under it.
#[derive(Debug)]
pub(crate) enum ComputeOutcome {
    Finished(Vec<DiffEntry>),
    Cancelled,
}

/// One classified key before rename collapsing.
#[derive(Debug)]
struct RawEntry {
    diff_type: DiffType,
    key: Vec<u8>,
    fingerprint: Option<u32>,
}

/// Collects every candidate key held by the interesting segments of either
/// checkpoint, restricted to `[start, end)`.
pub(crate) fn collect_candidates(
    from: &Checkpoint,
    to: &Checkpoint,
    interesting: &BTreeSet<SegmentId>,
    start: &[u8],
    end: &[u8],
) -> Result<BTreeSet<Vec<u8>>, LiveStoreError> {
    let mut candidates = BTreeSet::new();
    for checkpoint in [from, to] {
        for segment in checkpoint.segments() {
            if !interesting.contains(&segment.id()) {
                continue;
            }
            for entry in segment.scan(start, end)? {
                candidates.insert(entry.key);
            }
        }
    }
    debug!(candidates = candidates.len(), "collected diff candidates");
    Ok(candidates)
}

/// Resolves each candidate against both checkpoints and classifies it.
/// Candidates arrive in ascending order, so the output is ordered too.
pub(crate) fn classify_candidates(
    from: &Checkpoint,
    to: &Checkpoint,
    candidates: BTreeSet<Vec<u8>>,
    prefix_len: usize,
    should_cancel: &dyn Fn() -> bool,
) -> Result<ComputeOutcome, LiveStoreError> {
    let mut raw = Vec::new();
    for (index, key) in candidates.into_iter().enumerate() {
        if index % CANCEL_CHECK_INTERVAL == 0 && should_cancel() {
            return Ok(ComputeOutcome::Cancelled);
        }
        let before = from.get(&key)?;
        let after = to.get(&key)?;
        if let Some(entry) = classify(key, before, after) {
            raw.push(entry);
        }
    }
    Ok(ComputeOutcome::Finished(collapse_renames(raw, prefix_len)))
}

/// Full-keyspace comparison: merge-iterate both live views in lock step.
pub(crate) fn full_diff(
    from: &Checkpoint,
    to: &Checkpoint,
    start: &[u8],
    end: &[u8],
    prefix_len: usize,
    should_cancel: &dyn Fn() -> bool,
) -> Result<ComputeOutcome, LiveStoreError> {
    let mut from_iter = from.iter_range(start, end)?.peekable();
    let mut to_iter = to.iter_range(start, end)?.peekable();

    let mut raw = Vec::new();
    let mut steps = 0usize;
    loop {
        if steps % CANCEL_CHECK_INTERVAL == 0 && should_cancel() {
            return Ok(ComputeOutcome::Cancelled);
        }
        steps += 1;

        let entry = match (from_iter.peek(), to_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => {
                let (key, value) = from_iter.next().unwrap_or_default();
                classify(key, Some(value), None)
            }
            (None, Some(_)) => {
                let (key, value) = to_iter.next().unwrap_or_default();
                classify(key, None, Some(value))
            }
            (Some((fk, _)), Some((tk, _))) => {
                if fk < tk {
                    let (key, value) = from_iter.next().unwrap_or_default();
                    classify(key, Some(value), None)
                } else if fk > tk {
                    let (key, value) = to_iter.next().unwrap_or_default();
                    classify(key, None, Some(value))
                } else {
                    let (key, before) = from_iter.next().unwrap_or_default();
                    let (_, after) = to_iter.next().unwrap_or_default();
                    classify(key, Some(before), Some(after))
                }
            }
        };
        if let Some(entry) = entry {
            raw.push(entry);
        }
    }
    Ok(ComputeOutcome::Finished(collapse_renames(raw, prefix_len)))
}

/// CREATE / DELETE / MODIFY classification for one key. `None` when the key
/// is identical on both sides.
fn classify(key: Vec<u8>, before: Option<Vec<u8>>, after: Option<Vec<u8>>) -> Option<RawEntry> {
    match (before, after) {
        (None, Some(value)) => Some(RawEntry {
            diff_type: DiffType::Create,
            key,
            fingerprint: Some(content_fingerprint(&value)),
        }),
        (Some(value), None) => Some(RawEntry {
            diff_type: DiffType::Delete,
            key,
            fingerprint: Some(content_fingerprint(&value)),
        }),
        (Some(before), Some(after)) if before != after => Some(RawEntry {
            diff_type: DiffType::Modify,
            key,
            fingerprint: None,
        }),
        _ => None,
    }
}

/// Pairs DELETEs with CREATEs of identical content and collapses each pair
/// into a RENAME. Matching runs in ascending key order and every CREATE is
/// consumed at most once, so the result is deterministic; unmatched entries
/// pass through unchanged. Output is re-sorted by primary key.
fn collapse_renames(raw: Vec<RawEntry>, prefix_len: usize) -> Vec<DiffEntry> {
    // Fingerprint → indices of unconsumed CREATEs, in key order.
    let mut creates_by_fingerprint: HashMap<u32, VecDeque<usize>> = HashMap::new();
    for (index, entry) in raw.iter().enumerate() {
        if entry.diff_type == DiffType::Create {
            if let Some(fp) = entry.fingerprint {
                creates_by_fingerprint.entry(fp).or_default().push_back(index);
            }
        }
    }

    let mut consumed: Vec<bool> = vec![false; raw.len()];
    let mut renames: HashMap<usize, usize> = HashMap::new(); // delete idx → create idx
    for (index, entry) in raw.iter().enumerate() {
        if entry.diff_type != DiffType::Delete {
            continue;
        }
        let Some(fp) = entry.fingerprint else { continue };
        if let Some(queue) = creates_by_fingerprint.get_mut(&fp) {
            if let Some(create_index) = queue.pop_front() {
                consumed[create_index] = true;
                renames.insert(index, create_index);
            }
        }
    }

    let key_str = |key: &[u8]| String::from_utf8_lossy(&key[prefix_len.min(key.len())..]).into_owned();

    let mut entries = Vec::with_capacity(raw.len());
    for (index, entry) in raw.iter().enumerate() {
        if consumed[index] {
            continue; // folded into a RENAME
        }
        if let Some(&create_index) = renames.get(&index) {
            entries.push(DiffEntry {
                diff_type: DiffType::Rename,
                key: key_str(&entry.key),
                target: Some(key_str(&raw[create_index].key)),
            });
        } else {
            entries.push(DiffEntry {
                diff_type: entry.diff_type,
                key: key_str(&entry.key),
                target: None,
            });
        }
    }

    entries.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.diff_type.cmp(&b.diff_type)));
    entries
}
