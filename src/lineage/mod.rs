//! # Compaction Lineage Tracker
//!
//! An append-only record of how segment files merge over time, kept so a
//! snapshot diff can touch only the segments that actually changed between
//! two checkpoints instead of re-reading the whole keyspace.
//!
//! ## Model
//!
//! The tracker owns a monotone sequence counter. Two producers advance it,
//! both called synchronously by the live store:
//!
//! - `record_flush` — a segment was born from the write buffer. Flush
//!   segments are the only carriers of *new* data.
//! - `record_compaction` — one event linking input segment ids to output
//!   segment ids. Compaction rearranges and garbage-collects; it never
//!   introduces keys.
//!
//! Checkpoints capture the counter (`cursor`) as their anchor. Given two
//! checkpoints' segment sets, [`LineageTracker::changed_segments`] walks the
//! DAG backward from each segment present only at `to`: reaching a segment
//! that already existed at `from` marks a boundary (its keys may have been
//! modified or deleted — it must be read); reaching a flush segment that did
//! not exist at `from` proves the starting segment carries new data. A `to`
//! segment whose entire ancestry lies inside the `from` set is a pure
//! rearrangement and is skipped.
//!
//! ## History retention
//!
//! Events at or below the oldest live snapshot anchor can never appear in a
//! diff interval again; [`LineageTracker::evict_up_to`] drops them, plus any
//! node kept alive only by those events. Callers gate eviction on the oldest
//! ACTIVE snapshot.
//!
//! ## Concurrency
//!
//! Reader-writer discipline: flushes and compactions are rare writers, diff
//! queries are frequent readers.


use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, trace};

use crate::segment::{SegmentId, SegmentMeta};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by lineage queries.
#[derive(Debug, Error)]
pub enum LineageError {
    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Graph data
// ------------------------------------------------------------------------------------------------

/// One compaction event: `inputs` were merged into `outputs` at `seq`.
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    /// Sequence number assigned when the event was recorded.
    pub seq: u64,
    /// Segments consumed by the compaction.
    pub inputs: Vec<SegmentId>,
    /// Segments the compaction produced.
    pub outputs: Vec<SegmentId>,
}

#[derive(Debug, Default)]
struct LineageInner {
    seq: u64,
    nodes: HashMap<SegmentId, SegmentMeta>,
    events: BTreeMap<u64, CompactionEvent>,
    /// Output segment id → seq of the event that produced it.
    producer: HashMap<SegmentId, u64>,
    /// Segments currently live in the store (not yet consumed by compaction).
    alive: HashSet<SegmentId>,
}

// ------------------------------------------------------------------------------------------------
// Tracker
// ------------------------------------------------------------------------------------------------

/// Lineage tracker for one live store. Constructed once per store and wired
/// explicitly — there is no global listener registry.
#[derive(Debug, Default)]
pub struct LineageTracker {
    inner: RwLock<LineageInner>,
}

impl LineageTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LineageInner>, LineageError> {
        self.inner
            .read()
            .map_err(|_| LineageError::Internal("lineage lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, LineageInner>, LineageError> {
        self.inner
            .write()
            .map_err(|_| LineageError::Internal("lineage lock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Producers (live store only)
    // --------------------------------------------------------------------------------------------

    /// Registers a segment born from a write-buffer flush. Returns the
    /// sequence number assigned to the birth.
    pub fn record_flush(&self, meta: SegmentMeta) -> Result<u64, LineageError> {
        let mut inner = self.write()?;
        inner.seq += 1;
        let seq = inner.seq;
        trace!(id = meta.id, seq, "lineage: flush");
        inner.alive.insert(meta.id);
        inner.nodes.insert(meta.id, meta);
        Ok(seq)
    }

    /// Appends one compaction event. `inputs` must be currently live;
    /// `outputs` become live in their place.
    pub fn record_compaction(
        &self,
        inputs: &[SegmentId],
        outputs: Vec<SegmentMeta>,
    ) -> Result<u64, LineageError> {
        let mut inner = self.write()?;
        inner.seq += 1;
        let seq = inner.seq;
        debug!(seq, ?inputs, outputs = outputs.len(), "lineage: compaction");

        let output_ids: Vec<SegmentId> = outputs.iter().map(|m| m.id).collect();
        for id in inputs {
            inner.alive.remove(id);
        }
        for meta in outputs {
            inner.alive.insert(meta.id);
            inner.producer.insert(meta.id, seq);
            inner.nodes.insert(meta.id, meta);
        }
        inner.events.insert(
            seq,
            CompactionEvent {
                seq,
                inputs: inputs.to_vec(),
                outputs: output_ids,
            },
        );
        Ok(seq)
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Current sequence cursor — the anchor recorded by new checkpoints.
    pub fn cursor(&self) -> Result<u64, LineageError> {
        Ok(self.read()?.seq)
    }

    /// Number of tracked segment nodes (read-only introspection).
    pub fn node_count(&self) -> Result<usize, LineageError> {
        Ok(self.read()?.nodes.len())
    }

    /// Number of retained compaction events (read-only introspection).
    pub fn event_count(&self) -> Result<usize, LineageError> {
        Ok(self.read()?.events.len())
    }

    /// Computes the minimal set of segment files that must be read to
    /// observe every key differing between two checkpoints, restricted to
    /// the key range `[range_start, range_end)`.
    ///
    /// `from` and `to` are the checkpoints' segment id sets. The result only
    /// ever names segments from those two sets — intermediate segments that
    /// were compacted away between the checkpoints are represented by their
    /// surviving descendants.
    ///
    /// False positives (an extra segment) are acceptable; false negatives
    /// are not. A segment with unknown metadata, or whose key range straddles
    /// the filter boundary, is kept whole.
    pub fn changed_segments(
        &self,
        from: &BTreeSet<SegmentId>,
        to: &BTreeSet<SegmentId>,
        range_start: &[u8],
        range_end: &[u8],
    ) -> Result<BTreeSet<SegmentId>, LineageError> {
        let inner = self.read()?;

        let in_range = |id: SegmentId| -> bool {
            match inner.nodes.get(&id) {
                Some(meta) => meta.overlaps(range_start, range_end),
                // Unknown segment: cannot exclude it.
                None => true,
            }
        };

        let mut result: BTreeSet<SegmentId> = BTreeSet::new();

        for &start in to.iter() {
            if from.contains(&start) || !in_range(start) {
                continue;
            }

            // Backward walk from this to-only segment. It must be read iff
            // any ancestry path ends at a segment that did not exist at
            // `from` — i.e. a post-`from` flush (or evicted history, which
            // cannot be excluded). An ancestry fully contained in the `from`
            // set is a pure rearrangement: compaction introduces no keys, so
            // the segment holds nothing the boundary does not already hold.
            let mut carries_new_data = false;
            let mut stack = vec![start];
            let mut visited: HashSet<SegmentId> = HashSet::new();
            while let Some(id) = stack.pop() {
                if !visited.insert(id) || from.contains(&id) {
                    continue;
                }
                match inner
                    .producer
                    .get(&id)
                    .and_then(|seq| inner.events.get(seq))
                {
                    Some(event) => stack.extend(event.inputs.iter().copied()),
                    None => carries_new_data = true,
                }
            }

            if carries_new_data {
                result.insert(start);
            }
        }

        // Boundary: every segment present at `from` and gone by `to`. Their
        // keys may have been modified or deleted since — including deletes
        // whose tombstones compaction already purged. Segments present in
        // both checkpoints are byte-identical on both sides and contribute
        // no candidates.
        for &id in from.difference(to) {
            if in_range(id) {
                result.insert(id);
            }
        }

        debug!(
            from = from.len(),
            to = to.len(),
            interesting = result.len(),
            "lineage: changed-segment query"
        );
        Ok(result)
    }

    // --------------------------------------------------------------------------------------------
    // Eviction
    // --------------------------------------------------------------------------------------------

    /// Drops events with `seq <= anchor` and any node only those events kept
    /// reachable. `anchor` must be the oldest live snapshot anchor — history
    /// above it is never touched.
    pub fn evict_up_to(&self, anchor: u64) -> Result<(), LineageError> {
        let mut inner = self.write()?;
        let LineageInner {
            events,
            nodes,
            producer,
            alive,
            ..
        } = &mut *inner;

        let drop_seqs: Vec<u64> = events.range(..=anchor).map(|(seq, _)| *seq).collect();
        if drop_seqs.is_empty() {
            return Ok(());
        }
        for seq in &drop_seqs {
            events.remove(seq);
        }

        // A node survives if it is live or still referenced by a retained
        // event.
        let mut referenced: HashSet<SegmentId> = alive.iter().copied().collect();
        for event in events.values() {
            referenced.extend(event.inputs.iter().copied());
            referenced.extend(event.outputs.iter().copied());
        }
        nodes.retain(|id, _| referenced.contains(id));
        producer.retain(|id, seq| referenced.contains(id) && events.contains_key(seq));

        debug!(
            anchor,
            dropped = drop_seqs.len(),
            nodes = nodes.len(),
            "lineage: evicted history"
        );
        Ok(())
    }
}
