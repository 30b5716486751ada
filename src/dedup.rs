//! Deconfliction engine: duplicate removal and clock-skew correction.
//!
//! Peers share no common clock, so the same physical observation can appear
//! twice with different timestamps. Duplicates are the only skew evidence we
//! have: when a pair straddles this node and a peer, the timestamp delta IS
//! that peer's clock offset. Offsets are discovered once and never refined;
//! later duplicates involving a known peer only apply the existing offset.
//!
//! Sign convention throughout: `offset(peer) = peer timestamp - self
//! timestamp` for the same physical event. Correcting a peer record into our
//! time basis subtracts its offset; converting our store into the leader's
//! basis adds the leader's offset.
//!
//! The engine owns the offset table explicitly and takes the store as an
//! argument, so every operation is testable in isolation.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::data::{is_duplicate, PlotRecord, PlotStore};

/// Duplicate detection and skew correction over a shared plot store.
#[derive(Debug, Default)]
pub struct Deconflictor {
    /// Discovered offsets by node id, in seconds of `peer - self`.
    offsets: HashMap<u32, f64>,
    self_id: u32,
    leader_id: u32,
    /// Total number of nodes (self included) at election time; bounds how
    /// many offsets the transitive discovery path may create.
    expected_nodes: usize,
    configured: bool,
}

impl Deconflictor {
    /// Create an unconfigured engine. [`Deconflictor::configure`] must run
    /// before any pass that depends on offsets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the offset table with our own id at offset zero and record the
    /// election outcome for later alignment.
    pub fn configure(&mut self, self_id: u32, leader_id: u32, expected_nodes: usize) {
        self.self_id = self_id;
        self.leader_id = leader_id;
        self.expected_nodes = expected_nodes;
        self.offsets.insert(self_id, 0.0);
        self.configured = true;
        info!(
            self_id,
            leader_id, expected_nodes, "deconfliction engine configured"
        );
    }

    /// Discovered offset for `node_id`, if known.
    pub fn offset_of(&self, node_id: u32) -> Option<f64> {
        self.offsets.get(&node_id).copied()
    }

    /// Number of known offsets, self included.
    pub fn known_offsets(&self) -> usize {
        self.offsets.len()
    }

    /// One full deduplication pass over the store.
    ///
    /// Pairwise scan; quadratic, but batches are small and the pass runs per
    /// inserted record so the store is never far from clean. For each
    /// duplicate pair the later-indexed record is discarded, after the pair
    /// has been mined for skew evidence. Erasure shifts later records down,
    /// so the inner pointer restarts at the outer position rather than
    /// skipping an entry. Finishes by re-sorting the store by time.
    pub fn deduplicate(&mut self, store: &mut PlotStore) {
        let mut i = 0;
        while i < store.len() {
            let mut j = i + 1;
            while j < store.len() {
                let dup = match (store.get(i), store.get(j)) {
                    (Some(a), Some(b)) => is_duplicate(a, b),
                    _ => false,
                };
                if dup {
                    self.mine_skew(store, i, j);
                    store.erase(j);
                    j = i + 1;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        store.sort_by_time();
    }

    /// Apply an already-known offset to a record at ingest time. Records
    /// from peers with no known offset pass through unchanged; they are
    /// corrected retroactively once the offset is discovered.
    pub fn apply_known_skew(&self, rec: &mut PlotRecord) {
        if let Some(offset) = self.offsets.get(&rec.node_id) {
            rec.timestamp = shift(rec.timestamp, -offset);
        }
    }

    /// Shift the whole store into the leader's time basis. No-op when this
    /// node is the leader or the leader's offset was never discovered.
    pub fn align_to_leader(&self, store: &mut PlotStore) {
        if !self.configured || self.self_id == self.leader_id {
            return;
        }
        let Some(offset) = self.offsets.get(&self.leader_id).copied() else {
            debug!(leader = self.leader_id, "leader offset unknown, skipping alignment");
            return;
        };
        info!(leader = self.leader_id, offset, "aligning store to leader time");
        for rec in store.iter_mut() {
            rec.timestamp = shift(rec.timestamp, offset);
        }
    }

    /// Try to turn a duplicate pair into a new offset entry before the
    /// later record is erased.
    ///
    /// Direct case: exactly one of the pair is ours, so the other node's
    /// delta against us is its offset. Transitive case: neither is ours but
    /// one node's offset is already known; its record is already in our
    /// basis, so it anchors the unknown node the same way. The transitive
    /// path only runs while offsets are still missing.
    fn mine_skew(&mut self, store: &mut PlotStore, i: usize, j: usize) {
        let (a, b) = match (store.get(i), store.get(j)) {
            (Some(a), Some(b)) => (*a, *b),
            _ => return,
        };

        let a_is_self = a.node_id == self.self_id;
        let b_is_self = b.node_id == self.self_id;

        let (anchor, candidate) = if a_is_self != b_is_self {
            if a_is_self { (a, b) } else { (b, a) }
        } else if !a_is_self && self.offsets.len() < self.expected_nodes {
            let a_known = self.offsets.contains_key(&a.node_id);
            let b_known = self.offsets.contains_key(&b.node_id);
            match (a_known, b_known) {
                (true, false) => (a, b),
                (false, true) => (b, a),
                _ => return,
            }
        } else {
            return;
        };

        if self.offsets.contains_key(&candidate.node_id) {
            return;
        }

        let offset = (candidate.timestamp - anchor.timestamp) as f64;
        info!(
            peer = candidate.node_id,
            offset, "discovered clock offset from duplicate pair"
        );
        self.correct_past_records(store, candidate.node_id, offset);
        self.offsets.insert(candidate.node_id, offset);
    }

    /// Rewrite history for a peer whose offset was just discovered. Every
    /// stored record of that peer gets the offset subtracted exactly once;
    /// the caller inserts the offset entry afterwards, which guarantees
    /// this runs at most once per peer.
    fn correct_past_records(&self, store: &mut PlotStore, peer: u32, offset: f64) {
        let mut corrected = 0;
        for rec in store.iter_mut() {
            if rec.node_id == peer {
                rec.timestamp = shift(rec.timestamp, -offset);
                corrected += 1;
            }
        }
        debug!(peer, offset, corrected, "corrected historical records");
    }
}

/// Shift an integer timestamp by a (whole-second valued) float offset.
fn shift(timestamp: i64, delta: f64) -> i64 {
    (timestamp as f64 + delta).round() as i64
}
