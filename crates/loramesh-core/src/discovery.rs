//! Reactive path discovery (AODV-style, reduced).
//!
//! When metric-table routing has no current route for an outgoing DATA
//! packet, the node floods a route request and parks the packet until a
//! reply arrives. Each destination moves through a small state machine:
//!
//! ```text
//!   NoRoute ──start──▶ Discovering ──reply──▶ RouteLocked
//!      ▲                    │                     │
//!      └─────timeout────────┘      lock expiry────┘ (lazy, on lookup)
//! ```
//!
//! A discovery wave is identified by `(origin, broadcast_id)`. The first
//! RREQ copy of a wave fixes the reverse parent at every node it crosses;
//! later copies are dropped and never overwrite it. A successful reply locks
//! the chosen next hop for a bounded window, during which the lock overrides
//! whatever the metric table says.

use crate::packet::{NodeId, Packet};
use crate::time::SimTime;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Per-destination discovery phase.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Discovering { deadline: SimTime },
    RouteLocked { next_hop: NodeId, expires: SimTime },
}

/// Reactive discovery state for one node.
#[derive(Debug)]
pub struct Discovery {
    own_id: NodeId,
    timeout: f64,
    history_capacity: usize,
    next_broadcast_id: u32,
    /// Waves already processed, keyed `(origin, broadcast_id)`, oldest first.
    /// Bounded; the oldest wave and its reverse parent are evicted together.
    seen: VecDeque<(NodeId, u32)>,
    /// First-seen upstream neighbor per wave.
    reverse_parent: HashMap<(NodeId, u32), NodeId>,
    /// Absent key means `NoRoute`.
    phase: HashMap<NodeId, Phase>,
    /// DATA parked per destination awaiting a route.
    buffered: HashMap<NodeId, VecDeque<Packet>>,
}

impl Discovery {
    pub fn new(own_id: NodeId, timeout: f64, history_capacity: usize) -> Self {
        Discovery {
            own_id,
            timeout,
            history_capacity,
            next_broadcast_id: 0,
            seen: VecDeque::with_capacity(history_capacity),
            reverse_parent: HashMap::new(),
            phase: HashMap::new(),
            buffered: HashMap::new(),
        }
    }

    // Records a wave key, evicting the oldest on overflow. Returns `false`
    // for a key still in the history.
    fn note_wave(&mut self, key: (NodeId, u32)) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.seen.len() >= self.history_capacity {
            if let Some(old) = self.seen.pop_front() {
                self.reverse_parent.remove(&old);
            }
        }
        self.seen.push_back(key);
        true
    }

    /// Locked next hop for `dest`, if a lock exists and has not expired.
    pub fn locked_next_hop(&self, dest: NodeId, now: SimTime) -> Option<NodeId> {
        match self.phase.get(&dest) {
            Some(Phase::RouteLocked { next_hop, expires }) if now < *expires => Some(*next_hop),
            _ => None,
        }
    }

    /// Whether a discovery for `dest` is currently outstanding.
    pub fn is_discovering(&self, dest: NodeId, now: SimTime) -> bool {
        matches!(self.phase.get(&dest), Some(Phase::Discovering { deadline }) if now < *deadline)
    }

    /// Start a discovery for `dest` and return its fresh broadcast id. The
    /// caller must have checked `is_discovering` first and floods the RREQ.
    pub fn begin(&mut self, dest: NodeId, now: SimTime) -> u32 {
        let id = self.next_broadcast_id;
        self.next_broadcast_id += 1;
        self.note_wave((self.own_id, id));
        self.phase.insert(dest, Phase::Discovering { deadline: now + self.timeout });
        debug!(dest = %dest, broadcast_id = id, "starting route discovery");
        id
    }

    /// Park an outgoing DATA packet until a route to its destination exists.
    pub fn buffer_data(&mut self, packet: Packet) {
        self.buffered.entry(packet.destination).or_default().push_back(packet);
    }

    /// Record an RREQ wave crossing this node. Returns `false` for a
    /// duplicate copy of an already-seen wave. For a new wave the reverse
    /// parent is fixed to `last_hop` and never overwritten.
    pub fn note_rreq(&mut self, origin: NodeId, broadcast_id: u32, last_hop: NodeId) -> bool {
        let key = (origin, broadcast_id);
        if !self.note_wave(key) {
            trace!(origin = %origin, broadcast_id, "duplicate discovery wave");
            return false;
        }
        self.reverse_parent.insert(key, last_hop);
        true
    }

    /// Upstream neighbor recorded for a wave, used to route the reply back.
    pub fn reverse_parent(&self, origin: NodeId, broadcast_id: u32) -> Option<NodeId> {
        self.reverse_parent.get(&(origin, broadcast_id)).copied()
    }

    /// Lock `next_hop` as the pinned route to `dest` until `expires`, and
    /// hand back the parked DATA in arrival order.
    pub fn lock_and_flush(&mut self, dest: NodeId, next_hop: NodeId, expires: SimTime) -> VecDeque<Packet> {
        debug!(dest = %dest, next_hop = %next_hop, expires = %expires, "locking discovered route");
        self.phase.insert(dest, Phase::RouteLocked { next_hop, expires });
        self.buffered.remove(&dest).unwrap_or_default()
    }

    /// Expire timed-out discoveries, dropping their parked packets.
    /// Returns the number of packets dropped.
    pub fn expire(&mut self, now: SimTime) -> usize {
        let timed_out: Vec<NodeId> = self
            .phase
            .iter()
            .filter_map(|(dest, phase)| match phase {
                Phase::Discovering { deadline } if *deadline <= now => Some(*dest),
                _ => None,
            })
            .collect();

        let mut dropped = 0;
        for dest in timed_out {
            self.phase.remove(&dest);
            let parked = self.buffered.remove(&dest).map(|q| q.len()).unwrap_or(0);
            dropped += parked;
            debug!(dest = %dest, parked, "route discovery timed out");
        }
        dropped
    }

    /// Number of discoveries that have timed out by `now` (without expiring
    /// them).
    pub fn timed_out_count(&self, now: SimTime) -> usize {
        self.phase
            .values()
            .filter(|p| matches!(p, Phase::Discovering { deadline } if *deadline <= now))
            .count()
    }

    /// Total parked packets across destinations.
    pub fn buffered_len(&self) -> usize {
        self.buffered.values().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: f64) -> SimTime {
        SimTime::from_secs(secs)
    }

    #[test]
    fn test_one_discovery_per_destination() {
        let mut d = Discovery::new(NodeId::new(1), 30.0, 64);
        assert!(!d.is_discovering(NodeId::new(9), t(0.0)));
        let id = d.begin(NodeId::new(9), t(0.0));
        assert!(d.is_discovering(NodeId::new(9), t(5.0)));
        // Own wave is marked seen so our flooded copy is not reprocessed.
        assert!(!d.note_rreq(NodeId::new(1), id, NodeId::new(1)));
    }

    #[test]
    fn test_first_seen_parent_wins() {
        let mut d = Discovery::new(NodeId::new(4), 30.0, 64);
        assert!(d.note_rreq(NodeId::new(1), 0, NodeId::new(2)));
        // Duplicate copy of the same wave via another neighbor.
        assert!(!d.note_rreq(NodeId::new(1), 0, NodeId::new(3)));
        assert_eq!(d.reverse_parent(NodeId::new(1), 0), Some(NodeId::new(2)));

        // A different wave from the same origin records its own parent.
        assert!(d.note_rreq(NodeId::new(1), 1, NodeId::new(3)));
        assert_eq!(d.reverse_parent(NodeId::new(1), 1), Some(NodeId::new(3)));
    }

    #[test]
    fn test_wave_history_evicts_oldest() {
        let mut d = Discovery::new(NodeId::new(4), 30.0, 2);
        assert!(d.note_rreq(NodeId::new(1), 0, NodeId::new(2)));
        assert!(d.note_rreq(NodeId::new(1), 1, NodeId::new(2)));
        assert!(d.note_rreq(NodeId::new(1), 2, NodeId::new(3)));

        // Wave 0 fell out of the history along with its reverse parent.
        assert_eq!(d.reverse_parent(NodeId::new(1), 0), None);
        assert!(d.note_rreq(NodeId::new(1), 0, NodeId::new(3)));
        // Recent waves are still remembered.
        assert_eq!(d.reverse_parent(NodeId::new(1), 2), Some(NodeId::new(3)));
        assert!(!d.note_rreq(NodeId::new(1), 2, NodeId::new(2)));
    }

    #[test]
    fn test_lock_expires_lazily() {
        let mut d = Discovery::new(NodeId::new(1), 30.0, 64);
        d.begin(NodeId::new(9), t(0.0));
        d.lock_and_flush(NodeId::new(9), NodeId::new(2), t(100.0));

        assert_eq!(d.locked_next_hop(NodeId::new(9), t(50.0)), Some(NodeId::new(2)));
        assert_eq!(d.locked_next_hop(NodeId::new(9), t(100.0)), None);
        assert_eq!(d.locked_next_hop(NodeId::new(9), t(150.0)), None);
    }

    #[test]
    fn test_flush_preserves_arrival_order() {
        let mut d = Discovery::new(NodeId::new(1), 30.0, 64);
        d.begin(NodeId::new(9), t(0.0));
        for seq in 0..3 {
            d.buffer_data(Packet::data(NodeId::new(1), NodeId::new(9), seq, 20, 8));
        }
        let flushed = d.lock_and_flush(NodeId::new(9), NodeId::new(2), t(100.0));
        let seqs: Vec<u32> = flushed.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(d.buffered_len(), 0);
    }

    #[test]
    fn test_timeout_drops_buffered_and_allows_retry() {
        let mut d = Discovery::new(NodeId::new(1), 30.0, 64);
        d.begin(NodeId::new(9), t(0.0));
        d.buffer_data(Packet::data(NodeId::new(1), NodeId::new(9), 0, 20, 8));
        d.buffer_data(Packet::data(NodeId::new(1), NodeId::new(9), 1, 20, 8));

        assert_eq!(d.expire(t(10.0)), 0);
        assert_eq!(d.expire(t(30.0)), 2);
        assert!(!d.is_discovering(NodeId::new(9), t(30.0)));

        // A later send may start a fresh discovery with a new id.
        let id = d.begin(NodeId::new(9), t(40.0));
        assert_eq!(id, 1);
    }
}
