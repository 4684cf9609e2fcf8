//! Per-node operational counters.

use crate::time::SimTime;
use serde::{Deserialize, Serialize};

/// Counters accumulated by a node over its lifetime.
///
/// Drop reasons are counted rather than reported as errors; the driver reads
/// a snapshot of this struct after (or during) a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStats {
    /// Own DATA packets transmitted.
    pub sent_data: u64,
    /// ACK packets transmitted.
    pub sent_acks: u64,
    /// ROUTING advertisements transmitted.
    pub sent_routing: u64,
    /// Packets relayed on behalf of other nodes.
    pub sent_forwarded: u64,
    /// Route requests transmitted (originated or relayed).
    pub sent_rreq: u64,
    /// Route replies transmitted (originated or relayed).
    pub sent_rrep: u64,

    /// DATA packets received (any addressing).
    pub received_data: u64,
    /// DATA packets addressed to this node.
    pub received_data_for_me: u64,
    /// Distinct DATA packets delivered to the application.
    pub received_data_unique: u64,
    /// ACK packets delivered to this node.
    pub received_acks: u64,
    /// ROUTING advertisements received.
    pub received_routing: u64,
    /// Route requests received.
    pub received_rreq: u64,
    /// Route replies received.
    pub received_rrep: u64,
    /// Copies of packets this node itself originated.
    pub received_own_source: u64,

    /// Forward rejections: queue at capacity.
    pub forward_buffer_full: u64,
    /// Forward rejections: already forwarded or already queued.
    pub forward_duplicates: u64,
    /// Forward rejections: arriving TTL too low to relay.
    pub forward_ttl_expired: u64,
    /// Unicast packets overheard with someone else as next hop.
    pub unicast_wrong_next_hop_drops: u64,
    /// Sends abandoned for lack of a route (strict-unicast mode).
    pub unicast_no_route_drops: u64,
    /// Sends that fell back to broadcast for lack of a route.
    pub broadcast_fallbacks: u64,

    /// Route discoveries started.
    pub discoveries_started: u64,
    /// Discoveries that timed out without a reply.
    pub discovery_timeouts: u64,
    /// Buffered DATA packets dropped when their discovery timed out.
    pub buffered_dropped_on_timeout: u64,
    /// Route replies dropped for lack of a recorded reverse parent.
    pub rrep_no_reverse_drops: u64,

    /// Route entries purged by sanitization.
    pub routes_purged: u64,
    /// Inbound packets discarded after the node failed.
    pub dropped_while_failed: u64,

    /// When the table first reached the convergence threshold, if ever.
    pub converged_at: Option<SimTime>,
}

impl NodeStats {
    /// Total transmissions of any kind.
    pub fn total_sent(&self) -> u64 {
        self.sent_data
            + self.sent_acks
            + self.sent_routing
            + self.sent_forwarded
            + self.sent_rreq
            + self.sent_rrep
    }
}
