//! Mesh packet model
//!
//! The packet layout here is the binding contract with the channel
//! collaborator: a closed set of packet kinds, source/destination addressing,
//! an explicit next-hop field (`via`, possibly the broadcast address), a
//! last-hop identifier, a per-relay TTL and a sequence number. ROUTING
//! packets additionally carry a snapshot of the sender's best routes, and the
//! channel fills in a received-signal sample on delivery.

use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique node identifier within the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// Reserved address meaning "every node in range".
    pub const BROADCAST: NodeId = NodeId(16_777_215);

    /// Create a node ID from its raw address.
    pub fn new(id: u32) -> Self {
        NodeId(id)
    }

    /// Raw address value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// The closed set of packet kinds exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Application data.
    Data,
    /// Application-level acknowledgment of a delivered DATA packet.
    Ack,
    /// Periodic routing advertisement carrying a route snapshot.
    Routing,
    /// Reactive route request (flooded).
    Rreq,
    /// Reactive route reply (unicast back along the reverse path).
    Rrep,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketKind::Data => "DATA",
            PacketKind::Ack => "ACK",
            PacketKind::Routing => "ROUTING",
            PacketKind::Rreq => "RREQ",
            PacketKind::Rrep => "RREP",
        };
        write!(f, "{}", s)
    }
}

/// Key identifying a packet for duplicate suppression.
///
/// Two packets with equal keys are treated as copies of the same message.
/// Sequence wrap or reuse can in principle alias distinct messages; the
/// bounded-history equality check accepts that.
pub type DedupKey = (PacketKind, u32, NodeId, NodeId);

/// One route entry as carried on the air inside a ROUTING packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvertisedRoute {
    /// Destination the sender claims to reach.
    pub id: NodeId,
    /// Primary metric value (the only one for single-metric routing).
    pub primary: f64,
    /// Secondary metric value (dual-metric routing only, else 0).
    pub secondary: f64,
    /// Spreading factor of the advertised path (dual-metric routing only).
    pub sf: u8,
}

/// Assumed on-air size of one advertised route entry, used to cap how many
/// entries fit in a routing packet.
pub const ADVERTISED_ROUTE_BYTES: usize = 12;

/// Fixed header overhead assumed for every packet's payload accounting.
pub const PACKET_HEADER_BYTES: usize = 8;

/// A packet travelling between mesh nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Packet kind tag.
    pub kind: PacketKind,
    /// Originating node.
    pub source: NodeId,
    /// Final destination (may be `NodeId::BROADCAST`).
    pub destination: NodeId,
    /// Intended next hop; `NodeId::BROADCAST` means "anyone".
    pub via: NodeId,
    /// Node that transmitted this copy.
    pub last_hop: NodeId,
    /// Remaining hop budget; decremented once per relay.
    pub ttl: u8,
    /// Sequence / identifier. For ROUTING packets this is the sender's
    /// running advertisement count, sampled by receivers as the ETX sequence.
    /// For RREQ/RREP it is the discovery broadcast id.
    pub seq: u32,
    /// Payload size in bytes, used for airtime accounting.
    pub payload_bytes: usize,
    /// Time the current copy left its last hop.
    pub departure: SimTime,
    /// Route snapshot (ROUTING packets only, empty otherwise).
    pub routes: Vec<AdvertisedRoute>,
    /// Signal sample of the reception, filled by the channel on delivery.
    pub rssi: Option<f64>,
    /// Spreading-factor hint for dual-metric paths.
    pub sf: Option<u8>,
    /// Whether the sender asked for an application-level ACK (DATA only).
    pub ack_requested: bool,
}

impl Packet {
    /// Create a DATA packet. The next hop is resolved at transmission time.
    pub fn data(source: NodeId, destination: NodeId, seq: u32, payload_bytes: usize, ttl: u8) -> Self {
        Packet {
            kind: PacketKind::Data,
            source,
            destination,
            via: NodeId::BROADCAST,
            last_hop: source,
            ttl,
            seq,
            payload_bytes,
            departure: SimTime::ZERO,
            routes: Vec::new(),
            rssi: None,
            sf: None,
            ack_requested: false,
        }
    }

    /// Create an ACK packet answering a delivered DATA packet.
    pub fn ack(source: NodeId, destination: NodeId, seq: u32, ttl: u8) -> Self {
        Packet {
            kind: PacketKind::Ack,
            ..Packet::data(source, destination, seq, PACKET_HEADER_BYTES, ttl)
        }
    }

    /// Create a ROUTING advertisement carrying a route snapshot.
    pub fn routing(source: NodeId, seq: u32, routes: Vec<AdvertisedRoute>, ttl: u8) -> Self {
        let payload_bytes = PACKET_HEADER_BYTES + routes.len() * ADVERTISED_ROUTE_BYTES;
        Packet {
            kind: PacketKind::Routing,
            source,
            destination: NodeId::BROADCAST,
            via: NodeId::BROADCAST,
            last_hop: source,
            ttl,
            seq,
            payload_bytes,
            departure: SimTime::ZERO,
            routes,
            rssi: None,
            sf: None,
            ack_requested: false,
        }
    }

    /// Create a route request for `destination`, flooded from `source`.
    pub fn rreq(source: NodeId, destination: NodeId, broadcast_id: u32, ttl: u8) -> Self {
        Packet {
            kind: PacketKind::Rreq,
            source,
            destination,
            via: NodeId::BROADCAST,
            last_hop: source,
            ttl,
            seq: broadcast_id,
            payload_bytes: PACKET_HEADER_BYTES,
            departure: SimTime::ZERO,
            routes: Vec::new(),
            rssi: None,
            sf: None,
            ack_requested: false,
        }
    }

    /// Create a route reply travelling back toward the requester.
    pub fn rrep(source: NodeId, destination: NodeId, via: NodeId, broadcast_id: u32, ttl: u8) -> Self {
        Packet {
            kind: PacketKind::Rrep,
            source,
            destination,
            via,
            last_hop: source,
            ttl,
            seq: broadcast_id,
            payload_bytes: PACKET_HEADER_BYTES,
            departure: SimTime::ZERO,
            routes: Vec::new(),
            rssi: None,
            sf: None,
            ack_requested: false,
        }
    }

    /// Key for duplicate suppression.
    pub fn dedup_key(&self) -> DedupKey {
        (self.kind, self.seq, self.source, self.destination)
    }

    /// Whether the destination is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        assert_eq!(NodeId::BROADCAST.as_u32(), 16_777_215);
        assert!(NodeId::BROADCAST.is_broadcast());
        assert!(!NodeId::new(42).is_broadcast());
    }

    #[test]
    fn test_dedup_key_ignores_ttl() {
        let mut a = Packet::data(NodeId::new(1), NodeId::new(9), 7, 20, 10);
        let mut b = a.clone();
        a.ttl = 10;
        b.ttl = 3;
        b.last_hop = NodeId::new(5);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_dedup_key_distinguishes_kind() {
        let data = Packet::data(NodeId::new(1), NodeId::new(9), 7, 20, 10);
        let ack = Packet::ack(NodeId::new(1), NodeId::new(9), 7, 10);
        assert_ne!(data.dedup_key(), ack.dedup_key());
    }

    #[test]
    fn test_routing_payload_size() {
        let routes = vec![
            AdvertisedRoute { id: NodeId::new(2), primary: 1.0, secondary: 0.0, sf: 7 },
            AdvertisedRoute { id: NodeId::new(3), primary: 2.0, secondary: 0.0, sf: 7 },
        ];
        let pkt = Packet::routing(NodeId::new(1), 0, routes, 10);
        assert_eq!(pkt.payload_bytes, PACKET_HEADER_BYTES + 2 * ADVERTISED_ROUTE_BYTES);
        assert!(pkt.is_broadcast());
    }
}
