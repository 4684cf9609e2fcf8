//! Per-node mesh engine.
//!
//! `MeshNode` wires the route table, maintenance, discovery, forwarding and
//! scheduler together behind two entry points: `on_packet_received` for
//! inbound traffic and `advance_to` for time. Everything mutates
//! synchronously inside those handlers; a "wait" is always a future wake-up,
//! never a blocking call. The external driver owns the clock: it asks
//! `next_wakeup()` and advances each node explicitly, which keeps runs fully
//! deterministic under a fixed seed.
//!
//! ```text
//!                 ┌───────────────────────────────┐
//!   inbound ────▶ │ dispatch: RREQ/RREP, deliver, │
//!                 │ advertisement, forward-accept │
//!                 ├───────────────┬───────────────┤
//!                 │ RoutingState  │  Discovery    │
//!                 │ (table+maint) │  (AODV-lite)  │
//!                 ├───────────────┴───────────────┤
//!   wake-up ────▶ │ Scheduler: pick category,     │──▶ Channel
//!                 │ duty cycle, single deadline   │
//!                 └───────────────────────────────┘
//! ```

use crate::airtime::AirtimeModel;
use crate::config::{DestinationPolicy, NodeConfig, Role};
use crate::coordinator::Coordinator;
use crate::discovery::Discovery;
use crate::error::{ConfigError, MeshError};
use crate::forwarding::ForwardingEngine;
use crate::maintenance::RoutingState;
use crate::packet::{DedupKey, NodeId, Packet, PacketKind};
use crate::scheduler::{Pending, Scheduler, SendCategory};
use crate::stats::NodeStats;
use crate::time::SimTime;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Signal sample assumed when the channel supplies none.
const DEFAULT_RSSI_DBM: f64 = -100.0;

/// The channel/MAC collaborator a node transmits through.
pub trait Channel {
    /// Whether the medium is currently free.
    fn is_idle(&self) -> bool;
    /// Hand a packet to the medium, fire-and-forget.
    fn transmit(&mut self, from: NodeId, packet: Packet, airtime: f64);
}

/// Upcalls and observations surfaced to the driver/application layer.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A packet left this node.
    Transmitted { packet: Packet, airtime: f64 },
    /// A DATA packet addressed here was delivered (once per distinct packet).
    Delivered { source: NodeId, seq: u32 },
    /// An application ACK addressed here arrived.
    AckDelivered { source: NodeId, seq: u32 },
    /// The route table first reached the convergence threshold.
    Converged { at: SimTime },
    /// The node failed permanently.
    Failed { at: SimTime },
}

// Outcome of next-hop resolution for an outgoing DATA/ACK packet.
enum Resolved {
    Send,
    StartDiscovery,
    Drop,
}

/// One mesh node: a single-threaded, event-driven state machine.
pub struct MeshNode<C: Channel> {
    cfg: NodeConfig,
    routing: RoutingState,
    discovery: Discovery,
    forwarding: ForwardingEngine,
    scheduler: Scheduler,
    coordinator: Arc<Coordinator>,
    airtime_model: Box<dyn AirtimeModel>,
    channel: C,
    rng: SmallRng,
    stats: NodeStats,

    own_queue: VecDeque<Packet>,
    ctrl_queue: VecDeque<Packet>,
    delivered: VecDeque<DedupKey>,
    own_seq: u32,
    advert_seq: u32,
    data_remaining: u32,

    failed: bool,
    failure_at: Option<SimTime>,
}

impl<C: Channel> MeshNode<C> {
    /// Build a node from a validated configuration.
    pub fn new(
        cfg: NodeConfig,
        coordinator: Arc<Coordinator>,
        channel: C,
        airtime_model: Box<dyn AirtimeModel>,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let mut rng = SmallRng::seed_from_u64(seed);

        if cfg.sends_advertisements() {
            coordinator.register_participant();
        }

        let failure_at = cfg.failure_start.map(|start| {
            let jitter = cfg.failure_jitter.map(|d| d.sample(&mut rng)).unwrap_or(0.0);
            SimTime::from_secs(start + jitter)
        });

        let mut scheduler = Scheduler::new(&cfg);
        if cfg.packets_to_send > 0 {
            let first = cfg.first_data_delay.sample(&mut rng);
            scheduler.set_next_allowed(SendCategory::OwnData, SimTime::ZERO + first);
        }
        if cfg.sends_advertisements() {
            let first = cfg.first_advert_delay.sample(&mut rng);
            scheduler.set_next_allowed(SendCategory::Advert, SimTime::ZERO + first);
        }

        let mut node = MeshNode {
            routing: RoutingState::new(&cfg),
            discovery: Discovery::new(cfg.node_id, cfg.discovery_timeout, cfg.discovery_history_size),
            forwarding: ForwardingEngine::new(cfg.forward_queue_size, cfg.forwarded_history_size),
            scheduler,
            coordinator,
            airtime_model,
            channel,
            rng,
            stats: NodeStats::default(),
            own_queue: VecDeque::new(),
            ctrl_queue: VecDeque::new(),
            delivered: VecDeque::new(),
            own_seq: 0,
            advert_seq: 0,
            data_remaining: cfg.packets_to_send,
            failed: false,
            failure_at,
            cfg,
        };
        let pending = node.pending();
        node.scheduler.rearm(SimTime::ZERO, pending);
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn routing(&self) -> &RoutingState {
        &self.routing
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Earliest internal event (wake-up or failure), for the driver.
    pub fn next_wakeup(&self) -> Option<SimTime> {
        if self.failed {
            return None;
        }
        match (self.scheduler.deadline(), self.failure_at) {
            (Some(d), Some(f)) => Some(d.min(f)),
            (Some(d), None) => Some(d),
            (None, f) => f,
        }
    }

    /// Enqueue an own DATA packet from the application layer.
    pub fn accept_outbound_payload(
        &mut self,
        destination: NodeId,
        size_bytes: usize,
        ack_requested: bool,
        now: SimTime,
    ) {
        if self.failed {
            return;
        }
        let mut packet = Packet::data(self.node_id(), destination, self.own_seq, size_bytes, self.cfg.packet_ttl);
        packet.ack_requested = ack_requested;
        self.own_seq += 1;
        self.own_queue.push_back(packet);
        let pending = self.pending();
        self.scheduler.rearm(now, pending);
    }

    /// Advance this node's clock to `t`, firing due wake-ups (and the
    /// failure event) in order.
    pub fn advance_to(&mut self, t: SimTime) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while !self.failed {
            let wake = self.scheduler.deadline().filter(|&d| d <= t);
            let fail = self.failure_at.filter(|&f| f <= t);
            match (wake, fail) {
                // Failure wins ties: it cancels the pending wake-up.
                (_, Some(f)) if wake.map_or(true, |w| f <= w) => {
                    self.fail(f, &mut events);
                }
                (Some(w), _) => self.on_wake(w, &mut events),
                (None, _) => break,
            }
        }
        events
    }

    /// Inbound packet from the channel.
    pub fn on_packet_received(&mut self, packet: Packet, now: SimTime) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        if self.failed {
            self.stats.dropped_while_failed += 1;
            return events;
        }
        if packet.kind == PacketKind::Data {
            self.stats.received_data += 1;
        }
        trace!(
            node = %self.node_id(), kind = %packet.kind, source = %packet.source,
            dest = %packet.destination, via = %packet.via, "packet received"
        );

        match packet.kind {
            PacketKind::Rreq => self.handle_rreq(&packet, now),
            PacketKind::Rrep => self.handle_rrep(&packet, now),
            PacketKind::Routing => {
                self.stats.received_routing += 1;
                let rssi = packet.rssi.unwrap_or(DEFAULT_RSSI_DBM);
                let sf = packet.sf.unwrap_or(self.cfg.radio.sf);
                let converged = self.routing.apply_advertisement(
                    packet.last_hop,
                    rssi,
                    sf,
                    packet.seq,
                    &packet.routes,
                    now,
                );
                if converged {
                    self.report_converged(now, &mut events);
                }
            }
            PacketKind::Data | PacketKind::Ack => {
                self.refresh_routes_from_data(&packet, now, &mut events);
                if packet.source == self.node_id() {
                    self.stats.received_own_source += 1;
                } else if packet.destination == self.node_id() {
                    self.deliver(&packet, now, &mut events);
                } else if packet.destination.is_broadcast() {
                    // Broadcast traffic is delivered everywhere and relayed
                    // by forwarding nodes under TTL and dedup control.
                    self.deliver(&packet, now, &mut events);
                    if self.forwards() {
                        self.try_forward(packet.clone());
                    }
                } else if self.forwards() {
                    if packet.via == self.node_id() || packet.via.is_broadcast() {
                        self.try_forward(packet.clone());
                    } else {
                        self.stats.unicast_wrong_next_hop_drops += 1;
                    }
                }
            }
        }

        let pending = self.pending();
        self.scheduler.rearm(now, pending);
        events
    }

    // Whether this node relays traffic at all.
    fn forwards(&self) -> bool {
        self.cfg.role == Role::Relay
    }

    fn pending(&self) -> Pending {
        Pending {
            own_data: !self.own_queue.is_empty() || self.data_remaining > 0,
            forward: self.forwarding.has_pending(),
            advert: self.cfg.sends_advertisements() && !self.coordinator.advertisements_suppressed(),
            control: !self.ctrl_queue.is_empty(),
        }
    }

    fn report_converged(&mut self, now: SimTime, events: &mut Vec<NodeEvent>) {
        self.stats.converged_at = Some(now);
        self.coordinator.report_converged();
        events.push(NodeEvent::Converged { at: now });
        debug!(node = %self.node_id(), at = %now, "routing table converged");
    }

    fn refresh_routes_from_data(&mut self, packet: &Packet, now: SimTime, events: &mut Vec<NodeEvent>) {
        if !self.cfg.routes_from_data_packets || packet.last_hop == self.node_id() {
            return;
        }
        let rssi = packet.rssi.unwrap_or(DEFAULT_RSSI_DBM);
        if self.routing.refresh_from_data(packet.last_hop, rssi, packet.seq, now) {
            self.report_converged(now, events);
        }
    }

    // Remembers a delivered packet so later copies are suppressed; the
    // oldest key is evicted on overflow. Returns `true` for a first copy.
    fn note_delivered(&mut self, key: DedupKey) -> bool {
        if self.delivered.contains(&key) {
            return false;
        }
        if self.delivered.len() >= self.cfg.delivered_history_size {
            self.delivered.pop_front();
        }
        self.delivered.push_back(key);
        true
    }

    fn deliver(&mut self, packet: &Packet, _now: SimTime, events: &mut Vec<NodeEvent>) {
        match packet.kind {
            PacketKind::Data => {
                self.stats.received_data_for_me += 1;
                if self.note_delivered(packet.dedup_key()) {
                    self.stats.received_data_unique += 1;
                    events.push(NodeEvent::Delivered { source: packet.source, seq: packet.seq });
                    if packet.ack_requested && !packet.source.is_broadcast() {
                        let ack = Packet::ack(self.node_id(), packet.source, packet.seq, self.cfg.packet_ttl);
                        self.own_queue.push_back(ack);
                    }
                }
            }
            PacketKind::Ack => {
                self.stats.received_acks += 1;
                if self.note_delivered(packet.dedup_key()) {
                    events.push(NodeEvent::AckDelivered { source: packet.source, seq: packet.seq });
                }
            }
            _ => {}
        }
    }

    fn try_forward(&mut self, packet: Packet) {
        match self.forwarding.enqueue(packet) {
            Ok(()) => {}
            Err(MeshError::ForwardBufferFull) => self.stats.forward_buffer_full += 1,
            Err(MeshError::DuplicatePacket) => self.stats.forward_duplicates += 1,
            Err(MeshError::TtlExpired) => self.stats.forward_ttl_expired += 1,
        }
    }

    fn handle_rreq(&mut self, packet: &Packet, now: SimTime) {
        self.stats.received_rreq += 1;
        if !self.cfg.route_discovery {
            return;
        }
        if packet.source == self.node_id() {
            self.stats.received_own_source += 1;
            return;
        }
        if !self.discovery.note_rreq(packet.source, packet.seq, packet.last_hop) {
            return;
        }
        // Reverse route to the origin via whichever neighbor delivered the
        // first copy of the wave.
        self.routing.install_discovery_route(packet.source, packet.last_hop, now);

        if packet.destination == self.node_id() {
            if let Some(parent) = self.discovery.reverse_parent(packet.source, packet.seq) {
                let rrep = Packet::rrep(self.node_id(), packet.source, parent, packet.seq, self.cfg.packet_ttl);
                self.ctrl_queue.push_back(rrep);
            }
        } else if packet.ttl > 1 {
            let mut relay = packet.clone();
            relay.ttl -= 1;
            relay.via = NodeId::BROADCAST;
            self.ctrl_queue.push_back(relay);
        }
    }

    fn handle_rrep(&mut self, packet: &Packet, now: SimTime) {
        self.stats.received_rrep += 1;
        if !self.cfg.route_discovery {
            return;
        }
        // Only the addressed next hop or the final destination may act.
        if packet.via != self.node_id() && packet.destination != self.node_id() {
            return;
        }
        // Forward route to the path's true destination (the replier).
        self.routing.install_discovery_route(packet.source, packet.last_hop, now);

        if packet.destination == self.node_id() {
            let route = self.routing.table().best_single_to(packet.source, now);
            let (next_hop, expires) = match route {
                Some(r) => (r.via, r.valid),
                None => (packet.last_hop, now + self.cfg.route_timeout),
            };
            let flushed = self.discovery.lock_and_flush(packet.source, next_hop, expires);
            for parked in flushed {
                self.own_queue.push_back(parked);
            }
        } else if packet.ttl > 1 {
            match self.discovery.reverse_parent(packet.destination, packet.seq) {
                Some(parent) => {
                    let mut relay = packet.clone();
                    relay.ttl -= 1;
                    relay.via = parent;
                    self.ctrl_queue.push_back(relay);
                }
                // Never flooded: without a reverse parent the reply dies here.
                None => self.stats.rrep_no_reverse_drops += 1,
            }
        } else {
            self.stats.forward_ttl_expired += 1;
        }
    }

    fn fail(&mut self, at: SimTime, events: &mut Vec<NodeEvent>) {
        debug!(node = %self.node_id(), at = %at, "node failed");
        self.failed = true;
        self.failure_at = None;
        self.scheduler.cancel();
        events.push(NodeEvent::Failed { at });
    }

    fn on_wake(&mut self, now: SimTime, events: &mut Vec<NodeEvent>) {
        // Lazy timeout evaluation happens on wake, not per-entry timers.
        let timed_out = self.discovery.timed_out_count(now);
        if timed_out > 0 {
            self.stats.discovery_timeouts += timed_out as u64;
            self.stats.buffered_dropped_on_timeout += self.discovery.expire(now) as u64;
        }
        self.stats.routes_purged += self.routing.sanitize(now) as u64;

        let pending = self.pending();
        if !pending.any() {
            self.scheduler.rearm(now, pending);
            return;
        }
        if !self.channel.is_idle() {
            self.scheduler.defer_busy(now);
            return;
        }

        match self.scheduler.pick(now, pending, &mut self.rng) {
            Some(SendCategory::Control) => {
                if let Some(packet) = self.ctrl_queue.pop_front() {
                    self.transmit(packet, SendCategory::Control, 0.0, now, events);
                }
            }
            Some(SendCategory::Advert) => {
                let routes = self.routing.build_advertisement(now);
                let mut packet = Packet::routing(self.node_id(), self.advert_seq, routes, self.cfg.packet_ttl);
                packet.sf = Some(self.cfg.radio.sf);
                self.advert_seq += 1;
                let draw = self.cfg.advert_interval.sample(&mut self.rng);
                self.transmit(packet, SendCategory::Advert, draw, now, events);
            }
            Some(SendCategory::OwnData) => {
                if let Some(mut packet) = self.next_own_packet() {
                    match self.resolve_via(&mut packet, now, true) {
                        Resolved::Send => {
                            let draw = self.cfg.data_interval.sample(&mut self.rng);
                            self.transmit(packet, SendCategory::OwnData, draw, now, events);
                        }
                        Resolved::StartDiscovery => self.park_for_discovery(packet, now),
                        Resolved::Drop => self.stats.unicast_no_route_drops += 1,
                    }
                }
            }
            Some(SendCategory::Forward) => {
                if let Some(mut packet) = self.forwarding.pop_next() {
                    match self.resolve_via(&mut packet, now, false) {
                        Resolved::Send => {
                            self.forwarding.mark_forwarded(&packet);
                            self.transmit(packet, SendCategory::Forward, 0.0, now, events);
                        }
                        Resolved::StartDiscovery => unreachable!("forwards never start discovery"),
                        Resolved::Drop => {
                            // Remembered so a duplicate cannot resurrect it.
                            self.forwarding.mark_forwarded(&packet);
                            self.stats.unicast_no_route_drops += 1;
                        }
                    }
                }
            }
            None => {}
        }

        let pending = self.pending();
        self.scheduler.rearm(now, pending);
    }

    fn next_own_packet(&mut self) -> Option<Packet> {
        if let Some(packet) = self.own_queue.pop_front() {
            return Some(packet);
        }
        if self.data_remaining == 0 {
            return None;
        }
        self.data_remaining -= 1;
        let destination = match self.cfg.destination_policy {
            DestinationPolicy::Fixed(dest) => dest,
            DestinationPolicy::Broadcast => NodeId::BROADCAST,
            DestinationPolicy::UniformRandom => {
                if self.cfg.num_nodes <= 1 {
                    NodeId::BROADCAST
                } else {
                    loop {
                        let candidate = NodeId::new(self.rng.gen_range(0..self.cfg.num_nodes));
                        if candidate != self.node_id() {
                            break candidate;
                        }
                    }
                }
            }
        };
        let mut packet = Packet::data(
            self.node_id(),
            destination,
            self.own_seq,
            self.cfg.data_payload_bytes,
            self.cfg.packet_ttl,
        );
        packet.ack_requested = self.cfg.request_acks;
        self.own_seq += 1;
        Some(packet)
    }

    // Pick the next hop for an outgoing DATA/ACK packet. The discovery lock
    // overrides the metric table while it lasts.
    fn resolve_via(&mut self, packet: &mut Packet, now: SimTime, own_data: bool) -> Resolved {
        if packet.destination.is_broadcast() || self.cfg.metric.is_flooding() {
            packet.via = NodeId::BROADCAST;
            return Resolved::Send;
        }
        if let Some(hop) = self.discovery.locked_next_hop(packet.destination, now) {
            packet.via = hop;
            return Resolved::Send;
        }
        if let Some((via, sf)) = self.routing.best_via(packet.destination, now) {
            packet.via = via;
            if sf.is_some() {
                packet.sf = sf;
            }
            return Resolved::Send;
        }
        // Route miss.
        if own_data && self.cfg.route_discovery {
            return Resolved::StartDiscovery;
        }
        if self.cfg.strict_unicast {
            return Resolved::Drop;
        }
        packet.via = NodeId::BROADCAST;
        self.stats.broadcast_fallbacks += 1;
        Resolved::Send
    }

    fn park_for_discovery(&mut self, packet: Packet, now: SimTime) {
        let dest = packet.destination;
        if !self.discovery.is_discovering(dest, now) {
            let id = self.discovery.begin(dest, now);
            self.stats.discoveries_started += 1;
            let rreq = Packet::rreq(self.node_id(), dest, id, self.cfg.packet_ttl);
            self.ctrl_queue.push_back(rreq);
        }
        self.discovery.buffer_data(packet);
    }

    fn transmit(
        &mut self,
        mut packet: Packet,
        category: SendCategory,
        interval_draw: f64,
        now: SimTime,
        events: &mut Vec<NodeEvent>,
    ) {
        packet.last_hop = self.node_id();
        packet.departure = now;
        let sf = packet.sf.unwrap_or(self.cfg.radio.sf);
        let airtime = self.airtime_model.airtime(
            packet.payload_bytes,
            sf,
            self.cfg.radio.bandwidth_hz,
            self.cfg.radio.coding_rate,
        );

        if category == SendCategory::Forward {
            self.stats.sent_forwarded += 1;
        } else {
            match packet.kind {
                PacketKind::Data => self.stats.sent_data += 1,
                PacketKind::Ack => self.stats.sent_acks += 1,
                PacketKind::Routing => self.stats.sent_routing += 1,
                PacketKind::Rreq => self.stats.sent_rreq += 1,
                PacketKind::Rrep => self.stats.sent_rrep += 1,
            }
        }
        trace!(
            node = %self.node_id(), kind = %packet.kind, dest = %packet.destination,
            via = %packet.via, airtime, "transmitting"
        );
        self.channel.transmit(self.node_id(), packet.clone(), airtime);
        self.scheduler.on_transmitted(category, now, airtime, interval_draw);
        events.push(NodeEvent::Transmitted { packet, airtime });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::airtime::LoraAirtime;
    use crate::config::RoutingMetric;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct SharedChannel {
        idle: bool,
        sent: Vec<(NodeId, Packet, f64)>,
    }

    #[derive(Clone)]
    struct TestChannel(Rc<RefCell<SharedChannel>>);

    impl TestChannel {
        fn new() -> Self {
            TestChannel(Rc::new(RefCell::new(SharedChannel { idle: true, sent: Vec::new() })))
        }

        fn sent(&self) -> Vec<(NodeId, Packet, f64)> {
            self.0.borrow().sent.clone()
        }

        fn set_idle(&self, idle: bool) {
            self.0.borrow_mut().idle = idle;
        }
    }

    impl Channel for TestChannel {
        fn is_idle(&self) -> bool {
            self.0.borrow().idle
        }

        fn transmit(&mut self, from: NodeId, packet: Packet, airtime: f64) {
            self.0.borrow_mut().sent.push((from, packet, airtime));
        }
    }

    fn node(cfg: NodeConfig) -> (MeshNode<TestChannel>, TestChannel) {
        let channel = TestChannel::new();
        let node = MeshNode::new(
            cfg,
            Arc::new(Coordinator::new()),
            channel.clone(),
            Box::new(LoraAirtime),
            42,
        )
        .unwrap();
        (node, channel)
    }

    fn base_cfg(id: u32) -> NodeConfig {
        let mut cfg = NodeConfig::new(NodeId::new(id), 10);
        cfg.enforce_duty_cycle = false;
        // Keep periodic advertisements out of these windows.
        cfg.first_advert_delay = crate::config::TimingDist::Uniform { min: 10_000.0, max: 10_001.0 };
        cfg
    }

    fn t(secs: f64) -> SimTime {
        SimTime::from_secs(secs)
    }

    #[test]
    fn test_outbound_payload_broadcast_fallback() {
        // No route known, non-strict: the packet goes out via broadcast.
        let (mut node, channel) = node(base_cfg(1));
        node.accept_outbound_payload(NodeId::new(9), 20, false, t(0.0));
        let wake = node.next_wakeup().unwrap();
        node.advance_to(wake);

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind, PacketKind::Data);
        assert_eq!(sent[0].1.via, NodeId::BROADCAST);
        assert_eq!(node.stats().broadcast_fallbacks, 1);
    }

    #[test]
    fn test_strict_unicast_drops_without_route() {
        let mut cfg = base_cfg(1);
        cfg.strict_unicast = true;
        let (mut node, channel) = node(cfg);
        node.accept_outbound_payload(NodeId::new(9), 20, false, t(0.0));
        node.advance_to(t(10.0));

        assert!(channel.sent().is_empty());
        assert_eq!(node.stats().unicast_no_route_drops, 1);
    }

    #[test]
    fn test_wrong_next_hop_overheard_dropped() {
        let (mut node, channel) = node(base_cfg(2));
        let mut packet = Packet::data(NodeId::new(1), NodeId::new(9), 0, 20, 8);
        packet.via = NodeId::new(7); // someone else's relay
        packet.last_hop = NodeId::new(1);
        node.on_packet_received(packet, t(1.0));
        node.advance_to(t(30.0));

        assert!(channel.sent().is_empty());
        assert_eq!(node.stats().unicast_wrong_next_hop_drops, 1);
    }

    #[test]
    fn test_forwards_when_addressed_as_next_hop() {
        let (mut node, channel) = node(base_cfg(2));
        let mut packet = Packet::data(NodeId::new(1), NodeId::new(9), 0, 20, 8);
        packet.via = NodeId::new(2);
        packet.last_hop = NodeId::new(1);
        node.on_packet_received(packet, t(1.0));
        node.advance_to(t(30.0));

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.ttl, 7);
        assert_eq!(node.stats().sent_forwarded, 1);
    }

    #[test]
    fn test_busy_channel_defers_wake() {
        let (mut node, channel) = node(base_cfg(1));
        channel.set_idle(false);
        node.accept_outbound_payload(NodeId::new(9), 20, false, t(0.0));
        let first = node.next_wakeup().unwrap();
        let events = node.advance_to(first);
        assert!(events.is_empty());
        // Deferred, not dropped: the wake moved by the busy-retry delay.
        let deferred = node.next_wakeup().unwrap();
        assert!(deferred > first);
        assert!(deferred - first < 1e-3);

        channel.set_idle(true);
        node.advance_to(deferred);
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn test_delivery_is_unique_and_acked() {
        let mut cfg = base_cfg(2);
        cfg.metric = RoutingMetric::HopCount;
        let (mut node, channel) = node(cfg);
        let mut packet = Packet::data(NodeId::new(1), NodeId::new(2), 7, 20, 8);
        packet.ack_requested = true;
        packet.last_hop = NodeId::new(1);
        packet.via = NodeId::new(2);

        let events = node.on_packet_received(packet.clone(), t(1.0));
        assert!(matches!(events[0], NodeEvent::Delivered { seq: 7, .. }));
        // Second copy: counted, not re-delivered.
        let events = node.on_packet_received(packet, t(2.0));
        assert!(events.is_empty());
        assert_eq!(node.stats().received_data_for_me, 2);
        assert_eq!(node.stats().received_data_unique, 1);

        // Exactly one ACK goes back to the source.
        node.advance_to(t(60.0));
        let acks: Vec<_> = channel.sent().into_iter().filter(|(_, p, _)| p.kind == PacketKind::Ack).collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].1.destination, NodeId::new(1));
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut cfg = base_cfg(1);
        cfg.packets_to_send = 5;
        cfg.destination_policy = DestinationPolicy::Fixed(NodeId::new(9));
        cfg = cfg.with_failure(100.0, None);
        let (mut node, channel) = node(cfg);

        let events = node.advance_to(t(500.0));
        assert!(events.iter().any(|e| matches!(e, NodeEvent::Failed { at } if *at == t(100.0))));
        assert!(node.has_failed());
        assert!(node.next_wakeup().is_none());
        let sent_before = channel.sent().len();
        assert!(channel.sent().iter().all(|(_, p, _)| p.departure < t(100.0)));

        // Inbound packets are discarded, timers stay dead.
        let mut packet = Packet::data(NodeId::new(1), NodeId::new(1), 0, 20, 8);
        packet.via = NodeId::new(1);
        let events = node.on_packet_received(packet, t(150.0));
        assert!(events.is_empty());
        assert_eq!(node.stats().dropped_while_failed, 1);
        node.advance_to(t(1000.0));
        assert_eq!(channel.sent().len(), sent_before);
    }

    #[test]
    fn test_failure_fires_before_distant_wake() {
        // The only scheduler deadline lies beyond the advance horizon, so
        // the failure is the sole due event.
        let mut cfg = base_cfg(1);
        cfg.packets_to_send = 1;
        cfg.destination_policy = DestinationPolicy::Broadcast;
        cfg.first_data_delay = crate::config::TimingDist::Uniform { min: 50.0, max: 51.0 };
        cfg = cfg.with_failure(5.0, None);
        let (mut node, channel) = node(cfg);

        let events = node.advance_to(t(10.0));
        assert!(events.iter().any(|e| matches!(e, NodeEvent::Failed { at } if *at == t(5.0))));
        assert!(node.has_failed());
        assert!(channel.sent().is_empty());
        assert!(node.next_wakeup().is_none());
    }

    #[test]
    fn test_delivered_history_is_bounded() {
        let mut cfg = base_cfg(2);
        cfg.delivered_history_size = 1;
        let (mut node, _channel) = node(cfg);
        let mut first = Packet::data(NodeId::new(1), NodeId::new(2), 0, 20, 8);
        first.via = NodeId::new(2);
        first.last_hop = NodeId::new(1);
        let mut second = first.clone();
        second.seq = 1;

        assert_eq!(node.on_packet_received(first.clone(), t(1.0)).len(), 1);
        // Duplicate inside the window: suppressed.
        assert!(node.on_packet_received(first.clone(), t(2.0)).is_empty());
        // A newer delivery evicts the oldest key; a very late copy of the
        // first packet then counts as new again.
        assert_eq!(node.on_packet_received(second, t(3.0)).len(), 1);
        assert_eq!(node.on_packet_received(first, t(4.0)).len(), 1);
        assert_eq!(node.stats().received_data_unique, 3);
    }

    #[test]
    fn test_own_data_generation_budget() {
        let mut cfg = base_cfg(1);
        cfg.packets_to_send = 3;
        cfg.destination_policy = DestinationPolicy::Broadcast;
        cfg.first_data_delay = crate::config::TimingDist::Uniform { min: 1.0, max: 2.0 };
        cfg.data_interval = crate::config::TimingDist::Uniform { min: 1.0, max: 2.0 };
        let (mut node, channel) = node(cfg);

        node.advance_to(t(600.0));
        let data: Vec<_> = channel.sent().into_iter().filter(|(_, p, _)| p.kind == PacketKind::Data).collect();
        assert_eq!(data.len(), 3);
        let seqs: Vec<u32> = data.iter().map(|(_, p, _)| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_end_node_never_forwards() {
        let mut cfg = base_cfg(2);
        cfg = cfg.with_metric(RoutingMetric::NoForwarding);
        let (mut node, channel) = node(cfg);
        let mut packet = Packet::data(NodeId::new(1), NodeId::new(9), 0, 20, 8);
        packet.via = NodeId::new(2);
        node.on_packet_received(packet, t(1.0));
        node.advance_to(t(60.0));
        assert!(channel.sent().is_empty());
    }
}
