//! Immutable per-node configuration.
//!
//! Every tunable the engine reads lives here and is validated once, at node
//! construction. Invalid combinations fail fast instead of being discovered
//! mid-run by a partially configured node.

use crate::error::ConfigError;
use crate::packet::NodeId;
use crate::table::ETX_WINDOW_MAX;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Routing metric selecting how paths are ranked. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingMetric {
    /// End-node marker: never forwards, never builds routes.
    NoForwarding,
    /// TTL-limited flooding, no route table consulted.
    FloodingBroadcast,
    /// Flooding with duplicate suppression, no route table consulted.
    SmartBroadcast,
    /// Single metric: number of hops.
    HopCount,
    /// Single metric: sum of |RSSI| along the path.
    RssiSum,
    /// Single metric: product of |RSSI| along the path.
    RssiProd,
    /// Single metric: expected transmission count from a sliding window.
    Etx,
    /// Dual metric: accumulated time-on-air weight, hop count secondary.
    TimeOnAirHopCount,
    /// Dual metric: accumulated time-on-air weight, SF excess secondary.
    TimeOnAirSf,
}

impl RoutingMetric {
    /// Whether this metric family keeps `(primary, secondary)` pairs.
    pub fn is_dual(&self) -> bool {
        matches!(self, RoutingMetric::TimeOnAirHopCount | RoutingMetric::TimeOnAirSf)
    }

    /// Whether routing is pure flooding (no table consulted for data).
    pub fn is_flooding(&self) -> bool {
        matches!(self, RoutingMetric::FloodingBroadcast | RoutingMetric::SmartBroadcast)
    }

    /// Whether received advertisements build route state under this metric.
    pub fn builds_routes(&self) -> bool {
        !matches!(self, RoutingMetric::NoForwarding) && !self.is_flooding()
    }
}

/// Node role within the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Participates in route maintenance and forwarding.
    Relay,
    /// Pure traffic source/sink: looks routes up but never mutates routing
    /// state from advertisements and never forwards.
    End,
}

/// A timing distribution for send cadences and delays, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimingDist {
    Uniform { min: f64, max: f64 },
    Exponential { mean: f64 },
}

impl TimingDist {
    /// Draw one interval.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            TimingDist::Uniform { min, max } => {
                if max > min {
                    rng.gen_range(min..max)
                } else {
                    min
                }
            }
            // Inverse CDF; 1 - u keeps the argument away from zero.
            TimingDist::Exponential { mean } => -mean * (1.0 - rng.gen::<f64>()).ln(),
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        match *self {
            TimingDist::Uniform { min, max } => {
                if min < 0.0 || max < min {
                    return Err(ConfigError::new(field, format!("bad uniform range [{min}, {max}]")));
                }
            }
            TimingDist::Exponential { mean } => {
                if mean <= 0.0 {
                    return Err(ConfigError::new(field, format!("exponential mean {mean} must be > 0")));
                }
            }
        }
        Ok(())
    }
}

/// How a node picks destinations for its own DATA packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationPolicy {
    /// Always the given node.
    Fixed(NodeId),
    /// Uniformly among the other node addresses `0..num_nodes`.
    UniformRandom,
    /// The broadcast address.
    Broadcast,
}

/// Radio parameters feeding the airtime model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadioParams {
    /// Spreading factor (7..=12).
    pub sf: u8,
    /// Bandwidth in Hz.
    pub bandwidth_hz: f64,
    /// Coding-rate index (1..=4, i.e. 4/5..4/8).
    pub coding_rate: u8,
}

impl Default for RadioParams {
    fn default() -> Self {
        RadioParams { sf: 7, bandwidth_hz: 125_000.0, coding_rate: 1 }
    }
}

/// Complete, immutable node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's address.
    pub node_id: NodeId,
    /// Relay or end role.
    pub role: Role,
    /// Total participant count; node addresses are `0..num_nodes`.
    pub num_nodes: u32,

    /// Path-ranking metric.
    pub metric: RoutingMetric,
    /// Enable reactive (RREQ/RREP) discovery on route misses.
    pub route_discovery: bool,
    /// Route validity horizon in seconds.
    pub route_timeout: f64,
    /// Keep at most one route per destination.
    pub store_best_routes_only: bool,
    /// Refresh the neighbor route from overheard DATA/ACK packets too.
    pub routes_from_data_packets: bool,
    /// Initial hop budget for generated packets.
    pub packet_ttl: u8,
    /// ETX sliding-window length, clamped to `1..=32`.
    pub etx_window: usize,

    /// Duty-cycle fraction, e.g. 0.01 for 1%.
    pub duty_cycle: f64,
    /// Enforce the duty cycle (otherwise only airtime itself gates sends).
    pub enforce_duty_cycle: bool,
    /// Probability an advertisement wins over a data/forward send when both
    /// are due.
    pub routing_priority: f64,
    /// Probability own data wins over a forward when both are due.
    pub own_data_priority: f64,

    /// Payload size of generated DATA packets.
    pub data_payload_bytes: usize,
    /// Cap on a ROUTING packet's payload size.
    pub routing_payload_max_bytes: usize,
    /// Capacity of the forwarded-history ring.
    pub forwarded_history_size: usize,
    /// Capacity of the to-forward queue.
    pub forward_queue_size: usize,
    /// Capacity of the delivered-packet dedup ring.
    pub delivered_history_size: usize,
    /// Capacity of the seen-discovery-wave ring.
    pub discovery_history_size: usize,

    /// Own DATA packets to generate over the run (0 = none).
    pub packets_to_send: u32,
    /// How destinations for generated DATA are picked.
    pub destination_policy: DestinationPolicy,
    /// Ask receivers for an application-level ACK.
    pub request_acks: bool,
    /// Delay before the first own DATA send.
    pub first_data_delay: TimingDist,
    /// Interval between own DATA sends.
    pub data_interval: TimingDist,
    /// Delay before the first advertisement.
    pub first_advert_delay: TimingDist,
    /// Interval between advertisements.
    pub advert_interval: TimingDist,
    /// Seconds a discovery waits for a reply before giving up.
    pub discovery_timeout: f64,

    /// Distinct destinations needed to count as locally converged.
    pub convergence_threshold: usize,
    /// Freeze the table on convergence.
    pub freeze_on_convergence: bool,
    /// Validity horizon applied to all entries at freeze time.
    pub freeze_validity_horizon: f64,

    /// On a route miss, drop silently instead of broadcasting.
    pub strict_unicast: bool,

    /// Node failure time, if this node is in the failing subset.
    pub failure_start: Option<f64>,
    /// Extra random delay added to the failure time.
    pub failure_jitter: Option<TimingDist>,

    /// Radio parameters for airtime computation.
    pub radio: RadioParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: NodeId::new(0),
            role: Role::Relay,
            num_nodes: 1,
            metric: RoutingMetric::HopCount,
            route_discovery: false,
            route_timeout: 1200.0, // 20 minutes
            store_best_routes_only: true,
            routes_from_data_packets: false,
            packet_ttl: 8,
            etx_window: 16,
            duty_cycle: 0.01, // 1%
            enforce_duty_cycle: true,
            routing_priority: 0.5,
            own_data_priority: 0.5,
            data_payload_bytes: 20,
            routing_payload_max_bytes: 244,
            forwarded_history_size: 256,
            forward_queue_size: 64,
            delivered_history_size: 256,
            discovery_history_size: 256,
            packets_to_send: 0,
            destination_policy: DestinationPolicy::UniformRandom,
            request_acks: false,
            first_data_delay: TimingDist::Uniform { min: 1.0, max: 60.0 },
            data_interval: TimingDist::Exponential { mean: 120.0 },
            first_advert_delay: TimingDist::Uniform { min: 1.0, max: 30.0 },
            advert_interval: TimingDist::Exponential { mean: 60.0 },
            discovery_timeout: 30.0,
            convergence_threshold: 16,
            freeze_on_convergence: false,
            freeze_validity_horizon: 3600.0, // 1 hour
            strict_unicast: false,
            failure_start: None,
            failure_jitter: None,
            radio: RadioParams::default(),
        }
    }
}

impl NodeConfig {
    /// Configuration for node `node_id` in a mesh of `num_nodes`.
    pub fn new(node_id: NodeId, num_nodes: u32) -> Self {
        NodeConfig { node_id, num_nodes, ..Default::default() }
    }

    pub fn with_metric(mut self, metric: RoutingMetric) -> Self {
        self.metric = metric;
        if metric == RoutingMetric::NoForwarding {
            self.role = Role::End;
        }
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_route_discovery(mut self, enabled: bool) -> Self {
        self.route_discovery = enabled;
        self
    }

    pub fn with_duty_cycle(mut self, fraction: f64, enforce: bool) -> Self {
        self.duty_cycle = fraction;
        self.enforce_duty_cycle = enforce;
        self
    }

    pub fn with_packets_to_send(mut self, count: u32, policy: DestinationPolicy) -> Self {
        self.packets_to_send = count;
        self.destination_policy = policy;
        self
    }

    pub fn with_failure(mut self, start: f64, jitter: Option<TimingDist>) -> Self {
        self.failure_start = Some(start);
        self.failure_jitter = jitter;
        self
    }

    /// Validate the whole configuration; every node constructor calls this.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_nodes == 0 {
            return Err(ConfigError::new("num_nodes", "mesh needs at least one node"));
        }
        if self.node_id.is_broadcast() {
            return Err(ConfigError::new("node_id", "broadcast address is reserved"));
        }
        if self.metric == RoutingMetric::NoForwarding && self.role == Role::Relay {
            return Err(ConfigError::new(
                "metric",
                "NoForwarding marks an end node; relay role is contradictory",
            ));
        }
        if !(self.duty_cycle > 0.0 && self.duty_cycle <= 1.0) {
            return Err(ConfigError::new("duty_cycle", "must be in (0, 1]"));
        }
        for (field, p) in [
            ("routing_priority", self.routing_priority),
            ("own_data_priority", self.own_data_priority),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::new(field, format!("probability {p} outside [0, 1]")));
            }
        }
        if self.packet_ttl < 1 {
            return Err(ConfigError::new("packet_ttl", "must be at least 1"));
        }
        if self.etx_window < 1 || self.etx_window > ETX_WINDOW_MAX {
            return Err(ConfigError::new(
                "etx_window",
                format!("must be in 1..={ETX_WINDOW_MAX}"),
            ));
        }
        if self.route_timeout <= 0.0 {
            return Err(ConfigError::new("route_timeout", "must be > 0"));
        }
        if self.discovery_timeout <= 0.0 {
            return Err(ConfigError::new("discovery_timeout", "must be > 0"));
        }
        if self.forward_queue_size == 0 || self.forwarded_history_size == 0 {
            return Err(ConfigError::new("forward_queue_size", "queue capacities must be > 0"));
        }
        if self.delivered_history_size == 0 || self.discovery_history_size == 0 {
            return Err(ConfigError::new("delivered_history_size", "history capacities must be > 0"));
        }
        if self.convergence_threshold == 0 {
            return Err(ConfigError::new("convergence_threshold", "must be at least 1"));
        }
        if self.freeze_on_convergence && self.freeze_validity_horizon <= 0.0 {
            return Err(ConfigError::new("freeze_validity_horizon", "must be > 0 when freezing"));
        }
        if !(7..=12).contains(&self.radio.sf) {
            return Err(ConfigError::new("radio.sf", "spreading factor must be 7..=12"));
        }
        if !(1..=4).contains(&self.radio.coding_rate) {
            return Err(ConfigError::new("radio.coding_rate", "coding rate index must be 1..=4"));
        }
        self.first_data_delay.validate("first_data_delay")?;
        self.data_interval.validate("data_interval")?;
        self.first_advert_delay.validate("first_advert_delay")?;
        self.advert_interval.validate("advert_interval")?;
        if let Some(j) = self.failure_jitter {
            j.validate("failure_jitter")?;
        }
        Ok(())
    }

    /// Whether this node periodically advertises routes.
    pub fn sends_advertisements(&self) -> bool {
        self.role == Role::Relay && self.metric.builds_routes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_is_valid() {
        assert!(NodeConfig::new(NodeId::new(3), 10).validate().is_ok());
    }

    #[test]
    fn test_invalid_duty_cycle_rejected() {
        let mut cfg = NodeConfig::new(NodeId::new(0), 4);
        cfg.duty_cycle = 0.0;
        assert!(cfg.validate().is_err());
        cfg.duty_cycle = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_no_forwarding_forces_end_role() {
        let cfg = NodeConfig::new(NodeId::new(0), 4).with_metric(RoutingMetric::NoForwarding);
        assert_eq!(cfg.role, Role::End);
        assert!(cfg.validate().is_ok());

        let mut bad = cfg;
        bad.role = Role::Relay;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_etx_window_bounds() {
        let mut cfg = NodeConfig::new(NodeId::new(0), 4);
        cfg.etx_window = 0;
        assert!(cfg.validate().is_err());
        cfg.etx_window = 33;
        assert!(cfg.validate().is_err());
        cfg.etx_window = 32;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_timing_samples_in_range() {
        let mut rng = SmallRng::seed_from_u64(7);
        let dist = TimingDist::Uniform { min: 2.0, max: 5.0 };
        for _ in 0..100 {
            let v = dist.sample(&mut rng);
            assert!((2.0..5.0).contains(&v));
        }
        let exp = TimingDist::Exponential { mean: 10.0 };
        for _ in 0..100 {
            assert!(exp.sample(&mut rng) >= 0.0);
        }
    }

    #[test]
    fn test_metric_families() {
        assert!(RoutingMetric::TimeOnAirSf.is_dual());
        assert!(RoutingMetric::Etx.builds_routes());
        assert!(RoutingMetric::SmartBroadcast.is_flooding());
        assert!(!RoutingMetric::SmartBroadcast.builds_routes());
    }
}
