//! Routing table maintenance.
//!
//! Consumes periodic advertisements, composes derived metrics, enforces the
//! best-route policy, builds outgoing advertisements, and watches for table
//! convergence. The raw entry storage and ordering live in [`crate::table`];
//! this layer owns all metric arithmetic.

use crate::config::{NodeConfig, RoutingMetric};
use crate::packet::{AdvertisedRoute, NodeId, ADVERTISED_ROUTE_BYTES, PACKET_HEADER_BYTES};
use crate::table::{DualMetricRoute, RouteTable, SingleMetricRoute};
use crate::time::SimTime;
use tracing::trace;

/// The route table plus the maintenance policy driving it.
#[derive(Debug)]
pub struct RoutingState {
    own_id: NodeId,
    metric: RoutingMetric,
    route_timeout: f64,
    store_best: bool,
    etx_window: usize,
    convergence_threshold: usize,
    freeze_on_convergence: bool,
    freeze_horizon: f64,
    end_node: bool,
    default_sf: u8,
    advert_max_entries: usize,
    table: RouteTable,
    converged_at: Option<SimTime>,
}

impl RoutingState {
    pub fn new(cfg: &NodeConfig) -> Self {
        let payload_budget = cfg.routing_payload_max_bytes.saturating_sub(PACKET_HEADER_BYTES);
        RoutingState {
            own_id: cfg.node_id,
            metric: cfg.metric,
            route_timeout: cfg.route_timeout,
            store_best: cfg.store_best_routes_only,
            etx_window: cfg.etx_window.clamp(1, crate::table::ETX_WINDOW_MAX),
            convergence_threshold: cfg.convergence_threshold,
            freeze_on_convergence: cfg.freeze_on_convergence,
            freeze_horizon: cfg.freeze_validity_horizon,
            end_node: cfg.role == crate::config::Role::End,
            default_sf: cfg.radio.sf,
            advert_max_entries: payload_budget / ADVERTISED_ROUTE_BYTES,
            table: RouteTable::new(),
            converged_at: None,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// When this node first reached the convergence threshold, if ever.
    pub fn converged_at(&self) -> Option<SimTime> {
        self.converged_at
    }

    /// Process a received advertisement: refresh the neighbor route to the
    /// sender, then merge every advertised route under the configured metric.
    ///
    /// Returns `true` if this mutation made the node locally converged.
    /// End nodes and frozen tables never mutate.
    pub fn apply_advertisement(
        &mut self,
        sender: NodeId,
        rssi: f64,
        sf: u8,
        seq: u32,
        routes: &[AdvertisedRoute],
        now: SimTime,
    ) -> bool {
        if self.end_node || self.table.is_frozen() || !self.metric.builds_routes() {
            return false;
        }
        let valid = now + self.route_timeout;

        if self.metric.is_dual() {
            self.apply_dual(sender, sf, routes, valid);
        } else {
            let neighbor_metric = self.refresh_neighbor(sender, rssi, seq, valid);
            for adv in routes.iter().filter(|r| r.id != self.own_id) {
                let metric = match self.metric {
                    RoutingMetric::HopCount => adv.primary + 1.0,
                    RoutingMetric::RssiSum => adv.primary + rssi.abs(),
                    RoutingMetric::RssiProd => adv.primary * rssi.abs(),
                    RoutingMetric::Etx => neighbor_metric + adv.primary,
                    _ => continue,
                };
                trace!(dest = %adv.id, via = %sender, metric, "merging advertised route");
                self.table
                    .upsert_single(SingleMetricRoute::new(adv.id, sender, metric, valid), self.store_best);
            }
        }

        self.check_convergence(now)
    }

    fn apply_dual(&mut self, sender: NodeId, sf: u8, routes: &[AdvertisedRoute], valid: SimTime) {
        let hop_variant = self.metric == RoutingMetric::TimeOnAirHopCount;
        let neighbor = DualMetricRoute {
            id: sender,
            via: sender,
            sf,
            primary: 2f64.powi(i32::from(sf) - 7),
            secondary: if hop_variant { 1.0 } else { f64::from(sf) - 7.0 },
            valid,
        };
        self.table.upsert_dual(neighbor, self.store_best);

        // The hop just crossed is weighted by the SF the advertisement was
        // received at, not by whatever SF the advertised entry recorded.
        for adv in routes.iter().filter(|r| r.id != self.own_id) {
            let route = DualMetricRoute {
                id: adv.id,
                via: sender,
                sf,
                primary: adv.primary + 2f64.powi(i32::from(sf)),
                secondary: adv.secondary + if hop_variant { 1.0 } else { f64::from(sf) - 7.0 },
                valid,
            };
            self.table.upsert_dual(route, self.store_best);
        }
    }

    // Creates or refreshes the single-metric neighbor route and returns its
    // metric (needed for ETX composition of the advertised routes).
    fn refresh_neighbor(&mut self, sender: NodeId, rssi: f64, seq: u32, valid: SimTime) -> f64 {
        let window_len = self.etx_window;
        if let Some(existing) = self.table.single_mut(sender, sender) {
            let metric = match self.metric {
                RoutingMetric::HopCount => 1.0,
                RoutingMetric::RssiSum | RoutingMetric::RssiProd => rssi.abs(),
                RoutingMetric::Etx => {
                    // Expected transmission count from the gap between the
                    // advertised sequence and each windowed sample.
                    let mut missed = 0.0;
                    for (i, sample) in existing.window.iter().take(window_len).enumerate() {
                        missed += f64::from(seq) - (f64::from(*sample) + i as f64 + 1.0);
                    }
                    let etx = (1.0 + missed).max(1.0);
                    // Shift the window right and record the newest sample.
                    existing.window.copy_within(0..window_len - 1, 1);
                    existing.window[0] = seq;
                    etx
                }
                _ => 1.0,
            };
            existing.metric = metric;
            existing.valid = valid;
            metric
        } else {
            let metric = match self.metric {
                RoutingMetric::HopCount | RoutingMetric::Etx => 1.0,
                RoutingMetric::RssiSum | RoutingMetric::RssiProd => rssi.abs(),
                _ => 1.0,
            };
            let mut route = SingleMetricRoute::new(sender, sender, metric, valid);
            route.window[0] = seq;
            self.table.upsert_single(route, self.store_best);
            metric
        }
    }

    /// Refresh the neighbor route from an overheard DATA/ACK packet, exactly
    /// as an empty advertisement from its last hop would.
    pub fn refresh_from_data(&mut self, sender: NodeId, rssi: f64, seq: u32, now: SimTime) -> bool {
        if self.end_node || self.table.is_frozen() || !self.metric.builds_routes() {
            return false;
        }
        if self.metric.is_dual() {
            return false;
        }
        self.refresh_neighbor(sender, rssi, seq, now + self.route_timeout);
        self.check_convergence(now)
    }

    /// Install or refresh a discovery-learned route (reverse or forward leg),
    /// always a direct-neighbor hop.
    pub fn install_discovery_route(&mut self, dest: NodeId, via: NodeId, now: SimTime) {
        if self.table.is_frozen() {
            return;
        }
        let route = SingleMetricRoute::new(dest, via, 1.0, now + self.route_timeout);
        self.table.upsert_single(route, self.store_best);
    }

    /// Purge expired entries; suspended while frozen.
    pub fn sanitize(&mut self, now: SimTime) -> usize {
        self.table.sanitize(now)
    }

    /// Next hop (and spreading factor, for dual-metric paths) of the best
    /// current route to `dest`.
    pub fn best_via(&self, dest: NodeId, now: SimTime) -> Option<(NodeId, Option<u8>)> {
        if self.metric.is_dual() {
            self.table.best_dual_to(dest, now).map(|r| (r.via, Some(r.sf)))
        } else {
            self.table.best_single_to(dest, now).map(|r| (r.via, None))
        }
    }

    /// Snapshot of the best route per known destination, capped by the
    /// routing-payload budget, for a periodic advertisement.
    pub fn build_advertisement(&self, now: SimTime) -> Vec<AdvertisedRoute> {
        let mut dests: Vec<NodeId> = if self.metric.is_dual() {
            self.table.duals().iter().map(|r| r.id).collect()
        } else {
            self.table.singles().iter().map(|r| r.id).collect()
        };
        dests.sort_unstable();
        dests.dedup();

        let mut out = Vec::new();
        for dest in dests {
            if out.len() >= self.advert_max_entries {
                break;
            }
            if self.metric.is_dual() {
                if let Some(r) = self.table.best_dual_to(dest, now) {
                    out.push(AdvertisedRoute { id: r.id, primary: r.primary, secondary: r.secondary, sf: r.sf });
                }
            } else if let Some(r) = self.table.best_single_to(dest, now) {
                out.push(AdvertisedRoute { id: r.id, primary: r.metric, secondary: 0.0, sf: self.default_sf });
            }
        }
        out
    }

    // Convergence fires at most once, on the first mutation that brings the
    // distinct-destination count to the threshold.
    fn check_convergence(&mut self, now: SimTime) -> bool {
        if self.converged_at.is_some() || self.end_node {
            return false;
        }
        if self.table.distinct_destinations() >= self.convergence_threshold {
            self.converged_at = Some(now);
            if self.freeze_on_convergence {
                self.table.freeze(now, self.freeze_horizon);
            }
            return true;
        }
        false
    }
}
