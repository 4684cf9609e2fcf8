//! Route table store.
//!
//! Holds single-metric and dual-metric route entries and the lookup/merge
//! algorithms over them. Single-metric entries rank by one scalar;
//! dual-metric entries rank lexicographically by `(primary, secondary)`.
//! Ties always break toward the latest validity deadline. The table itself
//! knows nothing about metric composition; that lives in the maintenance
//! layer.

use crate::packet::NodeId;
use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fixed backing size of the ETX sliding window. The effective length is
/// configured per node and clamped to `1..=ETX_WINDOW_MAX`.
pub const ETX_WINDOW_MAX: usize = 32;

/// A route ranked by a single scalar metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleMetricRoute {
    /// Destination.
    pub id: NodeId,
    /// Next hop toward the destination.
    pub via: NodeId,
    /// Scalar metric; lower is better.
    pub metric: f64,
    /// Absolute validity deadline.
    pub valid: SimTime,
    /// Observed advertisement sequence samples, newest first. Only
    /// meaningful under the ETX metric.
    #[serde(with = "serde_window")]
    pub window: [u32; ETX_WINDOW_MAX],
}

impl SingleMetricRoute {
    /// Fresh route with an empty sample window.
    pub fn new(id: NodeId, via: NodeId, metric: f64, valid: SimTime) -> Self {
        SingleMetricRoute { id, via, metric, valid, window: [0; ETX_WINDOW_MAX] }
    }
}

// Serde lacks impls for [u32; 32]; store the window as a sequence.
mod serde_window {
    use super::ETX_WINDOW_MAX;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(w: &[u32; ETX_WINDOW_MAX], s: S) -> Result<S::Ok, S::Error> {
        w.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u32; ETX_WINDOW_MAX], D::Error> {
        let v = Vec::<u32>::deserialize(d)?;
        let mut w = [0u32; ETX_WINDOW_MAX];
        for (dst, src) in w.iter_mut().zip(v) {
            *dst = src;
        }
        Ok(w)
    }
}

/// A route ranked by a `(primary, secondary)` pair, tied to a spreading
/// factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualMetricRoute {
    /// Destination.
    pub id: NodeId,
    /// Next hop toward the destination.
    pub via: NodeId,
    /// Spreading factor used on the first hop of this path.
    pub sf: u8,
    /// Primary metric; compared first.
    pub primary: f64,
    /// Secondary metric; compared on primary ties.
    pub secondary: f64,
    /// Absolute validity deadline.
    pub valid: SimTime,
}

/// Per-node route storage.
///
/// Duplicate entries per destination are legal when best-routes-only mode is
/// off; lookups then pick the best at query time. While frozen, entries are
/// never purged and mutation is the caller's responsibility to suppress.
#[derive(Debug, Default)]
pub struct RouteTable {
    singles: Vec<SingleMetricRoute>,
    duals: Vec<DualMetricRoute>,
    frozen: bool,
}

// Returns true when `a` ranks strictly better than `b`: lower metric, ties
// broken by later validity.
fn single_better(a: &SingleMetricRoute, b: &SingleMetricRoute) -> bool {
    a.metric < b.metric || (a.metric == b.metric && a.valid > b.valid)
}

fn dual_better(a: &DualMetricRoute, b: &DualMetricRoute) -> bool {
    (a.primary, a.secondary) < (b.primary, b.secondary)
        || ((a.primary, a.secondary) == (b.primary, b.secondary) && a.valid > b.valid)
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// All single-metric entries.
    pub fn singles(&self) -> &[SingleMetricRoute] {
        &self.singles
    }

    /// All dual-metric entries.
    pub fn duals(&self) -> &[DualMetricRoute] {
        &self.duals
    }

    /// Total entry count across both families.
    pub fn len(&self) -> usize {
        self.singles.len() + self.duals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.singles.is_empty() && self.duals.is_empty()
    }

    /// Whether the table has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Best single-metric route to `dest`: minimal metric, ties broken by
    /// latest validity. Entries already past their deadline are ignored
    /// unless the table is frozen.
    pub fn best_single_to(&self, dest: NodeId, now: SimTime) -> Option<&SingleMetricRoute> {
        let mut best: Option<&SingleMetricRoute> = None;
        for route in self.singles.iter().filter(|r| r.id == dest) {
            if !self.frozen && route.valid < now {
                continue;
            }
            match best {
                Some(b) if !single_better(route, b) => {}
                _ => best = Some(route),
            }
        }
        best
    }

    /// Best dual-metric route to `dest`: lexicographic `(primary, secondary)`
    /// minimum, ties broken by latest validity.
    pub fn best_dual_to(&self, dest: NodeId, now: SimTime) -> Option<&DualMetricRoute> {
        let mut best: Option<&DualMetricRoute> = None;
        for route in self.duals.iter().filter(|r| r.id == dest) {
            if !self.frozen && route.valid < now {
                continue;
            }
            match best {
                Some(b) if !dual_better(route, b) => {}
                _ => best = Some(route),
            }
        }
        best
    }

    /// Mutable handle to the single-metric entry keyed `(id, via)`.
    pub fn single_mut(&mut self, id: NodeId, via: NodeId) -> Option<&mut SingleMetricRoute> {
        self.singles.iter_mut().find(|r| r.id == id && r.via == via)
    }

    /// Insert or refresh a single-metric route.
    ///
    /// With `best_only`, the new entry competes with every existing entry for
    /// the destination and exactly one survives (the incumbent wins full
    /// ties). Otherwise the entry keyed `(id, via)` is refreshed in place, or
    /// appended.
    pub fn upsert_single(&mut self, route: SingleMetricRoute, best_only: bool) {
        if best_only {
            let dest = route.id;
            let best_existing = self
                .singles
                .iter()
                .filter(|r| r.id == dest)
                .cloned()
                .reduce(|a, b| if single_better(&b, &a) { b } else { a });
            // The incumbent wins full ties.
            let winner = match best_existing {
                Some(existing) if !single_better(&route, &existing) => existing,
                _ => route,
            };
            self.singles.retain(|r| r.id != dest);
            self.singles.push(winner);
        } else {
            match self.single_mut(route.id, route.via) {
                Some(existing) => *existing = route,
                None => self.singles.push(route),
            }
        }
    }

    /// Insert or refresh a dual-metric route, keyed `(id, via, sf)`.
    pub fn upsert_dual(&mut self, route: DualMetricRoute, best_only: bool) {
        if best_only {
            let dest = route.id;
            let best_existing = self
                .duals
                .iter()
                .filter(|r| r.id == dest)
                .cloned()
                .reduce(|a, b| if dual_better(&b, &a) { b } else { a });
            let winner = match best_existing {
                Some(existing) if !dual_better(&route, &existing) => existing,
                _ => route,
            };
            self.duals.retain(|r| r.id != dest);
            self.duals.push(winner);
        } else {
            match self
                .duals
                .iter_mut()
                .find(|r| r.id == route.id && r.via == route.via && r.sf == route.sf)
            {
                Some(existing) => *existing = route,
                None => self.duals.push(route),
            }
        }
    }

    /// Purge every entry past its deadline. A no-op while frozen.
    /// Returns the number of entries removed.
    pub fn sanitize(&mut self, now: SimTime) -> usize {
        if self.frozen {
            return 0;
        }
        let before = self.len();
        self.singles.retain(|r| r.valid >= now);
        self.duals.retain(|r| r.valid >= now);
        before - self.len()
    }

    /// Number of distinct destination ids across both families.
    pub fn distinct_destinations(&self) -> usize {
        let mut seen: HashSet<NodeId> = HashSet::new();
        seen.extend(self.singles.iter().map(|r| r.id));
        seen.extend(self.duals.iter().map(|r| r.id));
        seen.len()
    }

    /// Freeze the table: purge stops and every deadline is pushed out to at
    /// least `now + horizon`.
    pub fn freeze(&mut self, now: SimTime, horizon: f64) {
        self.frozen = true;
        let floor = now + horizon;
        for r in &mut self.singles {
            r.valid = r.valid.max(floor);
        }
        for r in &mut self.duals {
            r.valid = r.valid.max(floor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: f64) -> SimTime {
        SimTime::from_secs(secs)
    }

    #[test]
    fn test_best_single_prefers_lower_metric() {
        let mut table = RouteTable::new();
        let dest = NodeId::new(9);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(2), 3.0, t(100.0)), false);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(3), 1.0, t(100.0)), false);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(4), 2.0, t(100.0)), false);

        let best = table.best_single_to(dest, t(0.0)).unwrap();
        assert_eq!(best.via, NodeId::new(3));
    }

    #[test]
    fn test_best_single_tie_breaks_on_validity() {
        let mut table = RouteTable::new();
        let dest = NodeId::new(9);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(2), 2.0, t(50.0)), false);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(3), 2.0, t(90.0)), false);

        let best = table.best_single_to(dest, t(0.0)).unwrap();
        assert_eq!(best.via, NodeId::new(3));
    }

    #[test]
    fn test_best_single_skips_expired() {
        let mut table = RouteTable::new();
        let dest = NodeId::new(9);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(2), 1.0, t(10.0)), false);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(3), 5.0, t(100.0)), false);

        let best = table.best_single_to(dest, t(20.0)).unwrap();
        assert_eq!(best.via, NodeId::new(3));
        assert!(table.best_single_to(dest, t(200.0)).is_none());
    }

    #[test]
    fn test_best_only_keeps_single_entry() {
        let mut table = RouteTable::new();
        let dest = NodeId::new(9);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(2), 3.0, t(100.0)), true);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(3), 1.0, t(100.0)), true);
        assert_eq!(table.singles().len(), 1);
        assert_eq!(table.singles()[0].via, NodeId::new(3));

        // A worse candidate must not displace the incumbent.
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(4), 2.0, t(100.0)), true);
        assert_eq!(table.singles().len(), 1);
        assert_eq!(table.singles()[0].via, NodeId::new(3));
    }

    #[test]
    fn test_best_only_full_tie_prefers_incumbent() {
        let mut table = RouteTable::new();
        let dest = NodeId::new(9);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(2), 2.0, t(100.0)), true);
        table.upsert_single(SingleMetricRoute::new(dest, NodeId::new(3), 2.0, t(100.0)), true);
        assert_eq!(table.singles().len(), 1);
        assert_eq!(table.singles()[0].via, NodeId::new(2));
    }

    #[test]
    fn test_dual_lexicographic_order() {
        let mut table = RouteTable::new();
        let dest = NodeId::new(9);
        table.upsert_dual(
            DualMetricRoute { id: dest, via: NodeId::new(2), sf: 8, primary: 2.0, secondary: 1.0, valid: t(100.0) },
            false,
        );
        table.upsert_dual(
            DualMetricRoute { id: dest, via: NodeId::new(3), sf: 7, primary: 1.0, secondary: 9.0, valid: t(100.0) },
            false,
        );
        table.upsert_dual(
            DualMetricRoute { id: dest, via: NodeId::new(4), sf: 7, primary: 1.0, secondary: 3.0, valid: t(100.0) },
            false,
        );

        let best = table.best_dual_to(dest, t(0.0)).unwrap();
        assert_eq!(best.via, NodeId::new(4));
    }

    #[test]
    fn test_sanitize_purges_expired() {
        let mut table = RouteTable::new();
        table.upsert_single(SingleMetricRoute::new(NodeId::new(1), NodeId::new(1), 1.0, t(10.0)), false);
        table.upsert_single(SingleMetricRoute::new(NodeId::new(2), NodeId::new(2), 1.0, t(50.0)), false);

        assert_eq!(table.sanitize(t(20.0)), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.singles()[0].id, NodeId::new(2));
    }

    #[test]
    fn test_freeze_suspends_purge_and_extends_validity() {
        let mut table = RouteTable::new();
        table.upsert_single(SingleMetricRoute::new(NodeId::new(1), NodeId::new(1), 1.0, t(10.0)), false);
        table.freeze(t(20.0), 100.0);

        assert_eq!(table.sanitize(t(500.0)), 0);
        assert!(table.singles()[0].valid >= t(120.0));
        // Frozen lookups ignore deadlines entirely.
        assert!(table.best_single_to(NodeId::new(1), t(1000.0)).is_some());
    }

    #[test]
    fn test_distinct_destinations() {
        let mut table = RouteTable::new();
        table.upsert_single(SingleMetricRoute::new(NodeId::new(1), NodeId::new(5), 1.0, t(10.0)), false);
        table.upsert_single(SingleMetricRoute::new(NodeId::new(1), NodeId::new(6), 2.0, t(10.0)), false);
        table.upsert_single(SingleMetricRoute::new(NodeId::new(2), NodeId::new(5), 1.0, t(10.0)), false);
        assert_eq!(table.distinct_destinations(), 2);
    }
}
