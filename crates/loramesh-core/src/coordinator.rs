//! Shared cross-node coordinator.
//!
//! Replaces what would otherwise be process-wide globals with one explicit
//! service every node references: the convergence tally that eventually
//! suppresses periodic advertisements network-wide, and the pre-selected
//! subset of nodes destined to fail. Nodes only ever touch it through atomic
//! increments and reads.

use crate::packet::NodeId;
use rand::seq::index;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

/// Cross-node convergence tally and failure-subset registry.
#[derive(Debug, Default)]
pub struct Coordinator {
    /// Nodes expected to converge (relay nodes with a route-building metric).
    expected: AtomicUsize,
    /// Nodes that reported local convergence.
    converged: AtomicUsize,
    /// Set once every expected node has converged.
    all_converged: AtomicBool,
    /// Nodes selected to fail during the run.
    failing: RwLock<HashSet<NodeId>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node that counts toward the convergence tally. End nodes
    /// and flooding-only nodes never call this.
    pub fn register_participant(&self) {
        self.expected.fetch_add(1, Ordering::SeqCst);
    }

    /// Report this node's (one-time) local convergence.
    pub fn report_converged(&self) {
        let done = self.converged.fetch_add(1, Ordering::SeqCst) + 1;
        let expected = self.expected.load(Ordering::SeqCst);
        if expected > 0 && done >= expected {
            self.all_converged.store(true, Ordering::SeqCst);
        }
    }

    /// Whether every counted node has converged; once true, periodic
    /// advertisements stop everywhere.
    pub fn advertisements_suppressed(&self) -> bool {
        self.all_converged.load(Ordering::SeqCst)
    }

    /// Number of nodes that reported convergence so far.
    pub fn converged_count(&self) -> usize {
        self.converged.load(Ordering::SeqCst)
    }

    /// Pre-select `count` distinct nodes out of `candidates` to fail.
    pub fn select_failures<R: Rng + ?Sized>(&self, rng: &mut R, candidates: &[NodeId], count: usize) {
        let count = count.min(candidates.len());
        let chosen: HashSet<NodeId> = index::sample(rng, candidates.len(), count)
            .into_iter()
            .map(|i| candidates[i])
            .collect();
        *self.failing.write().unwrap_or_else(|e| e.into_inner()) = chosen;
    }

    /// Whether `node` is in the failing subset.
    pub fn is_failing(&self, node: NodeId) -> bool {
        self.failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&node)
    }
}
