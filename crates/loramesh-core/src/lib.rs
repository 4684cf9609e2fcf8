//! # loramesh-core
//!
//! Per-node engine for a simulated multi-hop LoRa mesh: metric-based route
//! tables fed by periodic advertisements, reactive (AODV-style) path
//! discovery for route misses, deduplicating bounded-queue forwarding, and a
//! duty-cycle-aware single-deadline transmission scheduler.
//!
//! Nodes are independent single-threaded state machines. They interact only
//! through a [`node::Channel`] collaborator and an explicit shared
//! [`coordinator::Coordinator`]; an external driver owns the clock and
//! advances each node through [`node::MeshNode::advance_to`]. Runs are fully
//! deterministic under fixed seeds.

pub mod airtime;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod forwarding;
pub mod maintenance;
pub mod node;
pub mod packet;
pub mod scheduler;
pub mod stats;
pub mod table;
pub mod time;

pub use airtime::{AirtimeModel, LoraAirtime};
pub use config::{DestinationPolicy, NodeConfig, RadioParams, Role, RoutingMetric, TimingDist};
pub use coordinator::Coordinator;
pub use error::{ConfigError, MeshError, MeshResult};
pub use node::{Channel, MeshNode, NodeEvent};
pub use packet::{AdvertisedRoute, NodeId, Packet, PacketKind};
pub use stats::NodeStats;
pub use time::SimTime;
