//! Planning for scale-set rollouts: which extensions go in which order, and
//! which instances are upgraded in the next wave.

pub mod extension_graph;
pub mod upgrade;

pub use extension_graph::{ExtensionBatch, ExtensionGraph};
pub use upgrade::{BatchDecision, InstanceBatch, UpgradeBatchPlanner};
