use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::duration::iso8601;
use crate::identity::IdentityType;
use crate::repair::RepairActionKind;

// --- Pause reasons ---

/// Why a rollout did not start a batch this tick. Backpressure, not failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PauseReason {
    UnhealthyBudgetExceeded {
        unhealthy: usize,
        fleet_size: usize,
        max_percent: u32,
    },
    UpgradedUnhealthyBudgetExceeded {
        unhealthy: usize,
        considered: usize,
        max_percent: u32,
    },
    PauseWindow {
        #[serde(with = "iso8601")]
        remaining: Duration,
    },
    /// Every instance still waiting for the update is unhealthy or busy.
    NoEligibleInstances { pending: usize },
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::UnhealthyBudgetExceeded {
                unhealthy,
                fleet_size,
                max_percent,
            } => write!(
                f,
                "UnhealthyBudgetExceeded ({}/{} unhealthy, max {}%)",
                unhealthy, fleet_size, max_percent
            ),
            PauseReason::UpgradedUnhealthyBudgetExceeded {
                unhealthy,
                considered,
                max_percent,
            } => write!(
                f,
                "UpgradedUnhealthyBudgetExceeded ({}/{} unhealthy, max {}%)",
                unhealthy, considered, max_percent
            ),
            PauseReason::PauseWindow { remaining } => {
                write!(f, "PauseWindow ({}s remaining)", remaining.as_secs())
            }
            PauseReason::NoEligibleInstances { pending } => {
                write!(f, "NoEligibleInstances ({} pending)", pending)
            }
        }
    }
}

// --- Fleet events ---

/// Structured observability output of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum FleetEvent {
    BatchStarted {
        scale_set: String,
        batch: u32,
        instances: Vec<String>,
    },
    BatchCompleted {
        scale_set: String,
        batch: u32,
        succeeded: Vec<String>,
        failed: Vec<String>,
        /// Set when the rollout was cancelled between extension levels.
        cancelled: bool,
    },
    Paused {
        scale_set: String,
        reason: PauseReason,
    },
    RepairTriggered {
        scale_set: String,
        instance_id: String,
        action: RepairActionKind,
    },
    RepairCompleted {
        scale_set: String,
        instance_id: String,
        action: RepairActionKind,
        succeeded: bool,
    },
    IdentityPatchApplied {
        scale_set: String,
        identity_type: IdentityType,
        attached: Vec<String>,
        detached: Vec<String>,
    },
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::BatchStarted { .. } => "BatchStarted",
            FleetEvent::BatchCompleted { .. } => "BatchCompleted",
            FleetEvent::Paused { .. } => "Paused",
            FleetEvent::RepairTriggered { .. } => "RepairTriggered",
            FleetEvent::RepairCompleted { .. } => "RepairCompleted",
            FleetEvent::IdentityPatchApplied { .. } => "IdentityPatchApplied",
        }
    }

    pub fn scale_set(&self) -> &str {
        match self {
            FleetEvent::BatchStarted { scale_set, .. }
            | FleetEvent::BatchCompleted { scale_set, .. }
            | FleetEvent::Paused { scale_set, .. }
            | FleetEvent::RepairTriggered { scale_set, .. }
            | FleetEvent::RepairCompleted { scale_set, .. }
            | FleetEvent::IdentityPatchApplied { scale_set, .. } => scale_set,
        }
    }
}
