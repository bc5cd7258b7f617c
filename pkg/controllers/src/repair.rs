use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{info, warn};

use pkg_constants::repair::{
    ESCALATION_FAILURE_THRESHOLD, ESCALATION_WINDOW_MULTIPLIER, MAX_REPAIR_HISTORY,
};
use pkg_types::instance::HealthState;
use pkg_types::repair::{RepairAction, RepairActionKind};
use pkg_types::scaleset::AutoRepairPolicy;

/// What the health monitor says about an instance this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairObservation {
    pub health: HealthState,
    pub unhealthy_since: Option<DateTime<Utc>>,
}

impl RepairObservation {
    pub fn healthy() -> Self {
        Self {
            health: HealthState::Healthy,
            unhealthy_since: None,
        }
    }

    pub fn unhealthy_since(since: DateTime<Utc>) -> Self {
        Self {
            health: HealthState::Unhealthy,
            unhealthy_since: Some(since),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairDecision {
    NoAction,
    Repair(RepairAction),
    AlreadyRepairing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairPhase {
    Monitoring,
    Repairing(RepairAction),
    /// A repair happened less than one cooldown ago.
    Suppressed { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Issued; the instance has not been seen healthy since.
    Pending,
    Recovered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairAttempt {
    pub action: RepairActionKind,
    pub initiated_at: DateTime<Utc>,
    pub outcome: RepairOutcome,
}

#[derive(Debug, Clone)]
struct InstanceRepairState {
    phase: RepairPhase,
    history: VecDeque<RepairAttempt>,
}

impl Default for InstanceRepairState {
    fn default() -> Self {
        Self {
            phase: RepairPhase::Monitoring,
            history: VecDeque::new(),
        }
    }
}

impl InstanceRepairState {
    fn settle_pending(&mut self, outcome: RepairOutcome) {
        for attempt in self.history.iter_mut() {
            if attempt.outcome == RepairOutcome::Pending {
                attempt.outcome = outcome;
            }
        }
    }

    fn failures_since(&self, since: DateTime<Utc>) -> usize {
        self.history
            .iter()
            .filter(|a| a.outcome == RepairOutcome::Failed && a.initiated_at >= since)
            .count()
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Per-instance repair state machine for one scale set.
///
/// The controller only decides; issuing the cloud call is the caller's job,
/// which reports back through `complete`.
#[derive(Debug, Default)]
pub struct AutoRepairController {
    instances: HashMap<String, InstanceRepairState>,
}

impl AutoRepairController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what to do about one instance.
    ///
    /// `policy` is read on every call, so disabling repair takes effect on the
    /// next tick. `last_repair_at` is the cloud's own record and counts toward
    /// the cooldown alongside this controller's history.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        instance_id: &str,
        observation: RepairObservation,
        policy: &AutoRepairPolicy,
        last_repair_at: Option<DateTime<Utc>>,
    ) -> RepairDecision {
        let state = self.instances.entry(instance_id.to_string()).or_default();

        if observation.health == HealthState::Healthy {
            state.settle_pending(RepairOutcome::Recovered);
            if let RepairPhase::Repairing(action) = &state.phase {
                info!(
                    "Instance {} healthy again, dropping in-flight {} ({})",
                    instance_id, action.action, action.id
                );
                state.phase = RepairPhase::Monitoring;
            }
        }

        if !policy.enabled {
            state.phase = RepairPhase::Monitoring;
            return RepairDecision::NoAction;
        }

        if matches!(state.phase, RepairPhase::Repairing(_)) {
            return RepairDecision::AlreadyRepairing;
        }

        let cooldown = chrono_duration(policy.cooldown_period);
        let last_repair = state
            .history
            .back()
            .map(|a| a.initiated_at)
            .into_iter()
            .chain(last_repair_at)
            .max();
        if let Some(until) = last_repair.map(|last| last + cooldown) {
            if now < until {
                state.phase = RepairPhase::Suppressed { until };
                return RepairDecision::NoAction;
            }
        }
        state.phase = RepairPhase::Monitoring;

        let grace_elapsed = observation.health == HealthState::Unhealthy
            && observation
                .unhealthy_since
                .is_some_and(|since| now >= since + chrono_duration(policy.grace_period));
        if !grace_elapsed {
            return RepairDecision::NoAction;
        }

        // Still unhealthy past the cooldown: the previous repair did not help.
        state.settle_pending(RepairOutcome::Failed);

        let window = cooldown * ESCALATION_WINDOW_MULTIPLIER as i32;
        let recent_failures = state.failures_since(now - window);
        let kind = if recent_failures >= ESCALATION_FAILURE_THRESHOLD {
            RepairActionKind::Replace
        } else {
            RepairActionKind::Reimage
        };

        let action = RepairAction {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            reason: format!(
                "unhealthy since {} ({} failed repairs in the last {}m)",
                observation
                    .unhealthy_since
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                recent_failures,
                window.num_minutes()
            ),
            action: kind,
            initiated_at: now,
        };

        state.history.push_back(RepairAttempt {
            action: kind,
            initiated_at: now,
            outcome: RepairOutcome::Pending,
        });
        while state.history.len() > MAX_REPAIR_HISTORY {
            state.history.pop_front();
        }
        state.phase = RepairPhase::Repairing(action.clone());

        info!(
            "Repair {} decided for {}: {}",
            kind, instance_id, action.reason
        );
        RepairDecision::Repair(action)
    }

    /// End the Repairing phase once the cloud call returned. A failed call
    /// counts toward escalation.
    pub fn complete(&mut self, instance_id: &str, succeeded: bool) -> Option<RepairAction> {
        let state = self.instances.get_mut(instance_id)?;
        let RepairPhase::Repairing(action) =
            std::mem::replace(&mut state.phase, RepairPhase::Monitoring)
        else {
            return None;
        };
        if !succeeded {
            warn!("Repair {} of {} failed", action.action, instance_id);
            if let Some(last) = state.history.back_mut() {
                last.outcome = RepairOutcome::Failed;
            }
        }
        Some(action)
    }

    pub fn phase(&self, instance_id: &str) -> RepairPhase {
        self.instances
            .get(instance_id)
            .map(|s| s.phase.clone())
            .unwrap_or(RepairPhase::Monitoring)
    }

    pub fn is_repairing(&self, instance_id: &str) -> bool {
        matches!(self.phase(instance_id), RepairPhase::Repairing(_))
    }

    /// Instances with a repair decided and not yet completed.
    pub fn repairing(&self) -> HashSet<String> {
        self.instances
            .iter()
            .filter(|(_, s)| matches!(s.phase, RepairPhase::Repairing(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn history(&self, instance_id: &str) -> Vec<RepairAttempt> {
        self.instances
            .get(instance_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keep only the instances still present in the scale set.
    pub fn retain(&mut self, present: &HashSet<&str>) {
        self.instances.retain(|id, _| present.contains(id.as_str()));
    }
}
