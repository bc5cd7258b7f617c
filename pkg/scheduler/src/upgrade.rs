//! Rolling upgrade batch planning.
//!
//! One planner per scale set. It remembers only the progress of the current
//! rollout (which instances were upgraded, when the last batch finished);
//! everything else is read from the fleet snapshot passed in each tick.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::debug;

use pkg_types::desired::DesiredConfiguration;
use pkg_types::event::PauseReason;
use pkg_types::instance::{Instance, ProvisioningState};
use pkg_types::scaleset::RollingPolicy;

/// Instances selected for one wave of a rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceBatch {
    /// 1-based position of this batch within the rollout.
    pub index: u32,
    /// Sorted ascending.
    pub instance_ids: Vec<String>,
    /// Desired configuration hash this batch converges to.
    pub target_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    UpToDate,
    Batch(InstanceBatch),
    Paused(PauseReason),
}

#[derive(Debug, Clone, Default)]
struct RolloutProgress {
    target_hash: String,
    batches_started: u32,
    upgraded: BTreeSet<String>,
    last_completed_at: Option<DateTime<Utc>>,
}

/// Read-only view of the current rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutStatus {
    pub target_hash: String,
    pub batches_started: u32,
    pub upgraded: usize,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// `ceil(percent/100 * fleet)`, at least 1 for a non-empty fleet.
pub fn batch_size(fleet_len: usize, max_batch_percent: u32) -> usize {
    if fleet_len == 0 {
        return 0;
    }
    (fleet_len * max_batch_percent as usize).div_ceil(100).max(1)
}

/// `count / total * 100 <= max_percent`, boundary inclusive.
fn within_budget(count: usize, total: usize, max_percent: u32) -> bool {
    count * 100 <= max_percent as usize * total
}

#[derive(Debug, Default)]
pub struct UpgradeBatchPlanner {
    progress: RolloutProgress,
}

impl UpgradeBatchPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> RolloutStatus {
        RolloutStatus {
            target_hash: self.progress.target_hash.clone(),
            batches_started: self.progress.batches_started,
            upgraded: self.progress.upgraded.len(),
            last_completed_at: self.progress.last_completed_at,
        }
    }

    /// Plan the next wave for a `Rolling` (or `Automatic`, via its preset)
    /// scale set.
    pub fn next_batch(
        &mut self,
        now: DateTime<Utc>,
        fleet: &[Instance],
        desired: &DesiredConfiguration,
        policy: &RollingPolicy,
    ) -> BatchDecision {
        self.next_batch_excluding(now, fleet, desired, policy, &BTreeSet::new())
    }

    /// Same as `next_batch`, never selecting any instance in `busy` (for
    /// example instances under repair this tick).
    pub fn next_batch_excluding(
        &mut self,
        now: DateTime<Utc>,
        fleet: &[Instance],
        desired: &DesiredConfiguration,
        policy: &RollingPolicy,
        busy: &BTreeSet<String>,
    ) -> BatchDecision {
        let target_hash = desired.hash();
        self.start_rollout_if_changed(&target_hash);

        let pending: Vec<&Instance> = fleet
            .iter()
            .filter(|i| i.provisioning_state != ProvisioningState::Deleting)
            .filter(|i| !desired.is_satisfied_by(i))
            .collect();
        if pending.is_empty() {
            return BatchDecision::UpToDate;
        }

        if let Some(done) = self.progress.last_completed_at {
            // A clock step backwards counts as no time elapsed.
            let elapsed = (now - done).to_std().unwrap_or_default();
            if elapsed < policy.pause_time_between_batches {
                let remaining = policy.pause_time_between_batches - elapsed;
                return BatchDecision::Paused(PauseReason::PauseWindow { remaining });
            }
        }

        let unhealthy = fleet.iter().filter(|i| i.is_unhealthy()).count();
        if !within_budget(unhealthy, fleet.len(), policy.max_unhealthy_instance_percent) {
            return BatchDecision::Paused(PauseReason::UnhealthyBudgetExceeded {
                unhealthy,
                fleet_size: fleet.len(),
                max_percent: policy.max_unhealthy_instance_percent,
            });
        }

        let upgraded: Vec<&Instance> = fleet
            .iter()
            .filter(|i| self.progress.upgraded.contains(&i.id))
            .collect();
        let upgraded_unhealthy = upgraded.iter().filter(|i| i.is_unhealthy()).count();
        if !within_budget(
            upgraded_unhealthy,
            upgraded.len(),
            policy.max_unhealthy_upgraded_instance_percent,
        ) {
            return BatchDecision::Paused(PauseReason::UpgradedUnhealthyBudgetExceeded {
                unhealthy: upgraded_unhealthy,
                considered: upgraded.len(),
                max_percent: policy.max_unhealthy_upgraded_instance_percent,
            });
        }

        let mut eligible: Vec<&Instance> = pending
            .iter()
            .copied()
            .filter(|i| !i.is_unhealthy())
            .filter(|i| !i.provisioning_state.is_transitional())
            .filter(|i| !busy.contains(&i.id))
            .collect();
        if eligible.is_empty() {
            return BatchDecision::Paused(PauseReason::NoEligibleInstances {
                pending: pending.len(),
            });
        }
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        // Worst case every instance of the batch comes back unhealthy; that
        // must still fit the upgraded-unhealthy budget across the fleet.
        let ceiling =
            policy.max_unhealthy_upgraded_instance_percent as usize * fleet.len() / 100;
        let room = ceiling.saturating_sub(unhealthy);
        let size = batch_size(fleet.len(), policy.max_batch_instance_percent)
            .min(room)
            .min(eligible.len());
        if size == 0 {
            return BatchDecision::Paused(PauseReason::UpgradedUnhealthyBudgetExceeded {
                unhealthy,
                considered: fleet.len(),
                max_percent: policy.max_unhealthy_upgraded_instance_percent,
            });
        }

        self.progress.batches_started += 1;
        let batch = InstanceBatch {
            index: self.progress.batches_started,
            instance_ids: eligible
                .iter()
                .take(size)
                .map(|i| i.id.clone())
                .collect(),
            target_hash,
        };
        debug!(
            "Planned batch {} with {} of {} pending instances",
            batch.index,
            batch.instance_ids.len(),
            pending.len()
        );
        BatchDecision::Batch(batch)
    }

    /// Turn an explicit "update instances" request into one immediate batch.
    /// Used for `Manual` mode; health budgets and pacing do not apply.
    pub fn manual_batch(
        &mut self,
        fleet: &[Instance],
        desired: &DesiredConfiguration,
        requested: &BTreeSet<String>,
    ) -> Option<InstanceBatch> {
        let target_hash = desired.hash();
        self.start_rollout_if_changed(&target_hash);

        let instance_ids: Vec<String> = fleet
            .iter()
            .filter(|i| requested.contains(&i.id))
            .filter(|i| !i.provisioning_state.is_transitional())
            .filter(|i| !desired.is_satisfied_by(i))
            .map(|i| i.id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if instance_ids.is_empty() {
            return None;
        }

        self.progress.batches_started += 1;
        Some(InstanceBatch {
            index: self.progress.batches_started,
            instance_ids,
            target_hash,
        })
    }

    /// Record the end of a batch. Only `succeeded` instances count as
    /// upgraded; the pause window starts now.
    pub fn record_batch_completed(
        &mut self,
        now: DateTime<Utc>,
        batch: &InstanceBatch,
        succeeded: &[String],
    ) {
        if batch.target_hash != self.progress.target_hash {
            return;
        }
        self.progress.upgraded.extend(succeeded.iter().cloned());
        self.progress.last_completed_at = Some(now);
    }

    fn start_rollout_if_changed(&mut self, target_hash: &str) {
        if self.progress.target_hash != target_hash {
            if !self.progress.target_hash.is_empty() {
                debug!(
                    "Desired configuration changed ({} → {}), starting new rollout",
                    self.progress.target_hash, target_hash
                );
            }
            self.progress = RolloutProgress {
                target_hash: target_hash.to_string(),
                ..RolloutProgress::default()
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::extension::Extension;
    use pkg_types::instance::HealthState;
    use pkg_types::scaleset::ScaleSet;
    use std::time::Duration;

    fn desired() -> DesiredConfiguration {
        let mut ss = ScaleSet::new("web", 10);
        ss.extensions = vec![Extension::new("agent").with_force_update_tag("v2")];
        ss.desired_configuration()
    }

    fn fleet(n: usize) -> Vec<Instance> {
        (0..n)
            .map(|i| Instance::new(&format!("vm-{:02}", i)).with_health(HealthState::Healthy))
            .collect()
    }

    fn policy(batch: u32, unhealthy: u32, upgraded: u32, pause_secs: u64) -> RollingPolicy {
        RollingPolicy {
            max_batch_instance_percent: batch,
            max_unhealthy_instance_percent: unhealthy,
            max_unhealthy_upgraded_instance_percent: upgraded,
            pause_time_between_batches: Duration::from_secs(pause_secs),
        }
    }

    fn mark_upgraded(instance: &mut Instance) {
        instance
            .applied_extension_versions
            .insert("agent".into(), "1.0+v2".into());
    }

    fn expect_batch(decision: BatchDecision) -> InstanceBatch {
        match decision {
            BatchDecision::Batch(b) => b,
            other => panic!("expected a batch, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_size_rounds_up() {
        assert_eq!(batch_size(10, 21), 3);
        assert_eq!(batch_size(10, 20), 2);
        assert_eq!(batch_size(3, 1), 1);
        assert_eq!(batch_size(10, 100), 10);
        assert_eq!(batch_size(0, 50), 0);
    }

    #[test]
    fn test_selects_lowest_ids_first() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(10);
        instances.reverse();
        let batch = expect_batch(planner.next_batch(
            Utc::now(),
            &instances,
            &desired(),
            &policy(21, 20, 100, 0),
        ));
        assert_eq!(batch.instance_ids, vec!["vm-00", "vm-01", "vm-02"]);
        assert_eq!(batch.index, 1);
    }

    #[test]
    fn test_unhealthy_budget_boundary_is_inclusive() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(10);
        instances[8].health_state = HealthState::Unhealthy;
        instances[9].health_state = HealthState::Unhealthy;
        let decision = planner.next_batch(Utc::now(), &instances, &desired(), &policy(20, 20, 100, 0));
        let batch = expect_batch(decision);
        assert!(!batch.instance_ids.contains(&"vm-08".to_string()));

        instances[7].health_state = HealthState::Unhealthy;
        let decision = planner.next_batch(Utc::now(), &instances, &desired(), &policy(20, 20, 100, 0));
        assert!(matches!(
            decision,
            BatchDecision::Paused(PauseReason::UnhealthyBudgetExceeded { unhealthy: 3, .. })
        ));
    }

    #[test]
    fn test_unhealthy_instances_are_never_selected() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(4);
        instances[0].health_state = HealthState::Unhealthy;
        let batch = expect_batch(planner.next_batch(
            Utc::now(),
            &instances,
            &desired(),
            &policy(50, 50, 100, 0),
        ));
        assert_eq!(batch.instance_ids, vec!["vm-01", "vm-02"]);
    }

    #[test]
    fn test_up_to_date_fleet() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(3);
        instances.iter_mut().for_each(mark_upgraded);
        assert_eq!(
            planner.next_batch(Utc::now(), &instances, &desired(), &policy(50, 0, 0, 0)),
            BatchDecision::UpToDate
        );
    }

    #[test]
    fn test_pause_window_between_batches() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(4);
        let policy = policy(50, 0, 100, 300);
        let t0 = Utc::now();

        let batch = expect_batch(planner.next_batch(t0, &instances, &desired(), &policy));
        for inst in instances.iter_mut().filter(|i| batch.instance_ids.contains(&i.id)) {
            mark_upgraded(inst);
        }
        planner.record_batch_completed(t0, &batch, &batch.instance_ids);

        let early = t0 + chrono::Duration::seconds(120);
        match planner.next_batch(early, &instances, &desired(), &policy) {
            BatchDecision::Paused(PauseReason::PauseWindow { remaining }) => {
                assert_eq!(remaining, Duration::from_secs(180));
            }
            other => panic!("expected pause window, got {:?}", other),
        }

        let later = t0 + chrono::Duration::seconds(300);
        let next = expect_batch(planner.next_batch(later, &instances, &desired(), &policy));
        assert_eq!(next.index, 2);
        assert_eq!(next.instance_ids, vec!["vm-02", "vm-03"]);
    }

    #[test]
    fn test_long_pause_is_not_shortened() {
        let mut planner = UpgradeBatchPlanner::new();
        let instances = fleet(4);
        let policy = policy(25, 100, 100, u64::MAX / 2);
        let t0 = Utc::now();
        let batch = expect_batch(planner.next_batch(t0, &instances, &desired(), &policy));
        planner.record_batch_completed(t0, &batch, &batch.instance_ids);

        let later = t0 + chrono::Duration::days(365);
        match planner.next_batch(later, &instances, &desired(), &policy) {
            BatchDecision::Paused(PauseReason::PauseWindow { remaining }) => {
                assert!(remaining > Duration::from_secs(u64::MAX / 4));
            }
            other => panic!("expected pause window, got {:?}", other),
        }
    }

    #[test]
    fn test_upgraded_unhealthy_gate_blocks_next_batch() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(10);
        let policy = policy(20, 50, 30, 0);
        let t0 = Utc::now();

        let batch = expect_batch(planner.next_batch(t0, &instances, &desired(), &policy));
        assert_eq!(batch.instance_ids.len(), 2);
        for inst in instances.iter_mut().filter(|i| batch.instance_ids.contains(&i.id)) {
            mark_upgraded(inst);
            inst.health_state = HealthState::Unhealthy;
        }
        planner.record_batch_completed(t0, &batch, &batch.instance_ids);

        // 2 of 2 upgraded instances unhealthy: 100% > 30%.
        assert!(matches!(
            planner.next_batch(t0, &instances, &desired(), &policy),
            BatchDecision::Paused(PauseReason::UpgradedUnhealthyBudgetExceeded {
                unhealthy: 2,
                considered: 2,
                ..
            })
        ));

        // One recovers: 1 of 2 = 50% still over budget.
        instances[0].health_state = HealthState::Healthy;
        assert!(matches!(
            planner.next_batch(t0, &instances, &desired(), &policy),
            BatchDecision::Paused(PauseReason::UpgradedUnhealthyBudgetExceeded { .. })
        ));

        instances[1].health_state = HealthState::Healthy;
        assert!(matches!(
            planner.next_batch(t0, &instances, &desired(), &policy),
            BatchDecision::Batch(_)
        ));
    }

    #[test]
    fn test_projection_clamps_batch() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(10);
        instances[9].health_state = HealthState::Unhealthy;
        // Batch would be 5 but only 3 more may fail: (1 + 3) / 10 = 40%.
        let batch = expect_batch(planner.next_batch(
            Utc::now(),
            &instances,
            &desired(),
            &policy(50, 50, 40, 0),
        ));
        assert_eq!(batch.instance_ids.len(), 3);

        let mut planner = UpgradeBatchPlanner::new();
        assert!(matches!(
            planner.next_batch(Utc::now(), &instances, &desired(), &policy(50, 50, 10, 0)),
            BatchDecision::Paused(PauseReason::UpgradedUnhealthyBudgetExceeded { .. })
        ));
    }

    /// The fleet-wide ceiling rounds down, so a small fleet with a 20%
    /// upgraded-unhealthy budget never gets room for a single instance.
    #[test]
    fn test_small_fleet_with_tight_budget_never_starts() {
        for fleet_len in 1..=4 {
            let mut planner = UpgradeBatchPlanner::new();
            let instances = fleet(fleet_len);
            assert_eq!(
                planner.next_batch(Utc::now(), &instances, &desired(), &policy(20, 20, 20, 0)),
                BatchDecision::Paused(PauseReason::UpgradedUnhealthyBudgetExceeded {
                    unhealthy: 0,
                    considered: fleet_len,
                    max_percent: 20,
                })
            );
        }

        let mut planner = UpgradeBatchPlanner::new();
        let batch = expect_batch(planner.next_batch(
            Utc::now(),
            &fleet(5),
            &desired(),
            &policy(20, 20, 20, 0),
        ));
        assert_eq!(batch.instance_ids, vec!["vm-00"]);
    }

    /// No returned batch, if it all went unhealthy, pushes the fleet past the
    /// upgraded-unhealthy ceiling.
    #[test]
    fn test_projection_never_exceeds_budget() {
        for fleet_len in 1..=20usize {
            for unhealthy in 0..=fleet_len {
                for max_upgraded in [0u32, 10, 25, 33, 50, 75, 100] {
                    let mut instances = fleet(fleet_len);
                    for inst in instances.iter_mut().take(unhealthy) {
                        inst.health_state = HealthState::Unhealthy;
                    }
                    let mut planner = UpgradeBatchPlanner::new();
                    let decision = planner.next_batch(
                        Utc::now(),
                        &instances,
                        &desired(),
                        &policy(37, 100, max_upgraded, 0),
                    );
                    if let BatchDecision::Batch(batch) = decision {
                        let projected = unhealthy + batch.instance_ids.len();
                        assert!(
                            projected * 100 <= max_upgraded as usize * fleet_len,
                            "fleet={} unhealthy={} max={} batch={}",
                            fleet_len,
                            unhealthy,
                            max_upgraded,
                            batch.instance_ids.len()
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_automatic_preset_takes_whole_fleet() {
        let mut planner = UpgradeBatchPlanner::new();
        let instances = fleet(7);
        let batch = expect_batch(planner.next_batch(
            Utc::now(),
            &instances,
            &desired(),
            &RollingPolicy::automatic(),
        ));
        assert_eq!(batch.instance_ids.len(), 7);
    }

    #[test]
    fn test_busy_instances_are_skipped() {
        let mut planner = UpgradeBatchPlanner::new();
        let instances = fleet(4);
        let busy: BTreeSet<String> = ["vm-00".to_string()].into();
        let batch = expect_batch(planner.next_batch_excluding(
            Utc::now(),
            &instances,
            &desired(),
            &policy(50, 100, 100, 0),
            &busy,
        ));
        assert_eq!(batch.instance_ids, vec!["vm-01", "vm-02"]);
    }

    #[test]
    fn test_all_pending_unhealthy_pauses() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(2);
        instances[0].health_state = HealthState::Unhealthy;
        mark_upgraded(&mut instances[1]);
        assert!(matches!(
            planner.next_batch(Utc::now(), &instances, &desired(), &policy(50, 100, 100, 0)),
            BatchDecision::Paused(PauseReason::NoEligibleInstances { pending: 1 })
        ));
    }

    #[test]
    fn test_new_desired_state_restarts_rollout() {
        let mut planner = UpgradeBatchPlanner::new();
        let instances = fleet(4);
        let policy = policy(25, 100, 100, 600);
        let t0 = Utc::now();
        let batch = expect_batch(planner.next_batch(t0, &instances, &desired(), &policy));
        planner.record_batch_completed(t0, &batch, &batch.instance_ids);

        let mut ss = ScaleSet::new("web", 4);
        ss.extensions = vec![Extension::new("agent").with_force_update_tag("v3")];
        let changed = ss.desired_configuration();
        let batch = expect_batch(planner.next_batch(t0, &instances, &changed, &policy));
        assert_eq!(batch.index, 1);
        assert_eq!(planner.status().upgraded, 0);
    }

    #[test]
    fn test_manual_batch_uses_requested_subset() {
        let mut planner = UpgradeBatchPlanner::new();
        let mut instances = fleet(4);
        instances[3].health_state = HealthState::Unhealthy;
        mark_upgraded(&mut instances[1]);
        let requested: BTreeSet<String> =
            ["vm-01", "vm-03", "vm-99"].iter().map(|s| s.to_string()).collect();
        let batch = planner
            .manual_batch(&instances, &desired(), &requested)
            .unwrap();
        assert_eq!(batch.instance_ids, vec!["vm-03"]);

        let nothing: BTreeSet<String> = ["vm-01".to_string()].into();
        assert!(planner.manual_batch(&instances, &desired(), &nothing).is_none());
    }
}
