//! Per-scale-set reconcile loop.
//!
//! Each tick reads one snapshot of the fleet (instances, probe results,
//! identity), turns it into a `TickPlan` of effects without doing any I/O,
//! and then executes those effects through the cloud client. Planning and
//! execution are separate so the decision logic can be driven by any host.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pkg_cloud::{CloudClient, HealthProbe};
use pkg_constants::health::DEFAULT_UNHEALTHY_THRESHOLD;
use pkg_constants::rollout::{DEFAULT_APPLY_CONCURRENCY, DEFAULT_TICK_INTERVAL_SECS};
use pkg_metrics::names;
use pkg_scheduler::{BatchDecision, ExtensionBatch, ExtensionGraph, InstanceBatch, UpgradeBatchPlanner};
use pkg_types::error::ConfigError;
use pkg_types::event::{FleetEvent, PauseReason};
use pkg_types::extension::Extension;
use pkg_types::identity::{IdentitySpec, IdentityType};
use pkg_types::instance::{HealthState, Instance, ProvisioningState};
use pkg_types::repair::{RepairAction, RepairActionKind};
use pkg_types::scaleset::ScaleSet;
use pkg_types::validate::validate_scale_set;

use crate::events::EventLog;
use crate::health::{HealthMonitor, ProbeResult};
use crate::identity::{self, IdentityPatch, IdentityStep};
use crate::repair::{AutoRepairController, RepairDecision, RepairObservation};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tick_interval: Duration,
    /// Upper bound on concurrent cloud calls within one extension level.
    pub apply_concurrency: usize,
    pub unhealthy_threshold: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            apply_concurrency: DEFAULT_APPLY_CONCURRENCY,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }
}

/// Point-in-time view of one scale set, read once per tick.
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    pub instances: Vec<Instance>,
    /// Probe result per instance; absent when the scale set has no health signal.
    pub probes: BTreeMap<String, ProbeResult>,
    pub identity: IdentitySpec,
}

/// What one instance of a batch still needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceWork {
    pub instance_id: String,
    pub image_reference: Option<String>,
    pub extensions: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutPlan {
    pub batch: InstanceBatch,
    pub manual: bool,
    pub work: Vec<InstanceWork>,
    /// Extension levels restricted to what the batch needs, in apply order.
    pub levels: Vec<ExtensionBatch>,
    pub time_budget: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Event(FleetEvent),
    Repair(RepairAction),
    Rollout(RolloutPlan),
    PatchIdentity(IdentityPatch),
}

/// Effects decided for one tick, in execution order.
#[derive(Debug, Clone)]
pub struct TickPlan {
    pub scale_set: String,
    pub now: DateTime<Utc>,
    pub desired_identity: IdentityType,
    pub effects: Vec<Effect>,
}

impl TickPlan {
    pub fn events(&self) -> impl Iterator<Item = &FleetEvent> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Event(event) => Some(event),
            _ => None,
        })
    }

    pub fn rollout(&self) -> Option<&RolloutPlan> {
        self.effects.iter().find_map(|e| match e {
            Effect::Rollout(plan) => Some(plan),
            _ => None,
        })
    }

    pub fn repairs(&self) -> Vec<&RepairAction> {
        self.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Repair(action) => Some(action),
                _ => None,
            })
            .collect()
    }

    pub fn identity_patch(&self) -> Option<&IdentityPatch> {
        self.effects.iter().find_map(|e| match e {
            Effect::PatchIdentity(patch) => Some(patch),
            _ => None,
        })
    }

    pub fn pause_reason(&self) -> Option<&PauseReason> {
        self.events().find_map(|e| match e {
            FleetEvent::Paused { reason, .. } => Some(reason),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub index: u32,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Left half-applied because the rollout was cancelled between levels.
    pub incomplete: Vec<String>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub repairs: Vec<(RepairAction, bool)>,
    pub batch: Option<BatchResult>,
    pub identity_applied: Option<bool>,
}

#[derive(Debug)]
pub enum TickOutcome {
    Cancelled,
    /// A cloud read failed; nothing was decided this tick.
    NotObserved(String),
    Executed {
        plan: TickPlan,
        report: ExecutionReport,
    },
}

/// External "update instances" trigger for `Manual` scale sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualUpgrade {
    All,
    Instances(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct ManualUpgradeHandle {
    tx: mpsc::UnboundedSender<ManualUpgrade>,
}

impl ManualUpgradeHandle {
    /// Returns false once the orchestrator is gone.
    pub fn request(&self, upgrade: ManualUpgrade) -> bool {
        self.tx.send(upgrade).is_ok()
    }
}

/// Wall-clock time driven by the tokio clock, so paused-time tests and the
/// pause deadlines agree.
#[derive(Debug, Clone, Copy)]
struct TickClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl TickClock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall
            + chrono::Duration::from_std(self.mono.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Everything that can be checked about the desired state before touching
/// the fleet.
fn check_desired(desired: &ScaleSet) -> Result<ExtensionGraph, ConfigError> {
    validate_scale_set(desired)?;
    ExtensionGraph::build(&desired.extensions)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reconciles one scale set toward its desired state.
pub struct FleetOrchestrator {
    scale_set: String,
    cloud: Arc<dyn CloudClient>,
    probe: Arc<dyn HealthProbe>,
    events: EventLog,
    config: OrchestratorConfig,
    clock: TickClock,
    health: HealthMonitor,
    repair: AutoRepairController,
    planner: UpgradeBatchPlanner,
    manual_request: Option<ManualUpgrade>,
    manual_tx: mpsc::UnboundedSender<ManualUpgrade>,
    manual_rx: mpsc::UnboundedReceiver<ManualUpgrade>,
    /// End of the current pause window, if a rollout is waiting on one.
    wake_at: Option<Instant>,
}

impl FleetOrchestrator {
    pub fn new(
        scale_set: &str,
        cloud: Arc<dyn CloudClient>,
        probe: Arc<dyn HealthProbe>,
        events: EventLog,
        config: OrchestratorConfig,
    ) -> Self {
        let (manual_tx, manual_rx) = mpsc::unbounded_channel();
        Self {
            scale_set: scale_set.to_string(),
            cloud,
            probe,
            events,
            health: HealthMonitor::new(config.unhealthy_threshold),
            config,
            clock: TickClock::new(),
            repair: AutoRepairController::new(),
            planner: UpgradeBatchPlanner::new(),
            manual_request: None,
            manual_tx,
            manual_rx,
            wake_at: None,
        }
    }

    pub fn scale_set(&self) -> &str {
        &self.scale_set
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn repair(&self) -> &AutoRepairController {
        &self.repair
    }

    pub fn planner(&self) -> &UpgradeBatchPlanner {
        &self.planner
    }

    pub fn manual_handle(&self) -> ManualUpgradeHandle {
        ManualUpgradeHandle {
            tx: self.manual_tx.clone(),
        }
    }

    /// Stage an explicit upgrade; it is applied on the next tick. Requests
    /// accumulate until then.
    pub fn request_manual_upgrade(&mut self, upgrade: ManualUpgrade) {
        self.manual_request = Some(match (self.manual_request.take(), upgrade) {
            (Some(ManualUpgrade::All), _) | (_, ManualUpgrade::All) => ManualUpgrade::All,
            (Some(ManualUpgrade::Instances(mut a)), ManualUpgrade::Instances(b)) => {
                a.extend(b);
                ManualUpgrade::Instances(a)
            }
            (None, upgrade) => upgrade,
        });
    }

    /// Start the reconcile loop as a background task.
    pub fn start(
        self,
        desired_rx: watch::Receiver<ScaleSet>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(desired_rx, cancel))
    }

    /// Tick on the interval, on every desired-state change, on manual
    /// triggers and when a pause window ends, until cancelled.
    pub async fn run(mut self, mut desired_rx: watch::Receiver<ScaleSet>, cancel: CancellationToken) {
        info!(
            "FleetOrchestrator[{}] started (interval={}s, concurrency={}, cloud={})",
            self.scale_set,
            self.config.tick_interval.as_secs(),
            self.config.apply_concurrency,
            self.cloud.name()
        );
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake_at = self.wake_at;
            let mut manual = None;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                changed = desired_rx.changed() => {
                    if changed.is_err() {
                        info!("FleetOrchestrator[{}] desired state closed", self.scale_set);
                        break;
                    }
                    interval.reset();
                }
                Some(request) = self.manual_rx.recv() => manual = Some(request),
                _ = sleep_until_opt(wake_at) => {
                    debug!("FleetOrchestrator[{}] pause window over", self.scale_set);
                }
            }
            if let Some(request) = manual {
                self.request_manual_upgrade(request);
            }

            let desired = desired_rx.borrow_and_update().clone();
            match self.tick(&desired, &cancel).await {
                Ok(TickOutcome::Cancelled) => break,
                Ok(_) => {}
                Err(e) => warn!("FleetOrchestrator[{}] configuration error: {}", self.scale_set, e),
            }
        }
        info!("FleetOrchestrator[{}] stopped", self.scale_set);
    }

    /// One full reconcile pass: observe, plan, execute.
    ///
    /// A configuration error aborts before anything is read or changed. A
    /// failed cloud read yields `NotObserved` and no decisions.
    pub async fn tick(
        &mut self,
        desired: &ScaleSet,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome, ConfigError> {
        self.wake_at = None;
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }
        let metrics = self.events.metrics().clone();
        let labels = [("scale_set", self.scale_set.as_str())];
        metrics.counter_inc(names::TICKS_TOTAL, &labels);

        if let Err(e) = check_desired(desired) {
            metrics.counter_inc(names::CONFIG_ERRORS_TOTAL, &labels);
            return Err(e);
        }

        let snapshot = match self.observe(desired).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("FleetOrchestrator[{}] observe error: {}", self.scale_set, e);
                metrics.counter_inc(names::TICK_ERRORS_TOTAL, &labels);
                return Ok(TickOutcome::NotObserved(e.to_string()));
            }
        };

        let now = self.clock.now();
        let plan = self.plan_tick(now, desired, &snapshot)?;

        let unhealthy = snapshot
            .instances
            .iter()
            .filter(|i| self.health.state(&i.id) == HealthState::Unhealthy)
            .count();
        let labels = [("scale_set", self.scale_set.as_str())];
        metrics.gauge_set(names::INSTANCES, &labels, snapshot.instances.len() as i64);
        metrics.gauge_set(names::UNHEALTHY_INSTANCES, &labels, unhealthy as i64);

        let report = self.execute(&plan, cancel).await;
        Ok(TickOutcome::Executed { plan, report })
    }

    /// Read instances, probe results and identity for one tick.
    pub async fn observe(&self, desired: &ScaleSet) -> anyhow::Result<FleetSnapshot> {
        let instances = self
            .cloud
            .list_instances(&self.scale_set)
            .await
            .map_err(|e| anyhow!("list instances of {}: {}", self.scale_set, e))?;

        let probes: BTreeMap<String, ProbeResult> = if desired.has_health_signal() {
            let ids: Vec<String> = instances
                .iter()
                .filter(|i| i.provisioning_state != ProvisioningState::Deleting)
                .map(|i| i.id.clone())
                .collect();
            stream::iter(ids)
                .map(|id| {
                    let probe = self.probe.clone();
                    let scale_set = self.scale_set.clone();
                    async move {
                        let result = ProbeResult::from(probe.probe(&scale_set, &id).await);
                        (id, result)
                    }
                })
                .buffer_unordered(self.config.apply_concurrency.max(1))
                .collect()
                .await
        } else {
            BTreeMap::new()
        };

        let identity = self
            .cloud
            .get_identity(&self.scale_set)
            .await
            .map_err(|e| anyhow!("get identity of {}: {}", self.scale_set, e))?;

        Ok(FleetSnapshot {
            instances,
            probes,
            identity,
        })
    }

    /// Decide this tick's effects. No I/O; only the orchestrator's own
    /// health, repair and rollout bookkeeping changes.
    pub fn plan_tick(
        &mut self,
        now: DateTime<Utc>,
        desired: &ScaleSet,
        snapshot: &FleetSnapshot,
    ) -> Result<TickPlan, ConfigError> {
        let graph = check_desired(desired)?;
        if desired.name != self.scale_set {
            return Err(ConfigError::name(format!(
                "desired state for '{}' handed to the orchestrator of '{}'",
                desired.name, self.scale_set
            )));
        }

        let mut effects = Vec::new();
        self.wake_at = None;

        // Health: classify every member from this tick's probes.
        let present: HashSet<&str> = snapshot.instances.iter().map(|i| i.id.as_str()).collect();
        self.health.retain(&present);
        self.repair.retain(&present);

        let mut fleet: Vec<Instance> = Vec::with_capacity(snapshot.instances.len());
        for instance in &snapshot.instances {
            let mut instance = instance.clone();
            if let Some(probe) = snapshot.probes.get(&instance.id) {
                instance.health_state = self.health.observe(&instance.id, probe.clone(), now);
            } else if self.health.record(&instance.id).is_some() {
                instance.health_state = self.health.state(&instance.id);
            }
            fleet.push(instance);
        }

        // Repair: instances repaired now are kept out of the rollout.
        let mut busy: BTreeSet<String> = BTreeSet::new();
        for instance in &fleet {
            let observation = RepairObservation {
                health: instance.health_state,
                unhealthy_since: self.health.unhealthy_since(&instance.id),
            };
            match self.repair.tick(
                now,
                &instance.id,
                observation,
                &desired.auto_repair,
                instance.last_repair_at,
            ) {
                RepairDecision::Repair(action) => {
                    effects.push(Effect::Event(FleetEvent::RepairTriggered {
                        scale_set: self.scale_set.clone(),
                        instance_id: action.instance_id.clone(),
                        action: action.action,
                    }));
                    effects.push(Effect::Repair(action));
                    busy.insert(instance.id.clone());
                }
                RepairDecision::AlreadyRepairing => {
                    busy.insert(instance.id.clone());
                }
                RepairDecision::NoAction => {}
            }
        }

        // Upgrade.
        let target = desired.desired_configuration();
        let batch = match desired.upgrade_policy.effective_policy() {
            Some(policy) => {
                if let Some(ignored) = self.manual_request.take() {
                    info!(
                        "FleetOrchestrator[{}] ignoring manual upgrade {:?}: mode is {}",
                        self.scale_set, ignored, desired.upgrade_policy.mode
                    );
                }
                match self
                    .planner
                    .next_batch_excluding(now, &fleet, &target, &policy, &busy)
                {
                    BatchDecision::UpToDate => None,
                    BatchDecision::Batch(batch) => Some((batch, false)),
                    BatchDecision::Paused(reason) => {
                        if let PauseReason::PauseWindow { remaining } = &reason {
                            self.wake_at = Instant::now().checked_add(*remaining);
                        }
                        effects.push(Effect::Event(FleetEvent::Paused {
                            scale_set: self.scale_set.clone(),
                            reason,
                        }));
                        None
                    }
                }
            }
            None => self
                .manual_request
                .take()
                .and_then(|request| {
                    let requested: BTreeSet<String> = match request {
                        ManualUpgrade::All => fleet.iter().map(|i| i.id.clone()).collect(),
                        ManualUpgrade::Instances(ids) => ids,
                    };
                    let requested: BTreeSet<String> = requested.difference(&busy).cloned().collect();
                    self.planner.manual_batch(&fleet, &target, &requested)
                })
                .map(|batch| (batch, true)),
        };

        if let Some((batch, manual)) = batch {
            let by_id: HashMap<&str, &Instance> = fleet.iter().map(|i| (i.id.as_str(), i)).collect();
            let work: Vec<InstanceWork> = batch
                .instance_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|instance| InstanceWork {
                    instance_id: instance.id.clone(),
                    image_reference: target
                        .needs_image(instance)
                        .then(|| target.image_reference.clone()),
                    extensions: target.pending_extensions(instance),
                })
                .collect();
            let needed: BTreeSet<String> = work
                .iter()
                .flat_map(|w| w.extensions.iter().cloned())
                .collect();

            effects.push(Effect::Event(FleetEvent::BatchStarted {
                scale_set: self.scale_set.clone(),
                batch: batch.index,
                instances: batch.instance_ids.clone(),
            }));
            effects.push(Effect::Rollout(RolloutPlan {
                levels: graph.restrict(&needed),
                batch,
                manual,
                work,
                time_budget: desired.extensions_time_budget,
            }));
        }

        // Identity.
        let patch = identity::diff(&desired.identity, &snapshot.identity);
        if !patch.is_empty() {
            effects.push(Effect::PatchIdentity(patch));
        }

        Ok(TickPlan {
            scale_set: self.scale_set.clone(),
            now,
            desired_identity: desired.identity.identity_type,
            effects,
        })
    }

    /// Carry out a plan's effects in order.
    pub async fn execute(&mut self, plan: &TickPlan, cancel: &CancellationToken) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for effect in &plan.effects {
            match effect {
                Effect::Event(event) => {
                    self.events.emit(event.clone(), plan.now).await;
                }
                Effect::Repair(action) => {
                    let succeeded = self.execute_repair(action).await;
                    report.repairs.push((action.clone(), succeeded));
                }
                Effect::Rollout(rollout) => {
                    report.batch = Some(self.execute_rollout(rollout, cancel).await);
                }
                Effect::PatchIdentity(patch) => {
                    report.identity_applied =
                        Some(self.execute_identity_patch(patch, plan.desired_identity).await);
                }
            }
        }
        report
    }

    async fn execute_repair(&mut self, action: &RepairAction) -> bool {
        let result = match action.action {
            RepairActionKind::Reimage => self.cloud.reimage(&self.scale_set, &action.instance_id).await,
            RepairActionKind::Replace => self.cloud.replace(&self.scale_set, &action.instance_id).await,
        };
        let succeeded = match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "FleetOrchestrator[{}] {} of {} failed: {}",
                    self.scale_set, action.action, action.instance_id, e
                );
                false
            }
        };
        self.repair.complete(&action.instance_id, succeeded);
        if succeeded && action.action == RepairActionKind::Replace {
            self.health.forget(&action.instance_id);
        }
        self.events
            .emit(
                FleetEvent::RepairCompleted {
                    scale_set: self.scale_set.clone(),
                    instance_id: action.instance_id.clone(),
                    action: action.action,
                    succeeded,
                },
                self.clock.now(),
            )
            .await;
        succeeded
    }

    /// Apply one batch: image first, then each extension level in order.
    /// Within a level instances run concurrently; an instance that fails
    /// skips its later levels. Cancellation is honoured between levels.
    async fn execute_rollout(&mut self, rollout: &RolloutPlan, cancel: &CancellationToken) -> BatchResult {
        let concurrency = self.config.apply_concurrency.max(1);
        let deadline = Instant::now() + rollout.time_budget;
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut cancelled = false;
        let mut image_done = false;
        let mut applied_levels: HashSet<&str> = HashSet::new();

        let image_jobs: Vec<(String, String)> = rollout
            .work
            .iter()
            .filter_map(|w| w.image_reference.clone().map(|img| (w.instance_id.clone(), img)))
            .collect();
        if cancel.is_cancelled() {
            cancelled = true;
        } else {
            let results: Vec<(String, anyhow::Result<()>)> = stream::iter(image_jobs)
                .map(|(id, image)| {
                    let cloud = self.cloud.clone();
                    let scale_set = self.scale_set.clone();
                    async move {
                        let result = timeout_at(deadline, cloud.upgrade_image(&scale_set, &id, &image))
                            .await
                            .unwrap_or_else(|_| Err(anyhow!("time budget exceeded during image upgrade")));
                        (id, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for (id, result) in results {
                if let Err(e) = result {
                    warn!("FleetOrchestrator[{}] image upgrade of {} failed: {}", self.scale_set, id, e);
                    failed.insert(id);
                }
            }
            image_done = true;
        }

        for level in &rollout.levels {
            if cancelled || cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let jobs: Vec<(String, Extension)> = rollout
                .work
                .iter()
                .filter(|w| !failed.contains(&w.instance_id))
                .flat_map(|w| {
                    level
                        .extensions
                        .iter()
                        .filter(move |e| w.extensions.contains(&e.name))
                        .map(move |e| (w.instance_id.clone(), e.clone()))
                })
                .collect();
            debug!(
                "FleetOrchestrator[{}] batch {} level {}: {} apply(s)",
                self.scale_set,
                rollout.batch.index,
                level.level,
                jobs.len()
            );

            let results: Vec<(String, String, anyhow::Result<()>)> = stream::iter(jobs)
                .map(|(id, extension)| {
                    let cloud = self.cloud.clone();
                    let scale_set = self.scale_set.clone();
                    async move {
                        let result = timeout_at(deadline, cloud.apply_extension(&scale_set, &id, &extension))
                            .await
                            .unwrap_or_else(|_| Err(anyhow!("extensions time budget exceeded")));
                        (id, extension.name, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for (id, extension, result) in results {
                if let Err(e) = result {
                    warn!(
                        "FleetOrchestrator[{}] extension {} on {} failed: {}",
                        self.scale_set, extension, id, e
                    );
                    failed.insert(id);
                }
            }
            applied_levels.extend(level.extensions.iter().map(|e| e.name.as_str()));
        }

        let mut result = BatchResult {
            index: rollout.batch.index,
            cancelled,
            ..BatchResult::default()
        };
        for w in &rollout.work {
            let complete = (w.image_reference.is_none() || image_done)
                && w.extensions.iter().all(|e| applied_levels.contains(e.as_str()));
            if failed.contains(&w.instance_id) {
                result.failed.push(w.instance_id.clone());
            } else if complete {
                result.succeeded.push(w.instance_id.clone());
            } else {
                result.incomplete.push(w.instance_id.clone());
            }
        }
        if cancelled {
            info!(
                "FleetOrchestrator[{}] batch {} cancelled, {} instance(s) left half-applied",
                self.scale_set,
                rollout.batch.index,
                result.incomplete.len()
            );
        }

        let now = self.clock.now();
        self.planner
            .record_batch_completed(now, &rollout.batch, &result.succeeded);
        self.events
            .emit(
                FleetEvent::BatchCompleted {
                    scale_set: self.scale_set.clone(),
                    batch: rollout.batch.index,
                    succeeded: result.succeeded.clone(),
                    failed: result.failed.clone(),
                    cancelled,
                },
                now,
            )
            .await;
        result
    }

    /// Run the patch's cloud calls in order, stopping at the first failure.
    /// A partial patch is re-diffed next tick.
    async fn execute_identity_patch(&mut self, patch: &IdentityPatch, desired_type: IdentityType) -> bool {
        for step in patch.steps() {
            let result = match &step {
                IdentityStep::SetType(t) => self.cloud.set_identity_type(&self.scale_set, *t).await,
                IdentityStep::Attach(id) => self.cloud.attach_identity(&self.scale_set, id).await,
                IdentityStep::Detach(id) => self.cloud.detach_identity(&self.scale_set, id).await,
            };
            if let Err(e) = result {
                warn!(
                    "FleetOrchestrator[{}] identity step {:?} failed: {}",
                    self.scale_set, step, e
                );
                return false;
            }
        }
        self.events
            .emit(
                FleetEvent::IdentityPatchApplied {
                    scale_set: self.scale_set.clone(),
                    identity_type: desired_type,
                    attached: patch.attach.iter().cloned().collect(),
                    detached: patch.detach.iter().cloned().collect(),
                },
                self.clock.now(),
            )
            .await;
        true
    }
}
