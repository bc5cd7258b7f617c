use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_cloud::SimulatedCloud;
use pkg_controllers::events::EventLog;
use pkg_controllers::fleet::{FleetOrchestrator, ManualUpgrade, ManualUpgradeHandle, OrchestratorConfig};
use pkg_types::config::DesiredStateFile;
use pkg_types::scaleset::{ScaleSet, UpgradeMode};

struct Member {
    desired_tx: watch::Sender<ScaleSet>,
    manual: ManualUpgradeHandle,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs one orchestrator task per scale set of the desired-state file and
/// keeps the set of tasks in line with the file as it changes.
pub struct Supervisor {
    cloud: SimulatedCloud,
    events: EventLog,
    config: OrchestratorConfig,
    /// Instances seeded for a scale set the cloud has never seen.
    seed_instances: Option<u32>,
    cancel: CancellationToken,
    members: HashMap<String, Member>,
}

impl Supervisor {
    pub fn new(
        cloud: SimulatedCloud,
        events: EventLog,
        config: OrchestratorConfig,
        seed_instances: Option<u32>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cloud,
            events,
            config,
            seed_instances,
            cancel,
            members: HashMap::new(),
        }
    }

    /// Push a freshly loaded desired state to the orchestrators: new scale
    /// sets get a task, changed ones are notified, missing ones are stopped.
    /// Returns the number of scale sets started or updated.
    pub fn apply(&mut self, desired: DesiredStateFile) -> usize {
        let mut seen: HashSet<String> = HashSet::new();
        let mut changed = 0;

        for scale_set in desired.scale_sets {
            if !seen.insert(scale_set.name.clone()) {
                warn!(
                    "Scale set {} declared more than once, ignoring the duplicate",
                    scale_set.name
                );
                continue;
            }
            match self.members.get(&scale_set.name) {
                Some(member) => {
                    let name = scale_set.name.clone();
                    let updated = member.desired_tx.send_if_modified(|current| {
                        if *current == scale_set {
                            return false;
                        }
                        *current = scale_set;
                        true
                    });
                    if updated {
                        info!("Desired state of scale set {} changed", name);
                        changed += 1;
                    }
                }
                None => {
                    self.spawn(scale_set);
                    changed += 1;
                }
            }
        }

        let removed: Vec<String> = self
            .members
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(member) = self.members.remove(&name) {
                info!("Scale set {} removed from desired state, stopping its orchestrator", name);
                member.cancel.cancel();
            }
        }

        changed
    }

    fn spawn(&mut self, scale_set: ScaleSet) {
        if self.cloud.instance_ids(&scale_set.name).is_empty() {
            let count = self.seed_instances.unwrap_or(scale_set.instance_count);
            // Fresh instances carry no managed image yet.
            self.cloud.seed(&scale_set.name, count, "");
        }

        let orchestrator = FleetOrchestrator::new(
            &scale_set.name,
            Arc::new(self.cloud.clone()),
            Arc::new(self.cloud.clone()),
            self.events.clone(),
            self.config.clone(),
        );
        let manual = orchestrator.manual_handle();
        let cancel = self.cancel.child_token();
        let name = scale_set.name.clone();
        let (desired_tx, desired_rx) = watch::channel(scale_set);
        let handle = orchestrator.start(desired_rx, cancel.clone());

        self.members.insert(
            name,
            Member {
                desired_tx,
                manual,
                cancel,
                handle,
            },
        );
    }

    /// Ask every `Manual` scale set to apply its staged changes to all
    /// instances.
    pub fn upgrade_manual_scale_sets(&self) -> usize {
        let mut requested = 0;
        for (name, member) in &self.members {
            if member.desired_tx.borrow().upgrade_policy.mode != UpgradeMode::Manual {
                continue;
            }
            if member.manual.request(ManualUpgrade::All) {
                info!("Manual upgrade requested for scale set {}", name);
                requested += 1;
            }
        }
        requested
    }

    pub fn scale_sets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every orchestrator and wait for the tasks to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, member) in self.members {
            if let Err(e) = member.handle.await {
                warn!("Orchestrator task for {} ended abnormally: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_cloud::CloudClient;
    use pkg_metrics::MetricsRegistry;
    use pkg_types::extension::Extension;
    use pkg_types::scaleset::UpgradePolicy;
    use std::time::Duration;

    fn supervisor(cloud: &SimulatedCloud) -> Supervisor {
        let events = EventLog::new(64, Arc::new(MetricsRegistry::with_fleet_metrics()));
        Supervisor::new(
            cloud.clone(),
            events,
            OrchestratorConfig::default(),
            None,
            CancellationToken::new(),
        )
    }

    fn scale_set(name: &str, mode: UpgradePolicy) -> ScaleSet {
        let mut ss = ScaleSet::new(name, 2);
        ss.health_probe_id = Some("/probes/http".into());
        ss.upgrade_policy = mode;
        ss.extensions = vec![Extension::new("agent")];
        ss
    }

    fn file(scale_sets: Vec<ScaleSet>) -> DesiredStateFile {
        DesiredStateFile { scale_sets }
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_starts_updates_and_stops() {
        let cloud = SimulatedCloud::new();
        let mut sup = supervisor(&cloud);

        let web = scale_set("web", UpgradePolicy::automatic());
        let api = scale_set("api", UpgradePolicy::automatic());
        assert_eq!(sup.apply(file(vec![web.clone(), api.clone()])), 2);
        assert_eq!(sup.scale_sets(), vec!["api", "web"]);
        assert_eq!(cloud.instance_ids("web").len(), 2);

        // Unchanged input is a no-op.
        assert_eq!(sup.apply(file(vec![web.clone(), api.clone()])), 0);

        let mut web_v2 = web.clone();
        web_v2.extensions = vec![Extension::new("agent").with_force_update_tag("v2")];
        assert_eq!(sup.apply(file(vec![web_v2])), 1);
        assert_eq!(sup.scale_sets(), vec!["web"]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        for inst in cloud.list_instances("web").await.unwrap() {
            assert_eq!(inst.applied_extension_versions["agent"], "1.0+v2");
        }
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_scale_sets_wait_for_request() {
        let cloud = SimulatedCloud::new();
        let mut sup = supervisor(&cloud);
        sup.apply(file(vec![
            scale_set("batch", UpgradePolicy::manual()),
            scale_set("web", UpgradePolicy::automatic()),
        ]));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let batch = cloud.list_instances("batch").await.unwrap();
        assert!(batch.iter().all(|i| i.applied_extension_versions.is_empty()));

        assert_eq!(sup.upgrade_manual_scale_sets(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let batch = cloud.list_instances("batch").await.unwrap();
        assert!(batch.iter().all(|i| i.applied_extension_versions.contains_key("agent")));
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_names_are_ignored() {
        let cloud = SimulatedCloud::new();
        let mut sup = supervisor(&cloud);
        let web = scale_set("web", UpgradePolicy::automatic());
        assert_eq!(sup.apply(file(vec![web.clone(), web])), 1);
        assert_eq!(sup.scale_sets(), vec!["web"]);
        sup.shutdown().await;
    }
}
