//! In-memory cloud used by the standalone server and by tests.
//!
//! Every scale set is a map of instances guarded by a `DashMap` shard, so
//! concurrent extension applies from one rollout do not serialize on a single
//! lock. Faults are injected per instance id.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use pkg_types::extension::Extension;
use pkg_types::identity::{IdentitySpec, IdentityType};
use pkg_types::instance::{Instance, ProvisioningState};

use crate::{CloudClient, HealthProbe};

/// Mutating calls kept for inspection; older ones are dropped first.
pub const DEFAULT_CALL_LOG_CAPACITY: usize = 4096;

/// A mutating call observed by the simulated cloud, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    ApplyExtension { instance_id: String, extension: String },
    UpgradeImage { instance_id: String, image_reference: String },
    Reimage { instance_id: String },
    Replace { instance_id: String },
    SetIdentityType { scale_set: String, identity_type: IdentityType },
    AttachIdentity { scale_set: String, identity_id: String },
    DetachIdentity { scale_set: String, identity_id: String },
}

#[derive(Debug, Default)]
struct SimulatedScaleSet {
    instances: BTreeMap<String, Instance>,
    identity: IdentitySpec,
    next_index: u32,
}

impl SimulatedScaleSet {
    fn instance_mut(&mut self, instance_id: &str) -> Result<&mut Instance> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| anyhow!("instance {} not found", instance_id))
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_applies: DashSet<String>,
    failing_repairs: DashSet<String>,
    unhealthy: DashSet<String>,
    probe_errors: DashSet<String>,
    failing_lists: DashSet<String>,
    apply_delay_ms: AtomicU64,
}

#[derive(Debug)]
struct CallLog {
    calls: VecDeque<CloudCall>,
    capacity: usize,
}

/// Concurrent in-memory cloud.
#[derive(Debug, Clone)]
pub struct SimulatedCloud {
    scale_sets: Arc<DashMap<String, SimulatedScaleSet>>,
    faults: Arc<Faults>,
    calls: Arc<Mutex<CallLog>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::with_call_log_capacity(DEFAULT_CALL_LOG_CAPACITY)
    }
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` recorded calls; 0 disables recording.
    pub fn with_call_log_capacity(capacity: usize) -> Self {
        Self {
            scale_sets: Arc::default(),
            faults: Arc::default(),
            calls: Arc::new(Mutex::new(CallLog {
                calls: VecDeque::new(),
                capacity,
            })),
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
        }
    }

    /// Create `count` instances named `<scale_set>_<n>` running `image_reference`.
    /// Existing members are kept; seeding is additive.
    pub fn seed(&self, scale_set: &str, count: u32, image_reference: &str) {
        let mut entry = self.scale_sets.entry(scale_set.to_string()).or_default();
        for _ in 0..count {
            let id = format!("{}_{}", scale_set, entry.next_index);
            entry.next_index += 1;
            let mut instance = Instance::new(&id);
            instance.image_reference = image_reference.to_string();
            entry.instances.insert(id, instance);
        }
        info!("Seeded {} simulated instances for scale set {}", count, scale_set);
    }

    /// Overwrite one instance, e.g. to pre-apply extensions in a test.
    pub fn put_instance(&self, scale_set: &str, instance: Instance) {
        self.scale_sets
            .entry(scale_set.to_string())
            .or_default()
            .instances
            .insert(instance.id.clone(), instance);
    }

    pub fn instance(&self, scale_set: &str, instance_id: &str) -> Option<Instance> {
        self.scale_sets
            .get(scale_set)
            .and_then(|s| s.instances.get(instance_id).cloned())
    }

    pub fn instance_ids(&self, scale_set: &str) -> Vec<String> {
        self.scale_sets
            .get(scale_set)
            .map(|s| s.instances.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_identity(&self, scale_set: &str, identity: IdentitySpec) {
        self.scale_sets.entry(scale_set.to_string()).or_default().identity = identity;
    }

    pub fn identity(&self, scale_set: &str) -> IdentitySpec {
        self.scale_sets
            .get(scale_set)
            .map(|s| s.identity.clone())
            .unwrap_or_default()
    }

    // --- Fault injection ---

    pub fn fail_applies(&self, instance_id: &str) {
        self.faults.failing_applies.insert(instance_id.to_string());
    }

    pub fn fail_repairs(&self, instance_id: &str) {
        self.faults.failing_repairs.insert(instance_id.to_string());
    }

    /// Make the probe report `instance_id` as failing until it is repaired or
    /// `set_healthy` is called.
    pub fn set_unhealthy(&self, instance_id: &str) {
        self.faults.unhealthy.insert(instance_id.to_string());
    }

    pub fn set_healthy(&self, instance_id: &str) {
        self.faults.unhealthy.remove(instance_id);
        self.faults.probe_errors.remove(instance_id);
    }

    pub fn fail_probes(&self, instance_id: &str) {
        self.faults.probe_errors.insert(instance_id.to_string());
    }

    pub fn fail_lists(&self, scale_set: &str, failing: bool) {
        if failing {
            self.faults.failing_lists.insert(scale_set.to_string());
        } else {
            self.faults.failing_lists.remove(scale_set);
        }
    }

    /// Delay every extension apply, to exercise time budgets and concurrency.
    pub fn set_apply_delay(&self, delay: Duration) {
        self.faults
            .apply_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    // --- Call inspection ---

    /// The most recent mutating calls, oldest first.
    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls
            .lock()
            .map(|log| log.calls.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut log) = self.calls.lock() {
            log.calls.clear();
        }
    }

    /// Highest number of extension applies observed running at once.
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: CloudCall) {
        if let Ok(mut log) = self.calls.lock() {
            if log.capacity == 0 {
                return;
            }
            if log.calls.len() >= log.capacity {
                log.calls.pop_front();
            }
            log.calls.push_back(call);
        }
    }

    fn with_scale_set<T>(
        &self,
        scale_set: &str,
        f: impl FnOnce(&mut SimulatedScaleSet) -> Result<T>,
    ) -> Result<T> {
        let mut entry = self
            .scale_sets
            .get_mut(scale_set)
            .ok_or_else(|| anyhow!("scale set {} not found", scale_set))?;
        f(entry.value_mut())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloudClient for SimulatedCloud {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn list_instances(&self, scale_set: &str) -> Result<Vec<Instance>> {
        if self.faults.failing_lists.contains(scale_set) {
            bail!("list instances for {} failed: simulated outage", scale_set);
        }
        Ok(self
            .scale_sets
            .get(scale_set)
            .map(|s| s.instances.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply_extension(
        &self,
        scale_set: &str,
        instance_id: &str,
        extension: &Extension,
    ) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.record(CloudCall::ApplyExtension {
            instance_id: instance_id.to_string(),
            extension: extension.name.clone(),
        });

        let delay = self.faults.apply_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.faults.failing_applies.contains(instance_id) {
            bail!(
                "extension {} failed to provision on {}",
                extension.name,
                instance_id
            );
        }

        self.with_scale_set(scale_set, |s| {
            let instance = s.instance_mut(instance_id)?;
            instance
                .applied_extension_versions
                .insert(extension.name.clone(), extension.version_marker());
            instance.provisioning_state = ProvisioningState::Succeeded;
            Ok(())
        })?;
        debug!("Applied extension {} to {}", extension.name, instance_id);
        Ok(())
    }

    async fn upgrade_image(
        &self,
        scale_set: &str,
        instance_id: &str,
        image_reference: &str,
    ) -> Result<()> {
        self.record(CloudCall::UpgradeImage {
            instance_id: instance_id.to_string(),
            image_reference: image_reference.to_string(),
        });
        if self.faults.failing_applies.contains(instance_id) {
            bail!("image upgrade failed on {}", instance_id);
        }
        self.with_scale_set(scale_set, |s| {
            s.instance_mut(instance_id)?.image_reference = image_reference.to_string();
            Ok(())
        })
    }

    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<()> {
        self.record(CloudCall::Reimage {
            instance_id: instance_id.to_string(),
        });
        if self.faults.failing_repairs.contains(instance_id) {
            bail!("reimage failed on {}", instance_id);
        }
        self.with_scale_set(scale_set, |s| {
            s.instance_mut(instance_id)?.last_repair_at = Some(Utc::now());
            Ok(())
        })?;
        self.faults.unhealthy.remove(instance_id);
        info!("Reimaged simulated instance {}", instance_id);
        Ok(())
    }

    /// Delete the instance and create a fresh one from the same model.
    async fn replace(&self, scale_set: &str, instance_id: &str) -> Result<()> {
        self.record(CloudCall::Replace {
            instance_id: instance_id.to_string(),
        });
        if self.faults.failing_repairs.contains(instance_id) {
            bail!("replace failed on {}", instance_id);
        }
        let new_id = self.with_scale_set(scale_set, |s| {
            let old = s
                .instances
                .remove(instance_id)
                .ok_or_else(|| anyhow!("instance {} not found", instance_id))?;
            let new_id = format!("{}_{}", scale_set, s.next_index);
            s.next_index += 1;
            let mut fresh = Instance::new(&new_id);
            fresh.image_reference = old.image_reference;
            fresh.applied_extension_versions = old.applied_extension_versions;
            fresh.last_repair_at = Some(Utc::now());
            s.instances.insert(new_id.clone(), fresh);
            Ok(new_id)
        })?;
        self.faults.unhealthy.remove(instance_id);
        info!("Replaced simulated instance {} with {}", instance_id, new_id);
        Ok(())
    }

    async fn get_identity(&self, scale_set: &str) -> Result<IdentitySpec> {
        self.with_scale_set(scale_set, |s| Ok(s.identity.clone()))
    }

    async fn set_identity_type(&self, scale_set: &str, identity_type: IdentityType) -> Result<()> {
        self.record(CloudCall::SetIdentityType {
            scale_set: scale_set.to_string(),
            identity_type,
        });
        self.with_scale_set(scale_set, |s| {
            s.identity.identity_type = identity_type;
            if identity_type.includes_system() {
                if s.identity.principal_id.is_none() {
                    s.identity.principal_id = Some(uuid::Uuid::new_v4().to_string());
                }
            } else {
                s.identity.principal_id = None;
            }
            Ok(())
        })
    }

    async fn attach_identity(&self, scale_set: &str, identity_id: &str) -> Result<()> {
        self.record(CloudCall::AttachIdentity {
            scale_set: scale_set.to_string(),
            identity_id: identity_id.to_string(),
        });
        self.with_scale_set(scale_set, |s| {
            s.identity.identity_ids.insert(identity_id.to_string());
            Ok(())
        })
    }

    async fn detach_identity(&self, scale_set: &str, identity_id: &str) -> Result<()> {
        self.record(CloudCall::DetachIdentity {
            scale_set: scale_set.to_string(),
            identity_id: identity_id.to_string(),
        });
        self.with_scale_set(scale_set, |s| {
            s.identity.identity_ids.remove(identity_id);
            Ok(())
        })
    }
}

#[async_trait]
impl HealthProbe for SimulatedCloud {
    async fn probe(&self, scale_set: &str, instance_id: &str) -> Result<bool> {
        if self.faults.probe_errors.contains(instance_id) {
            bail!("health probe for {} timed out", instance_id);
        }
        let exists = self
            .scale_sets
            .get(scale_set)
            .is_some_and(|s| s.instances.contains_key(instance_id));
        if !exists {
            bail!("instance {} not found in {}", instance_id, scale_set);
        }
        Ok(!self.faults.unhealthy.contains(instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_and_list() {
        let cloud = SimulatedCloud::new();
        cloud.seed("web", 3, "img-v1");
        let instances = cloud.list_instances("web").await.unwrap();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].id, "web_0");
        assert!(instances.iter().all(|i| i.image_reference == "img-v1"));
        assert!(cloud.list_instances("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_extension_records_marker() {
        let cloud = SimulatedCloud::new();
        cloud.seed("web", 1, "img");
        let ext = Extension::new("agent").with_force_update_tag("t2");
        cloud.apply_extension("web", "web_0", &ext).await.unwrap();
        let inst = cloud.instance("web", "web_0").unwrap();
        assert_eq!(inst.applied_extension_versions["agent"], "1.0+t2");
        assert_eq!(
            cloud.calls(),
            vec![CloudCall::ApplyExtension {
                instance_id: "web_0".into(),
                extension: "agent".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_call_log_is_capped() {
        let cloud = SimulatedCloud::with_call_log_capacity(2);
        cloud.seed("web", 3, "img");
        for id in ["web_0", "web_1", "web_2"] {
            cloud.reimage("web", id).await.unwrap();
        }
        assert_eq!(
            cloud.calls(),
            vec![
                CloudCall::Reimage {
                    instance_id: "web_1".into()
                },
                CloudCall::Reimage {
                    instance_id: "web_2".into()
                },
            ]
        );

        let quiet = SimulatedCloud::with_call_log_capacity(0);
        quiet.seed("web", 1, "img");
        quiet.reimage("web", "web_0").await.unwrap();
        assert!(quiet.calls().is_empty());
        assert!(quiet.instance("web", "web_0").unwrap().last_repair_at.is_some());
    }

    #[tokio::test]
    async fn test_injected_apply_failure() {
        let cloud = SimulatedCloud::new();
        cloud.seed("web", 1, "img");
        cloud.fail_applies("web_0");
        assert!(cloud.apply_extension("web", "web_0", &Extension::new("a")).await.is_err());
        assert!(
            cloud
                .instance("web", "web_0")
                .unwrap()
                .applied_extension_versions
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_probe_and_repair() {
        let cloud = SimulatedCloud::new();
        cloud.seed("web", 2, "img");
        cloud.set_unhealthy("web_1");
        assert!(cloud.probe("web", "web_0").await.unwrap());
        assert!(!cloud.probe("web", "web_1").await.unwrap());

        cloud.reimage("web", "web_1").await.unwrap();
        assert!(cloud.probe("web", "web_1").await.unwrap());
        assert!(cloud.instance("web", "web_1").unwrap().last_repair_at.is_some());

        cloud.fail_probes("web_0");
        assert!(cloud.probe("web", "web_0").await.is_err());
    }

    #[tokio::test]
    async fn test_replace_creates_new_member() {
        let cloud = SimulatedCloud::new();
        cloud.seed("web", 2, "img");
        cloud.replace("web", "web_0").await.unwrap();
        assert_eq!(cloud.instance_ids("web"), vec!["web_1", "web_2"]);
        assert!(cloud.instance("web", "web_2").unwrap().last_repair_at.is_some());
    }

    #[tokio::test]
    async fn test_identity_type_switch_manages_principal() {
        let cloud = SimulatedCloud::new();
        cloud.seed("web", 1, "img");
        cloud
            .set_identity_type("web", IdentityType::SystemAssigned)
            .await
            .unwrap();
        let principal = cloud.identity("web").principal_id;
        assert!(principal.is_some());

        cloud
            .set_identity_type("web", IdentityType::SystemAssignedUserAssigned)
            .await
            .unwrap();
        assert_eq!(cloud.identity("web").principal_id, principal);

        cloud.attach_identity("web", "/ids/a").await.unwrap();
        cloud.detach_identity("web", "/ids/missing").await.unwrap();
        assert_eq!(cloud.identity("web").identity_ids.len(), 1);

        cloud.set_identity_type("web", IdentityType::UserAssigned).await.unwrap();
        assert!(cloud.identity("web").principal_id.is_none());
    }

    #[tokio::test]
    async fn test_list_outage() {
        let cloud = SimulatedCloud::new();
        cloud.seed("web", 1, "img");
        cloud.fail_lists("web", true);
        assert!(cloud.list_instances("web").await.is_err());
        cloud.fail_lists("web", false);
        assert_eq!(cloud.list_instances("web").await.unwrap().len(), 1);
    }
}
