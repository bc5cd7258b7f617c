use serde::{Deserialize, Serialize};
use std::time::Duration;

use pkg_constants::repair::{DEFAULT_COOLDOWN_SECS, DEFAULT_GRACE_PERIOD_SECS};
use pkg_constants::rollout::{AUTOMATIC_MAX_BATCH_PERCENT, DEFAULT_EXTENSIONS_TIME_BUDGET_SECS};

use crate::desired::DesiredConfiguration;
use crate::duration::iso8601;
use crate::extension::Extension;
use crate::identity::IdentitySpec;

// --- Upgrade policy ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpgradeMode {
    /// Changes are staged; an explicit "update instances" request applies them.
    #[default]
    Manual,
    /// Platform-paced: the whole fleet in one batch.
    Automatic,
    /// Bounded waves governed by a `RollingPolicy`.
    Rolling,
}

impl std::fmt::Display for UpgradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeMode::Manual => write!(f, "Manual"),
            UpgradeMode::Automatic => write!(f, "Automatic"),
            UpgradeMode::Rolling => write!(f, "Rolling"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollingPolicy {
    pub max_batch_instance_percent: u32,
    pub max_unhealthy_instance_percent: u32,
    pub max_unhealthy_upgraded_instance_percent: u32,
    #[serde(with = "iso8601")]
    pub pause_time_between_batches: Duration,
}

impl RollingPolicy {
    /// The preset that models `Automatic` mode: one batch, no pacing, no budgets.
    pub fn automatic() -> Self {
        Self {
            max_batch_instance_percent: AUTOMATIC_MAX_BATCH_PERCENT as u32,
            max_unhealthy_instance_percent: 100,
            max_unhealthy_upgraded_instance_percent: 100,
            pause_time_between_batches: Duration::ZERO,
        }
    }
}

/// OS image handling of the `Automatic` mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutomaticOsUpgradePolicy {
    /// Roll `image_reference` changes out; when off only extensions are
    /// reconciled and the image stays as it is on every instance.
    pub enable_automatic_os_upgrade: bool,
    /// Handed to the cloud, which owns rolling a failed image back.
    #[serde(default)]
    pub disable_automatic_rollback: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradePolicy {
    #[serde(default)]
    pub mode: UpgradeMode,
    /// Required for `Rolling`, forbidden otherwise.
    #[serde(default, alias = "rolling_upgrade_policy")]
    pub rolling: Option<RollingPolicy>,
    /// Required for `Automatic`, forbidden otherwise.
    #[serde(default, alias = "automatic_os_upgrade_policy")]
    pub automatic: Option<AutomaticOsUpgradePolicy>,
}

impl UpgradePolicy {
    pub fn manual() -> Self {
        Self::default()
    }

    /// `Automatic` with OS image upgrades enabled.
    pub fn automatic() -> Self {
        Self::automatic_with(AutomaticOsUpgradePolicy {
            enable_automatic_os_upgrade: true,
            disable_automatic_rollback: false,
        })
    }

    pub fn automatic_with(os_upgrade: AutomaticOsUpgradePolicy) -> Self {
        Self {
            mode: UpgradeMode::Automatic,
            rolling: None,
            automatic: Some(os_upgrade),
        }
    }

    pub fn rolling(policy: RollingPolicy) -> Self {
        Self {
            mode: UpgradeMode::Rolling,
            rolling: Some(policy),
            automatic: None,
        }
    }

    /// Whether `image_reference` changes are rolled out. Only an `Automatic`
    /// scale set can opt out.
    pub fn manages_image(&self) -> bool {
        match self.mode {
            UpgradeMode::Automatic => self
                .automatic
                .is_some_and(|os| os.enable_automatic_os_upgrade),
            UpgradeMode::Manual | UpgradeMode::Rolling => true,
        }
    }

    /// Policy the batch planner runs with, or `None` when changes wait for a
    /// manual trigger.
    pub fn effective_policy(&self) -> Option<RollingPolicy> {
        match self.mode {
            UpgradeMode::Manual => None,
            UpgradeMode::Automatic => Some(RollingPolicy::automatic()),
            UpgradeMode::Rolling => self.rolling.clone(),
        }
    }
}

// --- Automatic repair ---

fn default_grace_period() -> Duration {
    Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS)
}

fn default_cooldown_period() -> Duration {
    Duration::from_secs(DEFAULT_COOLDOWN_SECS)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoRepairPolicy {
    pub enabled: bool,
    /// How long an instance must stay unhealthy before it is repaired.
    #[serde(default = "default_grace_period", with = "iso8601")]
    pub grace_period: Duration,
    /// Minimum spacing between two repairs of one instance.
    #[serde(default = "default_cooldown_period", with = "iso8601")]
    pub cooldown_period: Duration,
}

impl Default for AutoRepairPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_period: default_grace_period(),
            cooldown_period: default_cooldown_period(),
        }
    }
}

impl AutoRepairPolicy {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

// --- Scale set ---

fn default_extensions_time_budget() -> Duration {
    Duration::from_secs(DEFAULT_EXTENSIONS_TIME_BUDGET_SECS)
}

/// Declared desired state of one scale set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleSet {
    pub name: String,
    #[serde(default)]
    pub instance_count: u32,
    /// Desired OS image; empty means the image is not managed here.
    #[serde(default)]
    pub image_reference: String,
    #[serde(default)]
    pub upgrade_policy: UpgradePolicy,
    #[serde(default)]
    pub health_probe_id: Option<String>,
    #[serde(default)]
    pub identity: IdentitySpec,
    #[serde(default, alias = "automatic_instance_repair")]
    pub auto_repair: AutoRepairPolicy,
    #[serde(default)]
    pub extensions: Vec<Extension>,
    /// Upper bound for provisioning all extensions on one instance.
    #[serde(default = "default_extensions_time_budget", with = "iso8601")]
    pub extensions_time_budget: Duration,
}

impl ScaleSet {
    pub fn new(name: &str, instance_count: u32) -> Self {
        Self {
            name: name.to_string(),
            instance_count,
            image_reference: String::new(),
            upgrade_policy: UpgradePolicy::default(),
            health_probe_id: None,
            identity: IdentitySpec::default(),
            auto_repair: AutoRepairPolicy::default(),
            extensions: Vec::new(),
            extensions_time_budget: default_extensions_time_budget(),
        }
    }

    /// Whether any health signal (load balancer probe or in-guest health
    /// extension) is configured.
    pub fn has_health_signal(&self) -> bool {
        self.health_probe_id.as_deref().is_some_and(|p| !p.is_empty())
            || self.extensions.iter().any(Extension::is_application_health)
    }

    pub fn desired_configuration(&self) -> DesiredConfiguration {
        DesiredConfiguration::from_scale_set(self)
    }
}
