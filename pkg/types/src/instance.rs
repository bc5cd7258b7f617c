use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Provisioning state ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Succeeded,
    Failed,
    Deleting,
}

impl ProvisioningState {
    /// Instances being created or deleted are not touched by rollouts.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ProvisioningState::Creating | ProvisioningState::Deleting)
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Creating => write!(f, "Creating"),
            ProvisioningState::Updating => write!(f, "Updating"),
            ProvisioningState::Succeeded => write!(f, "Succeeded"),
            ProvisioningState::Failed => write!(f, "Failed"),
            ProvisioningState::Deleting => write!(f, "Deleting"),
        }
    }
}

// --- Health state ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "Unknown"),
            HealthState::Healthy => write!(f, "Healthy"),
            HealthState::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

// --- Instance ---

/// One member of a scale set, as observed from the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub provisioning_state: ProvisioningState,
    #[serde(default)]
    pub health_state: HealthState,
    #[serde(default)]
    pub last_repair_at: Option<DateTime<Utc>>,
    /// Extension name → version marker of the copy installed on this instance.
    #[serde(default)]
    pub applied_extension_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub image_reference: String,
}

impl Instance {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            provisioning_state: ProvisioningState::Succeeded,
            health_state: HealthState::Unknown,
            last_repair_at: None,
            applied_extension_versions: BTreeMap::new(),
            image_reference: String::new(),
        }
    }

    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health_state = health;
        self
    }

    pub fn is_unhealthy(&self) -> bool {
        self.health_state == HealthState::Unhealthy
    }
}
