use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ConfigError;

// --- Identity type ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum IdentityType {
    #[default]
    None,
    SystemAssigned,
    UserAssigned,
    #[serde(rename = "SystemAssigned, UserAssigned", alias = "SystemAssignedUserAssigned")]
    SystemAssignedUserAssigned,
}

impl IdentityType {
    pub fn from_parts(system: bool, user: bool) -> Self {
        match (system, user) {
            (false, false) => IdentityType::None,
            (true, false) => IdentityType::SystemAssigned,
            (false, true) => IdentityType::UserAssigned,
            (true, true) => IdentityType::SystemAssignedUserAssigned,
        }
    }

    pub fn includes_system(&self) -> bool {
        matches!(
            self,
            IdentityType::SystemAssigned | IdentityType::SystemAssignedUserAssigned
        )
    }

    pub fn includes_user(&self) -> bool {
        matches!(
            self,
            IdentityType::UserAssigned | IdentityType::SystemAssignedUserAssigned
        )
    }
}

impl std::fmt::Display for IdentityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityType::None => write!(f, "None"),
            IdentityType::SystemAssigned => write!(f, "SystemAssigned"),
            IdentityType::UserAssigned => write!(f, "UserAssigned"),
            IdentityType::SystemAssignedUserAssigned => write!(f, "SystemAssigned, UserAssigned"),
        }
    }
}

// --- Identity spec ---

/// Identity assignment of a scale set, either declared or observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentitySpec {
    #[serde(rename = "type", default)]
    pub identity_type: IdentityType,
    /// User-assigned identity resource ids.
    #[serde(default)]
    pub identity_ids: BTreeSet<String>,
    /// Principal of the system-assigned identity; only ever observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
}

impl IdentitySpec {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn system_assigned() -> Self {
        Self {
            identity_type: IdentityType::SystemAssigned,
            ..Self::default()
        }
    }

    pub fn user_assigned<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity_type: IdentityType::UserAssigned,
            identity_ids: ids.into_iter().map(Into::into).collect(),
            principal_id: None,
        }
    }

    /// Check the shape rules of a declared identity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_type.includes_user() {
            if self.identity_ids.is_empty() {
                return Err(ConfigError::identity(format!(
                    "`identity_ids` must be set when `type` is `{}`",
                    self.identity_type
                )));
            }
        } else if !self.identity_ids.is_empty() {
            return Err(ConfigError::identity(
                "`identity_ids` can only be specified when `type` includes `UserAssigned`",
            ));
        }
        if let Some(id) = self.identity_ids.iter().find(|id| id.trim().is_empty()) {
            return Err(ConfigError::identity(format!(
                "identity id '{}' must not be blank",
                id
            )));
        }
        Ok(())
    }
}
