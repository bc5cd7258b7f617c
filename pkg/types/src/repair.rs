use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RepairActionKind {
    /// Restore the instance's OS disk from its image.
    Reimage,
    /// Delete the instance and create a fresh one in its place.
    Replace,
}

impl std::fmt::Display for RepairActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairActionKind::Reimage => write!(f, "Reimage"),
            RepairActionKind::Replace => write!(f, "Replace"),
        }
    }
}

/// A repair requested for one instance. Lives from the repair decision until
/// the cloud call completes or the instance is seen healthy again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairAction {
    pub id: String,
    pub instance_id: String,
    pub reason: String,
    pub action: RepairActionKind,
    pub initiated_at: DateTime<Utc>,
}
