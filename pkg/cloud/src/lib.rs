//! Boundary between the orchestrator and the cloud.
//!
//! The orchestrator never talks to a cloud API directly: it reads fleet state
//! and requests transitions through `CloudClient`, and observes instance
//! health through `HealthProbe`. Both are assumed idempotent and
//! at-least-once; retry and backoff belong to the implementation.

pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;

use pkg_types::extension::Extension;
use pkg_types::identity::{IdentitySpec, IdentityType};
use pkg_types::instance::Instance;

pub use simulated::{CloudCall, SimulatedCloud};

/// Cloud resource operations for one region's scale sets.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Human-readable name of this backend.
    fn name(&self) -> &str;

    /// Current members of a scale set.
    async fn list_instances(&self, scale_set: &str) -> Result<Vec<Instance>>;

    /// Install or re-run one extension on one instance.
    async fn apply_extension(
        &self,
        scale_set: &str,
        instance_id: &str,
        extension: &Extension,
    ) -> Result<()>;

    /// Move one instance to a new OS image.
    async fn upgrade_image(
        &self,
        scale_set: &str,
        instance_id: &str,
        image_reference: &str,
    ) -> Result<()>;

    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<()>;

    async fn replace(&self, scale_set: &str, instance_id: &str) -> Result<()>;

    /// Identity currently assigned to the scale set.
    async fn get_identity(&self, scale_set: &str) -> Result<IdentitySpec>;

    /// Switch the identity type; enables or removes the system principal.
    async fn set_identity_type(&self, scale_set: &str, identity_type: IdentityType) -> Result<()>;

    async fn attach_identity(&self, scale_set: &str, identity_id: &str) -> Result<()>;

    async fn detach_identity(&self, scale_set: &str, identity_id: &str) -> Result<()>;
}

/// Health signal for instances (load balancer probe, in-guest health extension).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(true)` healthy, `Ok(false)` failing; an error counts as failing.
    async fn probe(&self, scale_set: &str, instance_id: &str) -> Result<bool>;
}
