use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use pkg_types::identity::{IdentitySpec, IdentityType};

/// Changes that move a scale set's current identity to the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPatch {
    /// New identity type, when it differs from the current one.
    pub target_type: Option<IdentityType>,
    pub attach: BTreeSet<String>,
    pub detach: BTreeSet<String>,
}

/// One cloud call of an identity patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStep {
    SetType(IdentityType),
    Attach(String),
    Detach(String),
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.target_type.is_none() && self.attach.is_empty() && self.detach.is_empty()
    }

    /// Whether applying this patch removes an existing system principal.
    pub fn removes_system_principal(&self, current: &IdentitySpec) -> bool {
        current.identity_type.includes_system()
            && self.target_type.is_some_and(|t| !t.includes_system())
    }

    /// Cloud calls in the order they must run: a type that drops user
    /// identities is set after the detaches, any other type change before
    /// the attaches.
    pub fn steps(&self) -> Vec<IdentityStep> {
        let attaches = self.attach.iter().cloned().map(IdentityStep::Attach);
        let detaches = self.detach.iter().cloned().map(IdentityStep::Detach);
        match self.target_type {
            Some(t) if !t.includes_user() => detaches
                .chain(attaches)
                .chain(std::iter::once(IdentityStep::SetType(t)))
                .collect(),
            Some(t) => std::iter::once(IdentityStep::SetType(t))
                .chain(attaches)
                .chain(detaches)
                .collect(),
            None => attaches.chain(detaches).collect(),
        }
    }
}

/// User identities a spec actually asks for; ids listed under a type without
/// user identities are ignored.
fn wanted_ids(spec: &IdentitySpec) -> BTreeSet<String> {
    if spec.identity_type.includes_user() {
        spec.identity_ids.clone()
    } else {
        BTreeSet::new()
    }
}

/// Compute the patch from `current` to `desired`.
///
/// Principals are not compared: the system principal only appears or
/// disappears through a type switch.
pub fn diff(desired: &IdentitySpec, current: &IdentitySpec) -> IdentityPatch {
    let want = wanted_ids(desired);
    IdentityPatch {
        target_type: (desired.identity_type != current.identity_type)
            .then_some(desired.identity_type),
        attach: want.difference(&current.identity_ids).cloned().collect(),
        detach: current.identity_ids.difference(&want).cloned().collect(),
    }
}

/// The identity that results from applying `patch` to `current`.
pub fn apply(current: &IdentitySpec, patch: &IdentityPatch) -> IdentitySpec {
    let identity_type = patch.target_type.unwrap_or(current.identity_type);
    let mut identity_ids = current.identity_ids.clone();
    identity_ids.extend(patch.attach.iter().cloned());
    identity_ids.retain(|id| !patch.detach.contains(id));
    IdentitySpec {
        identity_type,
        identity_ids,
        principal_id: if identity_type.includes_system() {
            current.principal_id.clone()
        } else {
            None
        },
    }
}
