use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::instance::Instance;
use crate::scaleset::ScaleSet;

/// The per-instance configuration a scale set asks for: image plus the
/// version marker of every declared extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredConfiguration {
    pub image_reference: String,
    pub extension_versions: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct HashInput<'a> {
    image: &'a str,
    extensions: BTreeMap<&'a str, &'a str>,
}

impl DesiredConfiguration {
    /// An image the upgrade policy does not roll out is left unmanaged.
    pub fn from_scale_set(scale_set: &ScaleSet) -> Self {
        let image_reference = if scale_set.upgrade_policy.manages_image() {
            scale_set.image_reference.clone()
        } else {
            String::new()
        };
        Self {
            image_reference,
            extension_versions: scale_set
                .extensions
                .iter()
                .map(|e| (e.name.clone(), e.version_marker()))
                .collect(),
        }
    }

    /// Identity of the rollout converging to this configuration. Not used to
    /// decide whether an instance is up to date.
    pub fn hash(&self) -> String {
        compute_hash(&HashInput {
            image: &self.image_reference,
            extensions: self
                .extension_versions
                .iter()
                .map(|(name, version)| (name.as_str(), version.as_str()))
                .collect(),
        })
    }

    /// Whether `instance` runs the desired image (when managed) and every
    /// declared extension at its desired marker.
    pub fn is_satisfied_by(&self, instance: &Instance) -> bool {
        !self.needs_image(instance)
            && self.extension_versions.iter().all(|(name, version)| {
                instance.applied_extension_versions.get(name) == Some(version)
            })
    }

    pub fn needs_image(&self, instance: &Instance) -> bool {
        !self.image_reference.is_empty() && instance.image_reference != self.image_reference
    }

    /// Names of extensions whose applied marker differs from the desired one.
    pub fn pending_extensions(&self, instance: &Instance) -> BTreeSet<String> {
        self.extension_versions
            .iter()
            .filter(|(name, version)| {
                instance.applied_extension_versions.get(*name) != Some(*version)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Simple change-detection hash over the canonical JSON form.
fn compute_hash<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    let mut hash: u64 = 0;
    for byte in json.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Extension;
    use crate::scaleset::{AutomaticOsUpgradePolicy, UpgradePolicy};

    fn scale_set() -> ScaleSet {
        let mut ss = ScaleSet::new("web", 2);
        ss.image_reference = "img-v2".into();
        ss.extensions = vec![
            Extension::new("a"),
            Extension::new("b").with_force_update_tag("t1"),
        ];
        ss
    }

    #[test]
    fn up_to_date_instance_matches_hash() {
        let desired = scale_set().desired_configuration();
        let mut inst = Instance::new("vm-0");
        inst.image_reference = "img-v2".into();
        inst.applied_extension_versions.insert("a".into(), "1.0".into());
        inst.applied_extension_versions.insert("b".into(), "1.0+t1".into());
        // Extensions not managed by the scale set are ignored.
        inst.applied_extension_versions.insert("legacy".into(), "9".into());
        assert!(desired.is_satisfied_by(&inst));
        assert!(desired.pending_extensions(&inst).is_empty());
        assert!(!desired.needs_image(&inst));
    }

    #[test]
    fn stale_marker_is_pending() {
        let desired = scale_set().desired_configuration();
        let mut inst = Instance::new("vm-0");
        inst.image_reference = "img-v1".into();
        inst.applied_extension_versions.insert("a".into(), "1.0".into());
        inst.applied_extension_versions.insert("b".into(), "1.0".into());
        assert!(!desired.is_satisfied_by(&inst));
        assert!(desired.needs_image(&inst));
        let pending: Vec<_> = desired.pending_extensions(&inst).into_iter().collect();
        assert_eq!(pending, vec!["b".to_string()]);
    }

    #[test]
    fn markers_are_compared_not_hashed() {
        // "Aa" and "BB" collide under the 31-multiplier hash.
        let mut ss = ScaleSet::new("web", 1);
        ss.extensions = vec![Extension::new("a").with_force_update_tag("Aa")];
        let desired = ss.desired_configuration();
        let mut inst = Instance::new("vm-0");
        inst.applied_extension_versions.insert("a".into(), "1.0+BB".into());
        assert_eq!(compute_hash(&"1.0+Aa"), compute_hash(&"1.0+BB"));
        assert!(!desired.is_satisfied_by(&inst));

        inst.applied_extension_versions.insert("a".into(), "1.0+Aa".into());
        assert!(desired.is_satisfied_by(&inst));
    }

    #[test]
    fn image_left_alone_when_os_upgrade_disabled() {
        let mut ss = scale_set();
        ss.upgrade_policy = UpgradePolicy::automatic_with(AutomaticOsUpgradePolicy::default());
        let desired = ss.desired_configuration();
        assert!(desired.image_reference.is_empty());
        let mut inst = Instance::new("vm-0");
        inst.image_reference = "img-v1".into();
        assert!(!desired.needs_image(&inst));
    }

    #[test]
    fn unmanaged_image_is_ignored() {
        let mut ss = scale_set();
        ss.image_reference.clear();
        let desired = ss.desired_configuration();
        let mut inst = Instance::new("vm-0");
        inst.image_reference = "whatever".into();
        inst.applied_extension_versions.insert("a".into(), "1.0".into());
        inst.applied_extension_versions.insert("b".into(), "1.0+t1".into());
        assert!(desired.is_satisfied_by(&inst));
    }
}
