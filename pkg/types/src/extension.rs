use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;

use pkg_constants::health::APPLICATION_HEALTH_EXTENSION_TYPES;

// --- Opaque payload ---

/// Extension settings blob. The orchestrator carries it to the cloud
/// untouched and never looks inside.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OpaquePayload(Vec<u8>);

impl OpaquePayload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for OpaquePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpaquePayload({} bytes)", self.0.len())
    }
}

impl Serialize for OpaquePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

impl<'de> Deserialize<'de> for OpaquePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self(raw.into_bytes()))
    }
}

// --- Extension ---

fn default_true() -> bool {
    true
}

/// A post-provision agent installed on every instance of a scale set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Extension {
    /// Unique within the owning scale set.
    pub name: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default, rename = "type")]
    pub extension_type: String,
    #[serde(default)]
    pub type_handler_version: String,
    #[serde(default = "default_true")]
    pub auto_upgrade_minor_version: bool,
    /// Extensions that must be provisioned before this one.
    #[serde(default, alias = "provision_after_extensions")]
    pub depends_on: BTreeSet<String>,
    /// Changing this value forces the extension to be applied again.
    #[serde(default)]
    pub force_update_tag: Option<String>,
    #[serde(default, skip_serializing_if = "OpaquePayload::is_empty")]
    pub settings: OpaquePayload,
    /// Never written back out.
    #[serde(default, skip_serializing)]
    pub protected_settings: OpaquePayload,
}

impl Extension {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            publisher: String::new(),
            extension_type: String::new(),
            type_handler_version: "1.0".to_string(),
            auto_upgrade_minor_version: true,
            depends_on: BTreeSet::new(),
            force_update_tag: None,
            settings: OpaquePayload::default(),
            protected_settings: OpaquePayload::default(),
        }
    }

    pub fn with_depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_force_update_tag(mut self, tag: &str) -> Self {
        self.force_update_tag = Some(tag.to_string());
        self
    }

    pub fn with_type(mut self, publisher: &str, extension_type: &str) -> Self {
        self.publisher = publisher.to_string();
        self.extension_type = extension_type.to_string();
        self
    }

    /// Version marker recorded on an instance once this extension is applied.
    /// Settings are deliberately not part of it.
    pub fn version_marker(&self) -> String {
        match self.force_update_tag.as_deref() {
            Some(tag) if !tag.is_empty() => format!("{}+{}", self.type_handler_version, tag),
            _ => self.type_handler_version.clone(),
        }
    }

    /// Whether this extension reports application health from inside the guest.
    pub fn is_application_health(&self) -> bool {
        APPLICATION_HEALTH_EXTENSION_TYPES.contains(&self.extension_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_marker_tracks_force_update_tag() {
        let ext = Extension::new("agent");
        assert_eq!(ext.version_marker(), "1.0");
        let tagged = ext.clone().with_force_update_tag("rev2");
        assert_eq!(tagged.version_marker(), "1.0+rev2");
        assert_ne!(ext.version_marker(), tagged.version_marker());
    }

    #[test]
    fn settings_do_not_affect_version_marker() {
        let mut a = Extension::new("agent");
        let mut b = Extension::new("agent");
        a.settings = OpaquePayload::new(br#"{"port":80}"#.to_vec());
        b.settings = OpaquePayload::new(br#"{"port":8080}"#.to_vec());
        assert_eq!(a.version_marker(), b.version_marker());
    }

    #[test]
    fn protected_settings_are_redacted_and_not_serialized() {
        let mut ext = Extension::new("secrets");
        ext.protected_settings = OpaquePayload::new(b"hunter2".to_vec());
        let debug = format!("{:?}", ext);
        assert!(!debug.contains("hunter2"));
        let json = serde_json::to_string(&ext).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("protected_settings"));
    }

    #[test]
    fn accepts_provision_after_extensions_alias() {
        let yaml = r#"
name: app
type: CustomScript
provision_after_extensions: [base]
"#;
        let ext: Extension = serde_yaml::from_str(yaml).unwrap();
        assert!(ext.depends_on.contains("base"));
        assert!(ext.auto_upgrade_minor_version);
        assert_eq!(ext.extension_type, "CustomScript");
    }

    #[test]
    fn recognizes_application_health_extension() {
        let ext = Extension::new("health").with_type("Microsoft.ManagedServices", "ApplicationHealthLinux");
        assert!(ext.is_application_health());
        assert!(!Extension::new("other").is_application_health());
    }
}
