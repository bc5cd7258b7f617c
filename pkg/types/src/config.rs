use serde::{Deserialize, Serialize};

use crate::scaleset::ScaleSet;

/// Orchestrator configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// tick-interval-secs: 30
/// apply-concurrency: 8
/// unhealthy-threshold: 3
/// desired-state: /etc/fleet/scalesets.yaml
/// reload-interval-secs: 15
/// simulated-instances: 10
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfigFile {
    #[serde(default, alias = "tick-interval-secs")]
    pub tick_interval_secs: Option<u64>,
    #[serde(default, alias = "apply-concurrency")]
    pub apply_concurrency: Option<usize>,
    #[serde(default, alias = "unhealthy-threshold")]
    pub unhealthy_threshold: Option<u32>,
    #[serde(default, alias = "desired-state")]
    pub desired_state: Option<String>,
    #[serde(default, alias = "reload-interval-secs")]
    pub reload_interval_secs: Option<u64>,
    /// Instances seeded per scale set in the simulated cloud; defaults to
    /// each scale set's `instance_count`.
    #[serde(default, alias = "simulated-instances")]
    pub simulated_instances: Option<u32>,
}

/// Desired-state file: a YAML list of scale sets.
///
/// ```yaml
/// - name: web
///   instance_count: 3
///   health_probe_id: /probes/http
///   upgrade_policy:
///     mode: Automatic
///     automatic_os_upgrade_policy:
///       enable_automatic_os_upgrade: true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DesiredStateFile {
    pub scale_sets: Vec<ScaleSet>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Load the desired-state file. Unlike config files, a missing file is an error.
pub fn load_desired_state(path: &str) -> anyhow::Result<DesiredStateFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read desired state {}: {}", path, e))?;
    let file: DesiredStateFile = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse desired state {}: {}", path, e))?;
    Ok(file)
}
