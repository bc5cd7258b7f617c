//! Filesystem path constants.

/// Default config file path for the server.
pub const DEFAULT_SERVER_CONFIG: &str = "/etc/fleet/config.yaml";

/// Default desired-state file (YAML list of scale sets).
pub const DEFAULT_DESIRED_STATE: &str = "/etc/fleet/scalesets.yaml";

/// Default interval at which the desired-state file is re-read.
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 15;
