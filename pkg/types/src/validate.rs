use std::collections::HashSet;
use std::time::Duration;

use pkg_constants::repair::{MAX_GRACE_PERIOD_SECS, MIN_GRACE_PERIOD_SECS};
use pkg_constants::rollout::{
    MAX_EXTENSIONS_TIME_BUDGET_SECS, MAX_PAUSE_BETWEEN_BATCHES_SECS,
    MIN_EXTENSIONS_TIME_BUDGET_SECS,
};

use crate::duration::format_iso8601;
use crate::error::ConfigError;
use crate::scaleset::{RollingPolicy, ScaleSet, UpgradeMode};

/// Validate a scale set name.
/// Rules: `[A-Za-z0-9._-]`, max 80 chars, no leading/trailing `-` or `.`.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::name("name must not be empty"));
    }
    if name.len() > 80 {
        return Err(ConfigError::name(format!(
            "name '{}' exceeds 80 characters (got {})",
            name,
            name.len()
        )));
    }
    if name.starts_with(['-', '.']) || name.ends_with(['-', '.']) {
        return Err(ConfigError::name(format!(
            "name '{}' must not start or end with a hyphen or period",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ConfigError::name(format!(
            "name '{}' must contain only letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

fn check_percent(field: &'static str, value: u32, min: u32) -> Result<(), ConfigError> {
    if value < min || value > 100 {
        return Err(ConfigError::InvalidPolicyPercent { field, value, min });
    }
    Ok(())
}

/// Validate the percentages and pacing of a rolling policy.
pub fn validate_rolling_policy(policy: &RollingPolicy) -> Result<(), ConfigError> {
    check_percent("max_batch_instance_percent", policy.max_batch_instance_percent, 1)?;
    check_percent(
        "max_unhealthy_instance_percent",
        policy.max_unhealthy_instance_percent,
        0,
    )?;
    check_percent(
        "max_unhealthy_upgraded_instance_percent",
        policy.max_unhealthy_upgraded_instance_percent,
        0,
    )?;
    check_duration_range(
        "pause_time_between_batches",
        policy.pause_time_between_batches,
        0,
        MAX_PAUSE_BETWEEN_BATCHES_SECS,
    )?;
    Ok(())
}

fn check_duration_range(
    field: &str,
    value: Duration,
    min_secs: u64,
    max_secs: u64,
) -> Result<(), ConfigError> {
    let (min, max) = (Duration::from_secs(min_secs), Duration::from_secs(max_secs));
    if value < min || value > max {
        return Err(ConfigError::duration(format!(
            "`{}` must be between {} and {} (got {})",
            field,
            format_iso8601(min),
            format_iso8601(max),
            format_iso8601(value)
        )));
    }
    Ok(())
}

/// Validate everything about a scale set that can be checked without looking
/// at the extension dependency graph.
pub fn validate_scale_set(scale_set: &ScaleSet) -> Result<(), ConfigError> {
    validate_name(&scale_set.name)?;

    let policy = &scale_set.upgrade_policy;
    match (policy.mode, &policy.rolling) {
        (UpgradeMode::Rolling, Some(rolling)) => validate_rolling_policy(rolling)?,
        (UpgradeMode::Rolling, None) => {
            return Err(ConfigError::policy(
                "a `rolling_upgrade_policy` block must be specified when `mode` is `Rolling`",
            ));
        }
        (mode, Some(_)) => {
            return Err(ConfigError::policy(format!(
                "a `rolling_upgrade_policy` block cannot be specified when `mode` is `{}`",
                mode
            )));
        }
        (_, None) => {}
    }

    match (policy.mode, policy.automatic) {
        (UpgradeMode::Automatic, None) => {
            return Err(ConfigError::policy(
                "an `automatic_os_upgrade_policy` block must be specified when `mode` is `Automatic`",
            ));
        }
        (mode, Some(_)) if mode != UpgradeMode::Automatic => {
            return Err(ConfigError::policy(format!(
                "an `automatic_os_upgrade_policy` block cannot be specified when `mode` is `{}`",
                mode
            )));
        }
        _ => {}
    }

    if policy.mode != UpgradeMode::Manual && !scale_set.has_health_signal() {
        return Err(ConfigError::policy(format!(
            "`health_probe_id` must be set or a health extension must be specified when `mode` is `{}`",
            policy.mode
        )));
    }

    if scale_set.auto_repair.enabled {
        if !scale_set.has_health_signal() {
            return Err(ConfigError::policy(
                "automatic repair can only be enabled if there is an application health extension or a `health_probe_id`",
            ));
        }
        check_duration_range(
            "grace_period",
            scale_set.auto_repair.grace_period,
            MIN_GRACE_PERIOD_SECS,
            MAX_GRACE_PERIOD_SECS,
        )?;
    }

    check_duration_range(
        "extensions_time_budget",
        scale_set.extensions_time_budget,
        MIN_EXTENSIONS_TIME_BUDGET_SECS,
        MAX_EXTENSIONS_TIME_BUDGET_SECS,
    )?;

    scale_set.identity.validate()?;

    let mut seen = HashSet::new();
    for ext in &scale_set.extensions {
        if ext.name.trim().is_empty() {
            return Err(ConfigError::name("extension name must not be empty"));
        }
        if !seen.insert(ext.name.as_str()) {
            return Err(ConfigError::DuplicateExtension(ext.name.clone()));
        }
    }

    Ok(())
}
