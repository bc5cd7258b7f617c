//! Health classification constants.

/// Consecutive failing probe observations required before an instance is
/// classified `Unhealthy`.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Consecutive successful probe observations required to return to `Healthy`.
pub const HEALTHY_THRESHOLD: u32 = 1;

/// Extension types that act as an in-guest application health probe.
/// A scale set carrying one of these does not need a `health_probe_id`.
pub const APPLICATION_HEALTH_EXTENSION_TYPES: &[&str] =
    &["ApplicationHealthLinux", "ApplicationHealthWindows"];
