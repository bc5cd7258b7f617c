//! Automatic instance repair constants.

/// Default time an instance must stay unhealthy before it is repaired (`PT30M`).
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30 * 60;

/// Shortest accepted grace period (`PT10M`).
pub const MIN_GRACE_PERIOD_SECS: u64 = 10 * 60;

/// Longest accepted grace period (`PT90M`).
pub const MAX_GRACE_PERIOD_SECS: u64 = 90 * 60;

/// Minimum spacing between two repairs of the same instance.
pub const DEFAULT_COOLDOWN_SECS: u64 = 30 * 60;

/// Escalation window = `cooldown * ESCALATION_WINDOW_MULTIPLIER`.
pub const ESCALATION_WINDOW_MULTIPLIER: u32 = 3;

/// Failed repairs inside the escalation window before `Replace` is chosen over `Reimage`.
pub const ESCALATION_FAILURE_THRESHOLD: usize = 2;

/// Repair attempts kept per instance.
pub const MAX_REPAIR_HISTORY: usize = 16;
