use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use pkg_constants::health::{DEFAULT_UNHEALTHY_THRESHOLD, HEALTHY_THRESHOLD};
use pkg_types::instance::HealthState;

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Success,
    Failure,
    /// The probe itself failed (timeout, transport). Counts as a failure.
    Error(String),
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success)
    }
}

impl From<anyhow::Result<bool>> for ProbeResult {
    fn from(result: anyhow::Result<bool>) -> Self {
        match result {
            Ok(true) => ProbeResult::Success,
            Ok(false) => ProbeResult::Failure,
            Err(e) => ProbeResult::Error(e.to_string()),
        }
    }
}

/// Per-instance health history.
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub unhealthy_since: Option<DateTime<Utc>>,
}

/// Debounces raw probe results into a health classification.
///
/// Unknown → Healthy on the first success. Healthy/Unknown → Unhealthy after
/// `unhealthy_threshold` consecutive failures. Unhealthy → Healthy after one
/// success. Anything short of a threshold keeps the previous state.
#[derive(Debug)]
pub struct HealthMonitor {
    unhealthy_threshold: u32,
    records: HashMap<String, HealthRecord>,
}

impl HealthMonitor {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            unhealthy_threshold: unhealthy_threshold.max(1),
            records: HashMap::new(),
        }
    }

    pub fn unhealthy_threshold(&self) -> u32 {
        self.unhealthy_threshold
    }

    /// Feed one probe result and return the resulting classification.
    pub fn observe(&mut self, instance_id: &str, probe: ProbeResult, now: DateTime<Utc>) -> HealthState {
        let threshold = self.unhealthy_threshold;
        let record = self.records.entry(instance_id.to_string()).or_default();
        let previous = record.state;
        record.last_probe_at = Some(now);

        if probe.is_success() {
            record.consecutive_failures = 0;
            record.consecutive_successes += 1;
            if record.consecutive_successes >= HEALTHY_THRESHOLD {
                record.state = HealthState::Healthy;
                record.unhealthy_since = None;
            }
        } else {
            if let ProbeResult::Error(ref e) = probe {
                debug!("Health probe error for {}: {}", instance_id, e);
            }
            record.consecutive_successes = 0;
            record.consecutive_failures += 1;
            if record.consecutive_failures >= threshold && previous != HealthState::Unhealthy {
                record.state = HealthState::Unhealthy;
                record.unhealthy_since = Some(now);
            }
        }

        if record.state != previous {
            info!(
                "Instance {} health {} -> {} (failures={}, successes={})",
                instance_id,
                previous,
                record.state,
                record.consecutive_failures,
                record.consecutive_successes
            );
        }
        record.state
    }

    pub fn state(&self, instance_id: &str) -> HealthState {
        self.records
            .get(instance_id)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub fn record(&self, instance_id: &str) -> Option<&HealthRecord> {
        self.records.get(instance_id)
    }

    pub fn unhealthy_since(&self, instance_id: &str) -> Option<DateTime<Utc>> {
        self.records.get(instance_id).and_then(|r| r.unhealthy_since)
    }

    /// Drop history for an instance that left the scale set or was replaced.
    pub fn forget(&mut self, instance_id: &str) {
        self.records.remove(instance_id);
    }

    /// Keep only the instances still present in the scale set.
    pub fn retain(&mut self, present: &HashSet<&str>) {
        self.records.retain(|id, _| present.contains(id.as_str()));
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_UNHEALTHY_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_three_failures_then_one_success() {
        let mut m = HealthMonitor::default();
        assert_eq!(m.observe("vm-0", ProbeResult::Success, t(0)), HealthState::Healthy);
        assert_eq!(m.observe("vm-0", ProbeResult::Failure, t(1)), HealthState::Healthy);
        assert_eq!(m.observe("vm-0", ProbeResult::Failure, t(2)), HealthState::Healthy);
        assert_eq!(m.observe("vm-0", ProbeResult::Failure, t(3)), HealthState::Unhealthy);
        assert_eq!(m.unhealthy_since("vm-0"), Some(t(3)));
        assert_eq!(m.observe("vm-0", ProbeResult::Success, t(4)), HealthState::Healthy);
        assert_eq!(m.unhealthy_since("vm-0"), None);
    }

    #[test]
    fn test_interrupted_failures_reset() {
        let mut m = HealthMonitor::default();
        m.observe("vm-0", ProbeResult::Success, t(0));
        m.observe("vm-0", ProbeResult::Failure, t(1));
        m.observe("vm-0", ProbeResult::Failure, t(2));
        m.observe("vm-0", ProbeResult::Success, t(3));
        m.observe("vm-0", ProbeResult::Failure, t(4));
        assert_eq!(m.observe("vm-0", ProbeResult::Failure, t(5)), HealthState::Healthy);
        assert_eq!(m.observe("vm-0", ProbeResult::Failure, t(6)), HealthState::Unhealthy);
    }

    #[test]
    fn test_probe_errors_count_as_failures() {
        let mut m = HealthMonitor::default();
        for i in 0..2 {
            assert_eq!(
                m.observe("vm-1", ProbeResult::Error("timeout".into()), t(i)),
                HealthState::Unknown
            );
        }
        let probe: anyhow::Result<bool> = Err(anyhow::anyhow!("timeout"));
        assert_eq!(m.observe("vm-1", probe.into(), t(2)), HealthState::Unhealthy);
    }

    #[test]
    fn test_unhealthy_since_is_first_transition() {
        let mut m = HealthMonitor::new(1);
        m.observe("vm-0", ProbeResult::Failure, t(0));
        m.observe("vm-0", ProbeResult::Failure, t(0) + Duration::minutes(5));
        assert_eq!(m.unhealthy_since("vm-0"), Some(t(0)));
    }

    #[test]
    fn test_retain_forgets_departed_instances() {
        let mut m = HealthMonitor::default();
        m.observe("a", ProbeResult::Success, t(0));
        m.observe("b", ProbeResult::Success, t(0));
        m.retain(&HashSet::from(["a"]));
        assert_eq!(m.state("a"), HealthState::Healthy);
        assert_eq!(m.state("b"), HealthState::Unknown);
        assert!(m.record("b").is_none());
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let m = HealthMonitor::new(0);
        assert_eq!(m.unhealthy_threshold(), 1);
    }
}
