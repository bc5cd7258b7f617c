use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metric names exported by the orchestrator. Every series carries a
/// `scale_set` label.
pub mod names {
    pub const TICKS_TOTAL: &str = "fleet_ticks_total";
    pub const TICK_ERRORS_TOTAL: &str = "fleet_tick_errors_total";
    pub const CONFIG_ERRORS_TOTAL: &str = "fleet_config_errors_total";
    pub const BATCHES_STARTED_TOTAL: &str = "fleet_batches_started_total";
    pub const BATCHES_COMPLETED_TOTAL: &str = "fleet_batches_completed_total";
    pub const INSTANCES_UPGRADED_TOTAL: &str = "fleet_instances_upgraded_total";
    pub const INSTANCE_UPGRADE_FAILURES_TOTAL: &str = "fleet_instance_upgrade_failures_total";
    pub const ROLLOUT_PAUSES_TOTAL: &str = "fleet_rollout_pauses_total";
    pub const REPAIRS_TRIGGERED_TOTAL: &str = "fleet_repairs_triggered_total";
    pub const REPAIRS_FAILED_TOTAL: &str = "fleet_repairs_failed_total";
    pub const IDENTITY_PATCHES_TOTAL: &str = "fleet_identity_patches_total";
    pub const INSTANCES: &str = "fleet_instances";
    pub const UNHEALTHY_INSTANCES: &str = "fleet_unhealthy_instances";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
        }
    }
}

struct Family {
    kind: Kind,
    help: String,
    /// Rendered label set (`{scale_set="web"}`) → value.
    series: BTreeMap<String, AtomicI64>,
}

/// A thread-safe registry of labelled counters and gauges that renders in
/// Prometheus text exposition format.
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

fn render_labels(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(BTreeMap::new()),
        }
    }

    /// A registry with every orchestrator metric registered.
    pub fn with_fleet_metrics() -> Self {
        let registry = Self::new();
        registry.register_counter(names::TICKS_TOTAL, "Reconcile ticks run per scale set");
        registry.register_counter(
            names::TICK_ERRORS_TOTAL,
            "Ticks that observed nothing because a cloud read failed",
        );
        registry.register_counter(
            names::CONFIG_ERRORS_TOTAL,
            "Ticks aborted because the desired state was invalid",
        );
        registry.register_counter(names::BATCHES_STARTED_TOTAL, "Upgrade batches started");
        registry.register_counter(names::BATCHES_COMPLETED_TOTAL, "Upgrade batches completed");
        registry.register_counter(
            names::INSTANCES_UPGRADED_TOTAL,
            "Instances that reached the desired configuration",
        );
        registry.register_counter(
            names::INSTANCE_UPGRADE_FAILURES_TOTAL,
            "Instances whose upgrade failed or timed out",
        );
        registry.register_counter(names::ROLLOUT_PAUSES_TOTAL, "Rollout pauses by backpressure");
        registry.register_counter(names::REPAIRS_TRIGGERED_TOTAL, "Automatic repairs triggered");
        registry.register_counter(names::REPAIRS_FAILED_TOTAL, "Automatic repairs that failed");
        registry.register_counter(names::IDENTITY_PATCHES_TOTAL, "Identity patches applied");
        registry.register_gauge(names::INSTANCES, "Observed instances per scale set");
        registry.register_gauge(
            names::UNHEALTHY_INSTANCES,
            "Instances classified unhealthy per scale set",
        );
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Family>> {
        self.families.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Family>> {
        self.families.write().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, name: &str, help: &str, kind: Kind) {
        self.write().entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: help.to_string(),
            series: BTreeMap::new(),
        });
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        self.register(name, help, Kind::Counter);
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        self.register(name, help, Kind::Gauge);
    }

    /// Apply `op` to one series, creating it on first use. Unregistered
    /// names and kind mismatches are ignored.
    fn update(&self, name: &str, kind: Kind, labels: &[(&str, &str)], op: impl Fn(&AtomicI64)) {
        let key = render_labels(labels);
        {
            let families = self.read();
            match families.get(name) {
                Some(family) if family.kind == kind => {
                    if let Some(value) = family.series.get(&key) {
                        op(value);
                        return;
                    }
                }
                _ => return,
            }
        }
        let mut families = self.write();
        if let Some(family) = families.get_mut(name) {
            op(family.series.entry(key).or_insert_with(|| AtomicI64::new(0)));
        }
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add(name, labels, 1);
    }

    pub fn counter_add(&self, name: &str, labels: &[(&str, &str)], val: u64) {
        let val = i64::try_from(val).unwrap_or(i64::MAX);
        self.update(name, Kind::Counter, labels, |v| {
            v.fetch_add(val, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], val: i64) {
        self.update(name, Kind::Gauge, labels, |v| v.store(val, Ordering::Relaxed));
    }

    /// Current value of one series; 0 if it was never touched.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = render_labels(labels);
        self.read()
            .get(name)
            .and_then(|f| f.series.get(&key))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        for (name, family) in self.read().iter() {
            output.push_str(&format!("# HELP {} {}\n", name, family.help));
            output.push_str(&format!("# TYPE {} {}\n", name, family.kind.as_str()));
            for (labels, value) in &family.series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels,
                    value.load(Ordering::Relaxed)
                ));
            }
        }
        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
