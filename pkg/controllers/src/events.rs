use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use pkg_metrics::{MetricsRegistry, names};
use pkg_types::event::FleetEvent;

/// A fleet event with its position in the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: FleetEvent,
}

/// In-memory log of fleet events with monotonic sequence numbers.
///
/// Every event is logged through `tracing`, counted in the metrics registry,
/// kept in a capped ring buffer and broadcast to subscribers. One log is
/// shared by all scale-set loops.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<EventRecord>,
    metrics: Arc<MetricsRegistry>,
}

struct EventLogInner {
    seq: u64,
    events: VecDeque<EventRecord>,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let (sender, _) = broadcast::channel(max_events.max(1));
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Record an event.
    pub async fn emit(&self, event: FleetEvent, at: DateTime<Utc>) -> u64 {
        self.trace(&event);
        self.count(&event);

        let mut inner = self.inner.write().await;
        inner.seq += 1;
        let record = EventRecord {
            seq: inner.seq,
            at,
            event,
        };
        if inner.max_events > 0 && inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(record.clone());
        let seq = record.seq;
        // No receivers is fine.
        let _ = self.sender.send(record);
        seq
    }

    fn trace(&self, event: &FleetEvent) {
        match event {
            FleetEvent::BatchStarted {
                scale_set,
                batch,
                instances,
            } => info!(
                scale_set = %scale_set,
                batch,
                "BatchStarted: {} instance(s): {}",
                instances.len(),
                instances.join(", ")
            ),
            FleetEvent::BatchCompleted {
                scale_set,
                batch,
                succeeded,
                failed,
                cancelled,
            } => {
                if failed.is_empty() && !cancelled {
                    info!(
                        scale_set = %scale_set,
                        batch,
                        "BatchCompleted: {} succeeded",
                        succeeded.len()
                    );
                } else {
                    warn!(
                        scale_set = %scale_set,
                        batch,
                        cancelled,
                        "BatchCompleted: {} succeeded, {} failed: {}",
                        succeeded.len(),
                        failed.len(),
                        failed.join(", ")
                    );
                }
            }
            FleetEvent::Paused { scale_set, reason } => {
                info!(scale_set = %scale_set, "Paused: {}", reason)
            }
            FleetEvent::RepairTriggered {
                scale_set,
                instance_id,
                action,
            } => info!(
                scale_set = %scale_set,
                "RepairTriggered: {} on {}",
                action,
                instance_id
            ),
            FleetEvent::RepairCompleted {
                scale_set,
                instance_id,
                action,
                succeeded,
            } => {
                if *succeeded {
                    info!(scale_set = %scale_set, "RepairCompleted: {} on {}", action, instance_id);
                } else {
                    warn!(scale_set = %scale_set, "RepairFailed: {} on {}", action, instance_id);
                }
            }
            FleetEvent::IdentityPatchApplied {
                scale_set,
                identity_type,
                attached,
                detached,
            } => info!(
                scale_set = %scale_set,
                "IdentityPatchApplied: type={} attached=[{}] detached=[{}]",
                identity_type,
                attached.join(", "),
                detached.join(", ")
            ),
        }
    }

    fn count(&self, event: &FleetEvent) {
        let labels = [("scale_set", event.scale_set())];
        match event {
            FleetEvent::BatchStarted { .. } => {
                self.metrics.counter_inc(names::BATCHES_STARTED_TOTAL, &labels)
            }
            FleetEvent::BatchCompleted {
                succeeded, failed, ..
            } => {
                self.metrics
                    .counter_inc(names::BATCHES_COMPLETED_TOTAL, &labels);
                self.metrics.counter_add(
                    names::INSTANCES_UPGRADED_TOTAL,
                    &labels,
                    succeeded.len() as u64,
                );
                self.metrics.counter_add(
                    names::INSTANCE_UPGRADE_FAILURES_TOTAL,
                    &labels,
                    failed.len() as u64,
                );
            }
            FleetEvent::Paused { .. } => {
                self.metrics.counter_inc(names::ROLLOUT_PAUSES_TOTAL, &labels)
            }
            FleetEvent::RepairTriggered { .. } => {
                self.metrics.counter_inc(names::REPAIRS_TRIGGERED_TOTAL, &labels)
            }
            FleetEvent::RepairCompleted { succeeded, .. } => {
                if !succeeded {
                    self.metrics.counter_inc(names::REPAIRS_FAILED_TOTAL, &labels)
                }
            }
            FleetEvent::IdentityPatchApplied { .. } => {
                self.metrics.counter_inc(names::IDENTITY_PATCHES_TOTAL, &labels)
            }
        }
    }

    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    /// Events with a sequence number above `from_seq` still in the buffer.
    pub async fn events_since(&self, from_seq: u64) -> Vec<EventRecord> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    /// Buffered events of one scale set.
    pub async fn events_for(&self, scale_set: &str) -> Vec<FleetEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.event.scale_set() == scale_set)
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::event::PauseReason;

    fn log(capacity: usize) -> EventLog {
        EventLog::new(capacity, Arc::new(MetricsRegistry::with_fleet_metrics()))
    }

    fn paused(scale_set: &str) -> FleetEvent {
        FleetEvent::Paused {
            scale_set: scale_set.into(),
            reason: PauseReason::NoEligibleInstances { pending: 1 },
        }
    }

    #[tokio::test]
    async fn test_sequence_and_ring_buffer() {
        let log = log(2);
        let now = Utc::now();
        for _ in 0..3 {
            log.emit(paused("web"), now).await;
        }
        assert_eq!(log.current_seq().await, 3);
        let events = log.events_since(0).await;
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(log.events_since(2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let log = log(8);
        let mut rx = log.subscribe();
        log.emit(paused("web"), Utc::now()).await;
        let record = rx.recv().await.unwrap();
        assert_eq!(record.seq, 1);
        assert_eq!(record.event.kind(), "Paused");
    }

    #[tokio::test]
    async fn test_events_are_counted_per_scale_set() {
        let log = log(8);
        let now = Utc::now();
        log.emit(paused("web"), now).await;
        log.emit(
            FleetEvent::BatchCompleted {
                scale_set: "api".into(),
                batch: 1,
                succeeded: vec!["api_0".into(), "api_1".into()],
                failed: vec!["api_2".into()],
                cancelled: false,
            },
            now,
        )
        .await;
        let m = log.metrics();
        assert_eq!(m.value(names::ROLLOUT_PAUSES_TOTAL, &[("scale_set", "web")]), 1);
        assert_eq!(m.value(names::INSTANCES_UPGRADED_TOTAL, &[("scale_set", "api")]), 2);
        assert_eq!(
            m.value(names::INSTANCE_UPGRADE_FAILURES_TOTAL, &[("scale_set", "api")]),
            1
        );
        assert_eq!(log.events_for("api").await.len(), 1);
    }
}
