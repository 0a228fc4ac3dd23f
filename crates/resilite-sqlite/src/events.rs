//! Health events published to collaborators
//!
//! Events are informational: subscribers observe them for logging or UX and
//! never feed back into control flow. Publishing never blocks; a lagging
//! subscriber loses the oldest events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use resilite_core::health::{HealthCheckResult, IssueType};

use crate::recovery::RecoveryResult;

/// Buffered events per subscriber before the oldest are dropped
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    MonitoringStarted { interval_ms: u64 },
    MonitoringStopped,
    HealthOk(Box<HealthCheckResult>),
    HealthDegraded(Box<HealthCheckResult>),
    HealthCheckFailed { error: String },
    AutoRecoverySuccess { issue: IssueType, result: RecoveryResult },
    AutoRecoveryFailed { issue: IssueType, result: RecoveryResult },
    AutoRecoveryError { issue: IssueType, error: String },
}

impl HealthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HealthEvent::MonitoringStarted { .. } => "monitoring-started",
            HealthEvent::MonitoringStopped => "monitoring-stopped",
            HealthEvent::HealthOk(_) => "health-ok",
            HealthEvent::HealthDegraded(_) => "health-degraded",
            HealthEvent::HealthCheckFailed { .. } => "health-check-failed",
            HealthEvent::AutoRecoverySuccess { .. } => "auto-recovery-success",
            HealthEvent::AutoRecoveryFailed { .. } => "auto-recovery-failed",
            HealthEvent::AutoRecoveryError { .. } => "auto-recovery-error",
        }
    }
}

/// Fan-out of [`HealthEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HealthEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver; sees only events published after this call.
    ///
    /// Usable from synchronous code via `try_recv`/`blocking_recv` or from
    /// async code via `recv().await`.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: HealthEvent) -> usize {
        tracing::debug!(event = event.name(), "health event");
        // no subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(HealthEvent::MonitoringStopped), 0);
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(HealthEvent::MonitoringStarted { interval_ms: 10 });
        bus.publish(HealthEvent::MonitoringStopped);

        assert_eq!(rx.try_recv().unwrap().name(), "monitoring-started");
        assert_eq!(rx.try_recv().unwrap().name(), "monitoring-stopped");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn lagging_subscriber_loses_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..3 {
            bus.publish(HealthEvent::HealthCheckFailed { error: "x".into() });
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(1))));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn async_receivers_work() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(HealthEvent::MonitoringStopped);

        let event = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(event, HealthEvent::MonitoringStopped);
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(HealthEvent::MonitoringStarted { interval_ms: 5 }).unwrap();
        assert_eq!(json["event"], "monitoring_started");
        assert_eq!(json["interval_ms"], 5);
    }
}
