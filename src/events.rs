use crate::hal::{ActuatorId, SensorId};
use crate::sequencer::StartupPhase;
use crate::throttle::ControlMode;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Discrete state changes and escalations published by the loops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ControlEvent {
    PhaseChanged { from: StartupPhase, to: StartupPhase, cycle: u64 },
    ModeChanged { mode: ControlMode },
    FeedbackLost { sensor: SensorId, stale_cycles: u32 },
    FeedbackRestored { sensor: SensorId },
    ActuatorFault { actuator: ActuatorId, reason: String },
    TimingFault { loop_name: &'static str, consecutive: u32 },
    AdvisoryBreach { sensor: SensorId, value: f64 },
    Tripped { sensor: Option<SensorId>, reason: String, cycle: u64 },
    MonitorReset,
    AbortRequested { reason: String },
}

impl ControlEvent {
    /// Events the owning process must decide on.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            ControlEvent::FeedbackLost { .. } | ControlEvent::ActuatorFault { .. } | ControlEvent::TimingFault { .. }
        )
    }
}

/// Fan-out of [`ControlEvent`]s to the owner, the safety monitor and telemetry.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ControlEvent) {
        trace!(?event, "publish");
        // No subscribers is not an error for a publisher.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Drain everything currently queued on `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<ControlEvent>) -> Vec<ControlEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(ControlEvent::MonitorReset);
    }

    #[test]
    fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ControlEvent::MonitorReset);
        bus.publish(ControlEvent::AbortRequested { reason: "operator".into() });
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ControlEvent::MonitorReset);
        assert!(!events[1].is_escalation());
    }

    #[test]
    fn test_escalations() {
        let event = ControlEvent::TimingFault { loop_name: "throttle", consecutive: 6 };
        assert!(event.is_escalation());
    }
}
