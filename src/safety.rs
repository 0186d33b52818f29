use crate::config::MonitorConfig;
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, EventBus};
use crate::hal::{
    read_or_log, ActuatorCommand, ActuatorId, ActuatorWriter, Freshness, LastKnownGood, SensorId, SensorReader,
    SensorSample, SequenceCounter, UNLIMITED_DELTA,
};
use crate::sequencer::StartupPhase;
use crate::throttle::{ControlMode, ThrottleStatus};
use arrayvec::ArrayString;
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MAX_TRIP_RECORDS: usize = 8;
const MAX_REASON_LEN: usize = 128;

pub type TripReason = ArrayString<MAX_REASON_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Advisory,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimit {
    pub sensor: SensorId,
    pub min: f64,
    pub max: f64,
    pub severity: Severity,
}

impl SafetyLimit {
    pub fn critical(sensor: SensorId, min: f64, max: f64) -> Self {
        Self { sensor, min, max, severity: Severity::Critical }
    }

    pub fn advisory(sensor: SensorId, min: f64, max: f64) -> Self {
        Self { sensor, min, max, severity: Severity::Advisory }
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Armed,
    /// Latched until an explicit, successful reset.
    Tripped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub cycle: u64,
    pub sensor: Option<SensorId>,
    pub value: Option<f64>,
    pub reason: TripReason,
    pub phase: StartupPhase,
    pub throttle_mode: Option<ControlMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyStatus {
    pub state: MonitorState,
    pub cycle: u64,
    pub advisory_breaches: u64,
    pub shutdown_confirmed: bool,
    pub trip: Option<TripRecord>,
}

/// Truncate to the fixed reason capacity on a char boundary.
fn bounded_reason(reason: &str) -> TripReason {
    let mut bounded = TripReason::new();
    for c in reason.chars() {
        if bounded.try_push(c).is_err() {
            break;
        }
    }
    bounded
}

pub struct SafetyMonitor {
    config: MonitorConfig,
    sensors: BTreeMap<SensorId, Box<dyn SensorReader>>,
    shutdown: BTreeMap<ActuatorId, Box<dyn ActuatorWriter>>,
    events: EventBus,
    freshness: BTreeMap<SensorId, LastKnownGood<f64>>,
    state: MonitorState,
    cycle: u64,
    trip: Option<TripRecord>,
    trip_history: BoundedVec<TripRecord, MAX_TRIP_RECORDS>,
    unconfirmed_shutdown: BTreeSet<ActuatorId>,
    advisory_breaches: u64,
    advisory_active: BTreeSet<SensorId>,
    sequence: SequenceCounter,
    phase_rx: Option<watch::Receiver<StartupPhase>>,
    throttle_rx: Option<watch::Receiver<ThrottleStatus>>,
    status_tx: watch::Sender<SafetyStatus>,
}

impl SafetyMonitor {
    pub fn new(
        config: MonitorConfig,
        sensors: Vec<Box<dyn SensorReader>>,
        shutdown: Vec<Box<dyn ActuatorWriter>>,
        events: EventBus,
    ) -> ControlResult<Self> {
        config.validate()?;
        let sensors: BTreeMap<_, _> = sensors.into_iter().map(|s| (s.id(), s)).collect();
        let shutdown: BTreeMap<_, _> = shutdown.into_iter().map(|a| (a.id(), a)).collect();

        if let Some(limit) = config.limits.iter().find(|l| !sensors.contains_key(&l.sensor)) {
            return Err(ControlError::InvalidConfig(format!("limit on {} has no sensor", limit.sensor)));
        }
        let wired: BTreeSet<_> = shutdown.keys().copied().collect();
        let configured: BTreeSet<_> = config.shutdown_actuators.iter().copied().collect();
        if wired != configured {
            return Err(ControlError::InvalidConfig(format!(
                "shutdown actuators wired {wired:?} but configured {configured:?}"
            )));
        }

        let freshness = sensors.keys().map(|&id| (id, LastKnownGood::new(config.stale_limit))).collect();
        let (status_tx, _) = watch::channel(SafetyStatus {
            state: MonitorState::Armed,
            cycle: 0,
            advisory_breaches: 0,
            shutdown_confirmed: false,
            trip: None,
        });

        Ok(Self {
            config,
            sensors,
            shutdown,
            events,
            freshness,
            state: MonitorState::Armed,
            cycle: 0,
            trip: None,
            trip_history: BoundedVec::new(),
            unconfirmed_shutdown: BTreeSet::new(),
            advisory_breaches: 0,
            advisory_active: BTreeSet::new(),
            sequence: SequenceCounter::new(),
            phase_rx: None,
            throttle_rx: None,
            status_tx,
        })
    }

    /// Watch the other loops so trips record what they were doing.
    pub fn observe(&mut self, phase_rx: watch::Receiver<StartupPhase>, throttle_rx: watch::Receiver<ThrottleStatus>) {
        self.phase_rx = Some(phase_rx);
        self.throttle_rx = Some(throttle_rx);
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn is_tripped(&self) -> bool {
        self.state == MonitorState::Tripped
    }

    pub fn trip_history(&self) -> &[TripRecord] {
        &self.trip_history
    }

    pub fn get_status(&self) -> SafetyStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SafetyStatus> {
        self.status_tx.subscribe()
    }

    pub fn owned_actuators(&self) -> impl Iterator<Item = ActuatorId> + '_ {
        self.shutdown.keys().copied()
    }

    /// One monitoring pass. A critical breach trips within this same cycle.
    pub fn run_cycle(&mut self) -> MonitorState {
        self.cycle += 1;

        if self.state == MonitorState::Tripped {
            if !self.unconfirmed_shutdown.is_empty() {
                self.command_shutdown();
            }
            self.publish_status();
            return self.state;
        }

        let readings = self.read_all();
        if let Some((sensor, value, reason)) = self.first_critical_violation(&readings) {
            self.trip(sensor, value, &reason);
        } else {
            self.check_advisories(&readings);
        }
        self.publish_status();
        self.state
    }

    fn read_all(&mut self) -> BTreeMap<SensorId, Freshness<f64>> {
        let stale_limit = self.config.stale_limit;
        let mut readings = BTreeMap::new();
        for (&id, reader) in &mut self.sensors {
            let sample = read_or_log(reader.as_mut()).map(|s| SensorSample {
                value: s.value.magnitude(),
                timestamp_us: s.timestamp_us,
                valid: s.valid,
            });
            let freshness = self.freshness.entry(id).or_insert_with(|| LastKnownGood::new(stale_limit));
            readings.insert(id, freshness.observe(sample));
        }
        readings
    }

    fn first_critical_violation(
        &self,
        readings: &BTreeMap<SensorId, Freshness<f64>>,
    ) -> Option<(SensorId, Option<f64>, String)> {
        // A lost sensor is critical whatever the severity of its limits.
        for (&sensor, reading) in readings {
            if let Freshness::Lost { cycles } = reading {
                return Some((sensor, None, format!("{sensor} unreadable for {cycles} cycles")));
            }
        }
        for limit in self.config.limits.iter().filter(|l| l.severity == Severity::Critical) {
            match readings.get(&limit.sensor) {
                Some(fresh) => {
                    if let Some(value) = fresh.usable().filter(|v| !limit.contains(*v)) {
                        return Some((
                            limit.sensor,
                            Some(value),
                            format!("{} = {value} outside [{}, {}]", limit.sensor, limit.min, limit.max),
                        ));
                    }
                }
                None => return Some((limit.sensor, None, format!("{} not monitored", limit.sensor))),
            }
        }
        None
    }

    fn check_advisories(&mut self, readings: &BTreeMap<SensorId, Freshness<f64>>) {
        let mut breached = BTreeSet::new();
        for limit in self.config.limits.iter().filter(|l| l.severity == Severity::Advisory) {
            let Some(value) = readings.get(&limit.sensor).and_then(Freshness::usable) else {
                continue;
            };
            if limit.contains(value) {
                continue;
            }
            self.advisory_breaches += 1;
            breached.insert(limit.sensor);
            if !self.advisory_active.contains(&limit.sensor) {
                warn!(sensor = %limit.sensor, value, min = limit.min, max = limit.max, "advisory limit breached");
                self.events.publish(ControlEvent::AdvisoryBreach { sensor: limit.sensor, value });
            }
        }
        self.advisory_active = breached;
    }

    fn trip(&mut self, sensor: SensorId, value: Option<f64>, reason: &str) {
        let phase = self.phase_rx.as_ref().map_or(StartupPhase::Idle, |rx| *rx.borrow());
        let throttle_mode = self.throttle_rx.as_ref().map(|rx| rx.borrow().mode);
        error!(%sensor, ?value, ?phase, reason, "safety trip");

        let record = TripRecord {
            cycle: self.cycle,
            sensor: Some(sensor),
            value,
            reason: bounded_reason(reason),
            phase,
            throttle_mode,
        };
        if self.trip_history.is_full() {
            self.trip_history.remove(0);
        }
        let _ = self.trip_history.push(record.clone());
        self.trip = Some(record);
        self.state = MonitorState::Tripped;

        self.unconfirmed_shutdown = self.shutdown.keys().copied().collect();
        self.command_shutdown();
        self.events.publish(ControlEvent::Tripped { sensor: Some(sensor), reason: reason.to_string(), cycle: self.cycle });
    }

    /// Issue the emergency command to every actuator not yet acknowledged.
    fn command_shutdown(&mut self) {
        let pending: Vec<ActuatorId> = self.unconfirmed_shutdown.iter().copied().collect();
        for id in pending {
            let Some(actuator) = self.shutdown.get_mut(&id) else {
                continue;
            };
            let command = ActuatorCommand {
                actuator: id,
                target: self.config.shutdown_target,
                max_delta: UNLIMITED_DELTA,
                sequence: self.sequence.next_sequence(),
                emergency: true,
            };
            match actuator.write(command) {
                Ok(_) => {
                    info!(actuator = %id, "emergency shutdown acknowledged");
                    self.unconfirmed_shutdown.remove(&id);
                }
                Err(e) => {
                    error!(actuator = %id, error = %e, "emergency shutdown write failed, retrying next cycle");
                    self.events.publish(ControlEvent::ActuatorFault { actuator: id, reason: e.to_string() });
                }
            }
        }
    }

    /// Re-arm after a trip. Every monitored sensor is read now; any invalid
    /// sample or any value outside its limit denies the reset.
    pub fn reset(&mut self) -> ControlResult<()> {
        if self.state == MonitorState::Armed {
            debug!("reset on an armed monitor");
            return Ok(());
        }
        if !self.unconfirmed_shutdown.is_empty() {
            return Err(ControlError::ResetDenied {
                reason: format!("shutdown not confirmed on {:?}", self.unconfirmed_shutdown),
            });
        }

        let mut current = BTreeMap::new();
        for (&id, reader) in &mut self.sensors {
            match reader.read() {
                Ok(sample) if sample.valid => {
                    current.insert(id, sample.value.magnitude());
                }
                Ok(_) => return Err(ControlError::ResetDenied { reason: format!("{id} reports an invalid sample") }),
                Err(e) => return Err(ControlError::ResetDenied { reason: format!("{id} unreadable: {e}") }),
            }
        }
        for limit in &self.config.limits {
            let value = current.get(&limit.sensor).copied().unwrap_or(f64::NAN);
            if !limit.contains(value) {
                return Err(ControlError::ResetDenied {
                    reason: format!("{} = {value} outside [{}, {}]", limit.sensor, limit.min, limit.max),
                });
            }
        }

        for freshness in self.freshness.values_mut() {
            freshness.clear();
        }
        self.advisory_active.clear();
        self.trip = None;
        self.state = MonitorState::Armed;
        info!(cycle = self.cycle, "safety monitor re-armed");
        self.events.publish(ControlEvent::MonitorReset);
        self.publish_status();
        Ok(())
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SafetyStatus {
            state: self.state,
            cycle: self.cycle,
            advisory_breaches: self.advisory_breaches,
            shutdown_confirmed: self.state == MonitorState::Tripped && self.unconfirmed_shutdown.is_empty(),
            trip: self.trip.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::hal::sim::{RecordingActuator, ScriptedSensor};

    const PRESSURE: SensorId = SensorId(2);
    const VIBRATION: SensorId = SensorId(5);
    const VALVE: ActuatorId = ActuatorId(6);

    fn monitor_config(limits: Vec<SafetyLimit>) -> MonitorConfig {
        MonitorConfig {
            loop_config: LoopConfig { frequency_hz: 100, max_consecutive_violations: 5 },
            limits,
            stale_limit: 2,
            shutdown_actuators: vec![VALVE],
            shutdown_target: 1.0,
        }
    }

    #[test]
    fn test_bounded_reason_truncates() {
        let long = "x".repeat(MAX_REASON_LEN * 2);
        assert_eq!(bounded_reason(&long).len(), MAX_REASON_LEN);
        assert_eq!(bounded_reason("short").as_str(), "short");
    }

    #[test]
    fn test_limit_bounds_are_inclusive() {
        let limit = SafetyLimit::critical(PRESSURE, 0.0, 100.0);
        assert!(limit.contains(0.0));
        assert!(limit.contains(100.0));
        assert!(!limit.contains(100.01));
        assert!(!limit.contains(f64::NAN));
    }

    #[test]
    fn test_advisory_breach_is_counted_but_never_trips() {
        let (sensor, handle) = ScriptedSensor::new(VIBRATION, 2.0);
        let (valve, probe) = RecordingActuator::new(VALVE);
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut monitor = SafetyMonitor::new(
            monitor_config(vec![SafetyLimit::advisory(VIBRATION, 0.0, 1.5)]),
            vec![Box::new(sensor)],
            vec![Box::new(valve)],
            events,
        )
        .unwrap();

        for _ in 0..5 {
            assert_eq!(monitor.run_cycle(), MonitorState::Armed);
        }
        handle.set(1.0);
        monitor.run_cycle();

        assert_eq!(monitor.get_status().advisory_breaches, 5);
        assert_eq!(probe.count(), 0);
        let advisories = crate::events::drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ControlEvent::AdvisoryBreach { .. }))
            .count();
        assert_eq!(advisories, 1);
    }

    #[test]
    fn test_stale_sensor_within_bound_uses_last_known_good() {
        let (sensor, handle) = ScriptedSensor::new(PRESSURE, 50.0);
        let (valve, probe) = RecordingActuator::new(VALVE);
        let mut monitor = SafetyMonitor::new(
            monitor_config(vec![SafetyLimit::critical(PRESSURE, 0.0, 100.0)]),
            vec![Box::new(sensor)],
            vec![Box::new(valve)],
            EventBus::default(),
        )
        .unwrap();

        monitor.run_cycle();
        handle.set_valid(false);
        assert_eq!(monitor.run_cycle(), MonitorState::Armed);
        assert_eq!(monitor.run_cycle(), MonitorState::Armed);
        assert_eq!(monitor.run_cycle(), MonitorState::Tripped);
        assert_eq!(probe.emergency_count(), 1);
        assert!(monitor.get_status().trip.unwrap().value.is_none());
    }

    #[test]
    fn test_wiring_must_match_configuration() {
        let (sensor, _) = ScriptedSensor::new(PRESSURE, 50.0);
        let (valve, _) = RecordingActuator::new(ActuatorId(9));
        let result = SafetyMonitor::new(
            monitor_config(vec![SafetyLimit::critical(PRESSURE, 0.0, 100.0)]),
            vec![Box::new(sensor)],
            vec![Box::new(valve)],
            EventBus::default(),
        );
        assert!(matches!(result, Err(ControlError::InvalidConfig(_))));
    }
}
