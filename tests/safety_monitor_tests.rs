use enginectl::config::{LoopConfig, MonitorConfig};
use enginectl::events::{drain, ControlEvent, EventBus};
use enginectl::hal::sim::{ActuatorProbe, RecordingActuator, ScriptedSensor, SensorHandle};
use enginectl::hal::{ActuatorId, SensorId, SensorValue};
use enginectl::safety::*;
use enginectl::ControlError;

const PRESSURE: SensorId = SensorId(2);
const THRUST: SensorId = SensorId(1);
const SHUTDOWN_VALVE: ActuatorId = ActuatorId(6);

struct Rig {
    monitor: SafetyMonitor,
    pressure: SensorHandle,
    thrust: SensorHandle,
    valve: ActuatorProbe,
    events: EventBus,
}

fn rig(pressure: f64) -> Rig {
    let (pressure_sensor, pressure_handle) = ScriptedSensor::new(PRESSURE, pressure);
    let (thrust_sensor, thrust_handle) = ScriptedSensor::new(THRUST, 0.0);
    let (valve, probe) = RecordingActuator::new(SHUTDOWN_VALVE);
    let events = EventBus::default();
    let config = MonitorConfig {
        loop_config: LoopConfig { frequency_hz: 100, max_consecutive_violations: 5 },
        limits: vec![
            SafetyLimit::critical(PRESSURE, 0.0, 100.0),
            SafetyLimit::advisory(THRUST, 0.0, 1_000.0),
        ],
        stale_limit: 3,
        shutdown_actuators: vec![SHUTDOWN_VALVE],
        shutdown_target: 1.0,
    };
    let monitor = SafetyMonitor::new(
        config,
        vec![Box::new(pressure_sensor), Box::new(thrust_sensor)],
        vec![Box::new(valve)],
        events.clone(),
    )
    .unwrap();
    Rig { monitor, pressure: pressure_handle, thrust: thrust_handle, valve: probe, events }
}

#[test]
fn test_in_limit_readings_never_trip() {
    let mut rig = rig(0.0);
    for step in 0..=200 {
        rig.pressure.set(f64::from(step) / 2.0);
        assert_eq!(rig.monitor.run_cycle(), MonitorState::Armed);
    }
    assert_eq!(rig.valve.count(), 0);
    assert!(rig.monitor.trip_history().is_empty());
}

#[test]
fn test_critical_breach_trips_with_one_emergency_command() {
    let mut rig = rig(50.0);
    let mut rx = rig.events.subscribe();
    rig.monitor.run_cycle();

    rig.pressure.set(150.0);
    // The breach is acted on within the cycle that first sees it.
    assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    assert_eq!(rig.valve.emergency_count(), 1);

    for _ in 0..50 {
        assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    }
    assert_eq!(rig.valve.count(), 1);
    let command = rig.valve.last().unwrap();
    assert!(command.emergency);
    assert_eq!(command.target, 1.0);

    let status = rig.monitor.get_status();
    assert!(status.shutdown_confirmed);
    let trip = status.trip.unwrap();
    assert_eq!(trip.sensor, Some(PRESSURE));
    assert_eq!(trip.value, Some(150.0));
    assert_eq!(trip.cycle, 2);

    let trips: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ControlEvent::Tripped { .. }))
        .collect();
    assert_eq!(trips.len(), 1);
}

#[test]
fn test_trip_latches_after_value_returns() {
    let mut rig = rig(150.0);
    rig.monitor.run_cycle();
    rig.pressure.set(20.0);
    for _ in 0..10 {
        assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    }
    assert!(rig.monitor.is_tripped());
}

#[test]
fn test_reset_denied_while_still_breached() {
    let mut rig = rig(150.0);
    rig.monitor.run_cycle();
    match rig.monitor.reset() {
        Err(ControlError::ResetDenied { reason }) => assert!(reason.contains("S2"), "{reason}"),
        other => panic!("expected ResetDenied, got {other:?}"),
    }
    assert_eq!(rig.monitor.state(), MonitorState::Tripped);
}

#[test]
fn test_reset_denied_on_invalid_sample() {
    let mut rig = rig(150.0);
    rig.monitor.run_cycle();
    rig.pressure.set(20.0);
    rig.pressure.set_valid(false);
    assert!(matches!(rig.monitor.reset(), Err(ControlError::ResetDenied { .. })));
}

#[test]
fn test_reset_rearms_when_all_within_limits() {
    let mut rig = rig(150.0);
    let mut rx = rig.events.subscribe();
    rig.monitor.run_cycle();
    rig.pressure.set(20.0);

    rig.monitor.reset().unwrap();
    assert_eq!(rig.monitor.state(), MonitorState::Armed);
    assert!(drain(&mut rx).contains(&ControlEvent::MonitorReset));

    // A second breach trips again and commands shutdown again.
    rig.pressure.set(101.0);
    assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    assert_eq!(rig.valve.emergency_count(), 2);
    assert_eq!(rig.monitor.trip_history().len(), 2);
}

#[test]
fn test_failed_shutdown_write_is_retried_until_acknowledged() {
    let mut rig = rig(150.0);
    rig.valve.fail_writes(2);

    assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    assert_eq!(rig.valve.count(), 0);
    assert!(!rig.monitor.get_status().shutdown_confirmed);
    rig.pressure.set(10.0);
    assert!(rig.monitor.reset().is_err());

    rig.monitor.run_cycle();
    rig.monitor.run_cycle();
    assert_eq!(rig.valve.count(), 1);
    assert!(rig.monitor.get_status().shutdown_confirmed);

    rig.monitor.run_cycle();
    assert_eq!(rig.valve.count(), 1);
}

#[test]
fn test_advisory_breach_does_not_trip() {
    let mut rig = rig(50.0);
    rig.thrust.set(5_000.0);
    for _ in 0..20 {
        assert_eq!(rig.monitor.run_cycle(), MonitorState::Armed);
    }
    assert_eq!(rig.monitor.get_status().advisory_breaches, 20);
    assert_eq!(rig.valve.count(), 0);
}

#[test]
fn test_sensor_fault_beyond_stale_limit_trips() {
    let mut rig = rig(50.0);
    rig.monitor.run_cycle();
    rig.pressure.fail_reads(10);
    for _ in 0..3 {
        assert_eq!(rig.monitor.run_cycle(), MonitorState::Armed);
    }
    assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    assert_eq!(rig.valve.emergency_count(), 1);
}

#[test]
fn test_lost_advisory_only_sensor_trips() {
    let mut rig = rig(50.0);
    rig.monitor.run_cycle();
    // Thrust carries only an advisory limit here.
    rig.thrust.fail_reads(1_000);
    for _ in 0..3 {
        assert_eq!(rig.monitor.run_cycle(), MonitorState::Armed);
    }
    assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    assert_eq!(rig.valve.emergency_count(), 1);

    let trip = rig.monitor.get_status().trip.unwrap();
    assert_eq!(trip.sensor, Some(THRUST));
    assert_eq!(trip.value, None);
    for _ in 0..20 {
        assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    }
    assert_eq!(rig.valve.count(), 1);
}

#[test]
fn test_advisory_only_sensor_never_read_trips() {
    let mut rig = rig(50.0);
    rig.thrust.set_valid(false);
    assert_eq!(rig.monitor.run_cycle(), MonitorState::Tripped);
    assert_eq!(rig.monitor.get_status().trip.unwrap().sensor, Some(THRUST));
}

#[test]
fn test_vector_sensor_checked_by_magnitude() {
    const VIBRATION: SensorId = SensorId(5);
    let (pressure, _) = ScriptedSensor::new(PRESSURE, 50.0);
    let (vibration, handle) = ScriptedSensor::with_value(VIBRATION, SensorValue::Vector([1.2, 0.6, 0.05]));
    let (valve, probe) = RecordingActuator::new(SHUTDOWN_VALVE);
    let config = MonitorConfig {
        loop_config: LoopConfig { frequency_hz: 100, max_consecutive_violations: 5 },
        limits: vec![
            SafetyLimit::critical(PRESSURE, 0.0, 100.0),
            SafetyLimit::critical(VIBRATION, 0.0, 2.5),
            SafetyLimit::advisory(VIBRATION, 0.0, 1.6),
        ],
        stale_limit: 3,
        shutdown_actuators: vec![SHUTDOWN_VALVE],
        shutdown_target: 1.0,
    };
    let mut monitor =
        SafetyMonitor::new(config, vec![Box::new(pressure), Box::new(vibration)], vec![Box::new(valve)], EventBus::default())
            .unwrap();

    // |(1.2, 0.6, 0.05)| is about 1.34: inside both limits.
    assert_eq!(monitor.run_cycle(), MonitorState::Armed);
    assert_eq!(monitor.get_status().advisory_breaches, 0);

    // Each component is below 1.6 but the magnitude (about 1.70) is not.
    handle.set_value(SensorValue::Vector([1.2, 1.2, 0.0]));
    assert_eq!(monitor.run_cycle(), MonitorState::Armed);
    assert_eq!(monitor.get_status().advisory_breaches, 1);

    // Components below 2.5, magnitude 2.6.
    handle.set_value(SensorValue::Vector([2.4, 1.0, 0.0]));
    assert_eq!(monitor.run_cycle(), MonitorState::Tripped);
    assert_eq!(probe.emergency_count(), 1);
    let trip = monitor.get_status().trip.unwrap();
    assert_eq!(trip.sensor, Some(VIBRATION));
    assert!((trip.value.unwrap() - 2.6).abs() < 1e-9);
}
