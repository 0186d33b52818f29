use enginectl::config::*;
use enginectl::events::{drain, ControlEvent, EventBus};
use enginectl::hal::sim::{ActuatorProbe, RecordingActuator, ScriptedSensor, SensorHandle};
use enginectl::hal::{ActuatorId, SensorId};
use enginectl::sequencer::*;
use enginectl::ControlError;
use std::collections::BTreeMap;

struct Rig {
    sequencer: StartupSequencer,
    sensors: BTreeMap<SensorId, SensorHandle>,
    valves: BTreeMap<ActuatorId, ActuatorProbe>,
    events: EventBus,
}

impl Rig {
    fn sensor(&self, id: SensorId) -> &SensorHandle {
        &self.sensors[&id]
    }

    fn valve(&self, id: ActuatorId) -> &ActuatorProbe {
        &self.valves[&id]
    }

    /// Make the exit condition of whatever phase is active hold.
    fn satisfy_current_phase(&self) {
        match self.sequencer.phase() {
            StartupPhase::PreCheck => {
                self.sensor(CHAMBER_PRESSURE_SENSOR).set(0.0);
                self.sensor(FUEL_MANIFOLD_SENSOR).set(0.0);
            }
            StartupPhase::Purge => self.sensor(PURGE_FLOW_SENSOR).set(1.0),
            StartupPhase::FuelPriming => self.sensor(FUEL_MANIFOLD_SENSOR).set(38.0),
            StartupPhase::Ignition => self.sensor(CHAMBER_PRESSURE_SENSOR).set(12.0),
            StartupPhase::RampUp => self.sensor(THRUST_SENSOR).set(1_500_000.0),
            _ => {}
        }
    }

    /// Drive cycles with satisfied conditions until `phase` is active.
    fn advance_to(&mut self, phase: StartupPhase) {
        for _ in 0..500 {
            if self.sequencer.phase() == phase {
                return;
            }
            self.satisfy_current_phase();
            self.sequencer.run_cycle();
        }
        panic!("never reached {phase:?}, stuck in {:?}", self.sequencer.phase());
    }
}

fn rig(config: SequencerConfig) -> Rig {
    let events = EventBus::default();
    let mut sensors = BTreeMap::new();
    let mut readers: Vec<Box<dyn enginectl::hal::SensorReader>> = Vec::new();
    for id in [THRUST_SENSOR, CHAMBER_PRESSURE_SENSOR, FUEL_MANIFOLD_SENSOR, PURGE_FLOW_SENSOR] {
        // Start from values that satisfy no gate beyond PreCheck.
        let initial = if id == CHAMBER_PRESSURE_SENSOR { 50.0 } else { 0.0 };
        let (sensor, handle) = ScriptedSensor::new(id, initial);
        sensors.insert(id, handle);
        readers.push(Box::new(sensor));
    }
    let mut valves = BTreeMap::new();
    let mut writers: Vec<Box<dyn enginectl::hal::ActuatorWriter>> = Vec::new();
    for id in [FUEL_VALVE, OXIDIZER_VALVE, PURGE_VALVE, IGNITER] {
        let (valve, probe) = RecordingActuator::new(id);
        valves.insert(id, probe);
        writers.push(Box::new(valve));
    }
    let sequencer = StartupSequencer::new(config, readers, writers, events.clone()).unwrap();
    Rig { sequencer, sensors, valves, events }
}

fn default_rig() -> Rig {
    rig(EngineConfig::default().sequencer)
}

#[test]
fn test_nominal_startup_visits_every_phase_in_order() {
    let mut rig = default_rig();
    let mut rx = rig.events.subscribe();
    rig.sequencer.begin().unwrap();
    rig.advance_to(StartupPhase::SteadyState);

    let visited: Vec<StartupPhase> = rig.sequencer.history().iter().map(|t| t.to).collect();
    assert_eq!(
        visited,
        vec![
            StartupPhase::PreCheck,
            StartupPhase::Purge,
            StartupPhase::FuelPriming,
            StartupPhase::Ignition,
            StartupPhase::RampUp,
            StartupPhase::SteadyState,
        ]
    );
    let published = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ControlEvent::PhaseChanged { .. }))
        .count();
    assert_eq!(published, 6);

    // Entry actions: purge opened then closed, igniter energised then cut.
    let purge: Vec<f64> = rig.valve(PURGE_VALVE).commands().iter().map(|c| c.target).collect();
    assert_eq!(purge, vec![1.0, 0.0]);
    assert_eq!(rig.valve(IGNITER).last().unwrap().target, 0.0);
}

#[test]
fn test_minimum_dwell_holds_phase() {
    let mut rig = default_rig();
    rig.sequencer.begin().unwrap();
    rig.sequencer.run_cycle();
    assert_eq!(rig.sequencer.phase(), StartupPhase::PreCheck);

    rig.satisfy_current_phase();
    // 0.5 s dwell at 10 Hz.
    for _ in 0..4 {
        assert_eq!(rig.sequencer.run_cycle(), StartupPhase::PreCheck);
    }
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Purge);
}

#[test]
fn test_precheck_timeout_aborts_then_shuts_down() {
    let mut rig = default_rig();
    rig.sequencer.begin().unwrap();
    rig.sequencer.run_cycle();
    assert_eq!(rig.sequencer.phase(), StartupPhase::PreCheck);

    // Chamber pressure stays at 50 bar, so the PreCheck gate never opens.
    for _ in 0..49 {
        assert_eq!(rig.sequencer.run_cycle(), StartupPhase::PreCheck);
    }
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Abort);

    for id in [FUEL_VALVE, OXIDIZER_VALVE, IGNITER] {
        assert_eq!(rig.valve(id).last().unwrap().target, 0.0, "{id}");
    }
    assert_eq!(rig.valve(PURGE_VALVE).last().unwrap().target, 1.0);

    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Shutdown);
    let abort = &rig.sequencer.history()[1];
    assert_eq!(abort.to, StartupPhase::Abort);
    assert!(abort.reason.as_deref().unwrap_or_default().contains("PreCheck timed out"));
}

#[test]
fn test_external_abort_from_every_gated_phase() {
    for phase in StartupPhase::GATED {
        let mut rig = default_rig();
        rig.sequencer.begin().unwrap();
        rig.advance_to(phase);

        rig.sequencer.request_abort("operator");
        assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Abort, "abort from {phase:?}");
        assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Shutdown);
        assert!(!rig.sequencer.history().iter().any(|t| t.to == StartupPhase::SteadyState));
    }
}

#[test]
fn test_abort_from_idle() {
    let mut rig = default_rig();
    rig.sequencer.abort_switch().trigger("pre-start inhibit");
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Abort);
    assert!(matches!(
        rig.sequencer.begin(),
        Err(ControlError::InvalidTransition { from: StartupPhase::Abort, .. })
    ));
}

#[test]
fn test_abort_request_ignored_after_shutdown() {
    let mut rig = default_rig();
    rig.sequencer.request_abort("first");
    rig.sequencer.run_cycle();
    rig.sequencer.run_cycle();
    assert_eq!(rig.sequencer.phase(), StartupPhase::Shutdown);

    rig.sequencer.request_abort("second");
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Shutdown);
    assert_eq!(rig.sequencer.history().len(), 2);
}

#[test]
fn test_unconfirmed_abort_action_shuts_down_at_abort_timeout() {
    let mut rig = default_rig();
    rig.valve(FUEL_VALVE).reject_all(true);
    rig.sequencer.request_abort("test");
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Abort);

    // 2 s abort timeout at 10 Hz; failed actions are reissued meanwhile.
    for _ in 0..19 {
        assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Abort);
    }
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Shutdown);
    assert_eq!(rig.valve(FUEL_VALVE).count(), 0);
}

#[test]
fn test_abort_action_confirmed_on_retry() {
    let mut rig = default_rig();
    rig.valve(FUEL_VALVE).fail_writes(1);
    rig.sequencer.request_abort("test");
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Abort);
    assert_eq!(rig.valve(FUEL_VALVE).count(), 0);
    assert_eq!(rig.sequencer.run_cycle(), StartupPhase::Shutdown);
    assert_eq!(rig.valve(FUEL_VALVE).last().unwrap().target, 0.0);
}

#[test]
fn test_begin_only_from_idle() {
    let mut rig = default_rig();
    rig.sequencer.begin().unwrap();
    rig.sequencer.run_cycle();
    assert!(matches!(rig.sequencer.begin(), Err(ControlError::InvalidTransition { .. })));
}

#[test]
fn test_phase_watch_follows_transitions() {
    let mut rig = default_rig();
    let rx = rig.sequencer.subscribe_phase();
    assert_eq!(*rx.borrow(), StartupPhase::Idle);
    rig.sequencer.begin().unwrap();
    rig.sequencer.run_cycle();
    assert_eq!(*rx.borrow(), StartupPhase::PreCheck);
}

#[test]
fn test_actuator_outside_ownership_is_rejected() {
    let mut config = EngineConfig::default().sequencer;
    config.abort_actions.push(ActuatorSetting { actuator: EMERGENCY_SHUTDOWN_VALVE, target: 1.0 });
    let (valve, _) = RecordingActuator::new(FUEL_VALVE);
    let result = StartupSequencer::new(config, Vec::new(), vec![Box::new(valve)], EventBus::default());
    assert!(matches!(result, Err(ControlError::InvalidConfig(_))));
}
