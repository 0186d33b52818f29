//! Simulated hardware: scripted sensors, recording actuators and a coarse
//! first-order engine plant. Numbers here are demonstration values only.

use super::{Ack, ActuatorCommand, ActuatorId, ActuatorWriter, SensorId, SensorReader, SensorSample, SensorValue};
use crate::config;
use crate::error::{ControlError, ControlResult};
use crate::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct ScriptState {
    value: SensorValue,
    valid: bool,
    failing_reads: u32,
    reads: u64,
}

/// Sensor whose reading is set from the outside through a [`SensorHandle`].
pub struct ScriptedSensor {
    id: SensorId,
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Clone)]
pub struct SensorHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedSensor {
    pub fn new(id: SensorId, initial: f64) -> (Self, SensorHandle) {
        Self::with_value(id, SensorValue::Scalar(initial))
    }

    pub fn with_value(id: SensorId, initial: SensorValue) -> (Self, SensorHandle) {
        let state = Arc::new(Mutex::new(ScriptState { value: initial, valid: true, failing_reads: 0, reads: 0 }));
        (Self { id, state: Arc::clone(&state) }, SensorHandle { state })
    }
}

impl SensorHandle {
    pub fn set(&self, value: f64) {
        self.set_value(SensorValue::Scalar(value));
    }

    pub fn set_value(&self, value: SensorValue) {
        lock(&self.state).value = value;
    }

    pub fn set_valid(&self, valid: bool) {
        lock(&self.state).valid = valid;
    }

    /// The next `count` reads fail with `SensorFault`.
    pub fn fail_reads(&self, count: u32) {
        lock(&self.state).failing_reads = count;
    }

    pub fn reads(&self) -> u64 {
        lock(&self.state).reads
    }
}

impl SensorReader for ScriptedSensor {
    fn id(&self) -> SensorId {
        self.id
    }

    fn read(&mut self) -> ControlResult<SensorSample> {
        let mut state = lock(&self.state);
        state.reads += 1;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(ControlError::SensorFault { sensor: self.id, reason: "simulated timeout".into() });
        }
        Ok(SensorSample { value: state.value, timestamp_us: state.reads, valid: state.valid })
    }
}

#[derive(Debug, Default)]
struct Recording {
    commands: Vec<ActuatorCommand>,
    failing_writes: u32,
    reject_all: bool,
}

/// Actuator that records every accepted command; failures are injectable.
pub struct RecordingActuator {
    id: ActuatorId,
    log: Arc<Mutex<Recording>>,
}

#[derive(Clone)]
pub struct ActuatorProbe {
    log: Arc<Mutex<Recording>>,
}

impl RecordingActuator {
    pub fn new(id: ActuatorId) -> (Self, ActuatorProbe) {
        let log = Arc::new(Mutex::new(Recording::default()));
        (Self { id, log: Arc::clone(&log) }, ActuatorProbe { log })
    }
}

impl ActuatorProbe {
    pub fn commands(&self) -> Vec<ActuatorCommand> {
        lock(&self.log).commands.clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.log).commands.len()
    }

    pub fn last(&self) -> Option<ActuatorCommand> {
        lock(&self.log).commands.last().copied()
    }

    pub fn emergency_count(&self) -> usize {
        lock(&self.log).commands.iter().filter(|c| c.emergency).count()
    }

    pub fn fail_writes(&self, count: u32) {
        lock(&self.log).failing_writes = count;
    }

    pub fn reject_all(&self, reject: bool) {
        lock(&self.log).reject_all = reject;
    }
}

impl ActuatorWriter for RecordingActuator {
    fn id(&self) -> ActuatorId {
        self.id
    }

    fn write(&mut self, command: ActuatorCommand) -> ControlResult<Ack> {
        let mut log = lock(&self.log);
        if log.reject_all {
            return Err(ControlError::ActuatorFault { actuator: self.id, reason: "command rejected".into() });
        }
        if log.failing_writes > 0 {
            log.failing_writes -= 1;
            return Err(ControlError::ActuatorFault { actuator: self.id, reason: "simulated timeout".into() });
        }
        log.commands.push(command);
        Ok(Ack { actuator: self.id, sequence: command.sequence })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlantChannel {
    Thrust,
    ChamberPressure,
    FuelManifoldPressure,
    PurgeFlow,
    TurbopumpVibration,
}

impl PlantChannel {
    /// Channel behind one of the standard sensor ids.
    pub fn for_sensor(id: SensorId) -> Option<Self> {
        match id {
            config::THRUST_SENSOR => Some(Self::Thrust),
            config::CHAMBER_PRESSURE_SENSOR => Some(Self::ChamberPressure),
            config::FUEL_MANIFOLD_SENSOR => Some(Self::FuelManifoldPressure),
            config::PURGE_FLOW_SENSOR => Some(Self::PurgeFlow),
            config::VIBRATION_SENSOR => Some(Self::TurbopumpVibration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlantInput {
    Throttle,
    FuelValve,
    OxidizerValve,
    PurgeValve,
    Igniter,
    /// Closing (target >= 0.5) cuts all propellant flow.
    EmergencyShutdown,
}

impl PlantInput {
    pub fn for_actuator(id: ActuatorId) -> Option<Self> {
        match id {
            config::THROTTLE_VALVE => Some(Self::Throttle),
            config::FUEL_VALVE => Some(Self::FuelValve),
            config::OXIDIZER_VALVE => Some(Self::OxidizerValve),
            config::PURGE_VALVE => Some(Self::PurgeValve),
            config::IGNITER => Some(Self::Igniter),
            config::EMERGENCY_SHUTDOWN_VALVE => Some(Self::EmergencyShutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlantParams {
    pub max_thrust_n: f64,
    pub nominal_chamber_bar: f64,
    pub fuel_supply_bar: f64,
    pub idle_fraction: f64,
    pub thrust_time_constant_s: f64,
    pub manifold_time_constant_s: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            max_thrust_n: 2_000_000.0,
            nominal_chamber_bar: 100.0,
            fuel_supply_bar: 40.0,
            idle_fraction: 0.1,
            thrust_time_constant_s: 0.15,
            manifold_time_constant_s: 0.2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlantState {
    pub elapsed_us: u64,
    pub throttle: f64,
    pub fuel_valve: f64,
    pub oxidizer_valve: f64,
    pub purge_valve: f64,
    pub igniter: f64,
    pub shutdown: bool,
    pub ignited: bool,
    pub thrust_n: f64,
    pub fuel_manifold_bar: f64,
    pub pressure_offset_bar: f64,
    pub dropouts: Vec<PlantChannel>,
    pub rejected_inputs: Vec<PlantInput>,
    pub shutdown_commands: u32,
}

/// First-order engine model shared by [`PlantSensor`]s and [`PlantActuator`]s.
#[derive(Clone)]
pub struct EnginePlant {
    params: PlantParams,
    state: Arc<Mutex<PlantState>>,
}

impl EnginePlant {
    pub fn new(params: PlantParams) -> Self {
        Self { params, state: Arc::default() }
    }

    pub fn sensor(&self, id: SensorId, channel: PlantChannel) -> PlantSensor {
        PlantSensor { id, channel, plant: self.clone() }
    }

    pub fn actuator(&self, id: ActuatorId, input: PlantInput) -> PlantActuator {
        PlantActuator { id, input, plant: self.clone() }
    }

    pub fn snapshot(&self) -> PlantState {
        lock(&self.state).clone()
    }

    pub fn inject_pressure_offset(&self, offset_bar: f64) {
        lock(&self.state).pressure_offset_bar = offset_bar;
    }

    pub fn set_dropout(&self, channel: PlantChannel, dropped: bool) {
        let mut state = lock(&self.state);
        state.dropouts.retain(|c| *c != channel);
        if dropped {
            state.dropouts.push(channel);
        }
    }

    pub fn reject_input(&self, input: PlantInput, rejected: bool) {
        let mut state = lock(&self.state);
        state.rejected_inputs.retain(|i| *i != input);
        if rejected {
            state.rejected_inputs.push(input);
        }
    }

    /// Advance the model by `dt_s` seconds.
    pub fn step(&self, dt_s: f64) {
        let p = self.params;
        let mut guard = lock(&self.state);
        let s = &mut *guard;
        s.elapsed_us += (dt_s * 1e6) as u64;

        let fuel_open = s.fuel_valve >= 0.5 && !s.shutdown;
        let propellant_open = fuel_open && s.oxidizer_valve >= 0.5;

        let manifold_target = if fuel_open { p.fuel_supply_bar } else { 0.0 };
        s.fuel_manifold_bar += (manifold_target - s.fuel_manifold_bar) * (dt_s / p.manifold_time_constant_s).min(1.0);

        if !propellant_open {
            s.ignited = false;
        } else if s.igniter >= 0.5 {
            s.ignited = true;
        }

        let thrust_target = if s.ignited { p.max_thrust_n * s.throttle.max(p.idle_fraction) } else { 0.0 };
        s.thrust_n += (thrust_target - s.thrust_n) * (dt_s / p.thrust_time_constant_s).min(1.0);
    }

    fn read_channel(&self, channel: PlantChannel) -> SensorSample {
        let p = self.params;
        let s = lock(&self.state);
        let fraction = s.thrust_n / p.max_thrust_n;
        let value = match channel {
            PlantChannel::Thrust => SensorValue::Scalar(s.thrust_n),
            PlantChannel::ChamberPressure => SensorValue::Scalar(fraction * p.nominal_chamber_bar + s.pressure_offset_bar),
            PlantChannel::FuelManifoldPressure => SensorValue::Scalar(s.fuel_manifold_bar),
            PlantChannel::PurgeFlow => SensorValue::Scalar(if s.shutdown { 0.0 } else { s.purge_valve }),
            PlantChannel::TurbopumpVibration => SensorValue::Vector([fraction * 1.5, fraction * 0.8, 0.05]),
        };
        SensorSample { value, timestamp_us: s.elapsed_us, valid: !s.dropouts.contains(&channel) }
    }

    fn apply(&self, input: PlantInput, target: f64) -> bool {
        let mut s = lock(&self.state);
        if s.rejected_inputs.contains(&input) {
            return false;
        }
        match input {
            PlantInput::Throttle => s.throttle = target.clamp(0.0, 1.0),
            PlantInput::FuelValve => s.fuel_valve = target,
            PlantInput::OxidizerValve => s.oxidizer_valve = target,
            PlantInput::PurgeValve => s.purge_valve = target,
            PlantInput::Igniter => s.igniter = target,
            PlantInput::EmergencyShutdown => {
                s.shutdown = target >= 0.5;
                s.shutdown_commands += 1;
            }
        }
        true
    }
}

pub struct PlantSensor {
    id: SensorId,
    channel: PlantChannel,
    plant: EnginePlant,
}

impl SensorReader for PlantSensor {
    fn id(&self) -> SensorId {
        self.id
    }

    fn read(&mut self) -> ControlResult<SensorSample> {
        Ok(self.plant.read_channel(self.channel))
    }
}

pub struct PlantActuator {
    id: ActuatorId,
    input: PlantInput,
    plant: EnginePlant,
}

impl ActuatorWriter for PlantActuator {
    fn id(&self) -> ActuatorId {
        self.id
    }

    fn write(&mut self, command: ActuatorCommand) -> ControlResult<Ack> {
        if self.plant.apply(self.input, command.target) {
            Ok(Ack { actuator: self.id, sequence: command.sequence })
        } else {
            Err(ControlError::ActuatorFault { actuator: self.id, reason: format!("{:?} rejected command", self.input) })
        }
    }
}
