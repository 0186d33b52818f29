//! Loop and engine configuration.
//!
//! Gains, timeouts and limits below are placeholders for the simulated plant,
//! not validated engine data. Real profiles are loaded from JSON.

use crate::error::{ControlError, ControlResult};
use crate::hal::{ActuatorId, SensorId};
use crate::registry::ActuatorRegistry;
use crate::safety::{SafetyLimit, Severity};
use crate::sequencer::{Comparison, SensorCondition, StartupPhase};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::path::Path;
use std::time::Duration;

pub const MIN_FREQUENCY_HZ: u32 = 1;
pub const MAX_FREQUENCY_HZ: u32 = 10_000;
const_assert!(MIN_FREQUENCY_HZ >= 1);
const_assert!(MIN_FREQUENCY_HZ < MAX_FREQUENCY_HZ);

// Device map of the demonstration engine
pub const THRUST_SENSOR: SensorId = SensorId(1);
pub const CHAMBER_PRESSURE_SENSOR: SensorId = SensorId(2);
pub const FUEL_MANIFOLD_SENSOR: SensorId = SensorId(3);
pub const PURGE_FLOW_SENSOR: SensorId = SensorId(4);
pub const VIBRATION_SENSOR: SensorId = SensorId(5);

pub const THROTTLE_VALVE: ActuatorId = ActuatorId(1);
pub const FUEL_VALVE: ActuatorId = ActuatorId(2);
pub const OXIDIZER_VALVE: ActuatorId = ActuatorId(3);
pub const PURGE_VALVE: ActuatorId = ActuatorId(4);
pub const IGNITER: ActuatorId = ActuatorId(5);
pub const EMERGENCY_SHUTDOWN_VALVE: ActuatorId = ActuatorId(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub frequency_hz: u32,
    /// Consecutive budget overruns tolerated before `PersistentTimingFault`.
    pub max_consecutive_violations: u32,
}

impl LoopConfig {
    pub fn new(frequency_hz: u32, max_consecutive_violations: u32) -> ControlResult<Self> {
        let config = Self { frequency_hz, max_consecutive_violations };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ControlResult<()> {
        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&self.frequency_hz) {
            return Err(ControlError::InvalidConfig(format!(
                "frequency {} Hz outside {MIN_FREQUENCY_HZ}..={MAX_FREQUENCY_HZ}",
                self.frequency_hz
            )));
        }
        Ok(())
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frequency_hz.max(MIN_FREQUENCY_HZ)))
    }

    pub fn period_s(&self) -> f64 {
        self.cycle_budget().as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Low-pass weight on the newest measurement derivative, in (0, 1].
    pub derivative_filter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulePoint {
    pub at_s: f64,
    pub output: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub loop_config: LoopConfig,
    pub thrust_sensor: SensorId,
    pub throttle_actuator: ActuatorId,
    pub max_thrust_n: f64,
    pub gains: PidGains,
    pub output_min: f64,
    pub output_max: f64,
    pub max_delta_per_cycle: f64,
    /// Stale feedback cycles absorbed before the output freezes.
    pub feedback_stale_limit: u32,
    pub open_loop_schedule: Vec<SchedulePoint>,
}

impl ThrottleConfig {
    pub fn validate(&self) -> ControlResult<()> {
        self.loop_config.validate()?;
        let g = self.gains;
        let finite = [g.kp, g.ki, g.kd, self.max_thrust_n, self.max_delta_per_cycle, self.output_min, self.output_max];
        if !finite.iter().all(|v| v.is_finite()) {
            return Err(ControlError::InvalidConfig("throttle parameters must be finite".into()));
        }
        if self.max_thrust_n <= 0.0 {
            return Err(ControlError::InvalidConfig("max thrust must be positive".into()));
        }
        if self.output_min >= self.output_max {
            return Err(ControlError::InvalidConfig("throttle output range is empty".into()));
        }
        if self.max_delta_per_cycle <= 0.0 {
            return Err(ControlError::InvalidConfig("throttle rate limit must be positive".into()));
        }
        if !(g.derivative_filter > 0.0 && g.derivative_filter <= 1.0) {
            return Err(ControlError::InvalidConfig("derivative filter must be in (0, 1]".into()));
        }
        if self.open_loop_schedule.windows(2).any(|w| w[1].at_s < w[0].at_s) {
            return Err(ControlError::InvalidConfig("open-loop schedule must be time ordered".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSetting {
    pub actuator: ActuatorId,
    pub target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub phase: StartupPhase,
    #[serde(default)]
    pub entry_actions: Vec<ActuatorSetting>,
    pub exit_conditions: Vec<SensorCondition>,
    pub min_dwell_s: f64,
    pub timeout_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfig {
    pub loop_config: LoopConfig,
    pub phases: Vec<PhaseSpec>,
    /// De-energize / safe-position command set issued on entering Abort.
    pub abort_actions: Vec<ActuatorSetting>,
    pub abort_timeout_s: f64,
}

impl SequencerConfig {
    pub fn spec(&self, phase: StartupPhase) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn validate(&self) -> ControlResult<()> {
        self.loop_config.validate()?;
        for phase in StartupPhase::GATED {
            let spec = self
                .spec(phase)
                .ok_or_else(|| ControlError::InvalidConfig(format!("phase {phase:?} is not configured")))?;
            if !spec.timeout_s.is_finite() || spec.timeout_s <= 0.0 || spec.min_dwell_s < 0.0 || spec.min_dwell_s > spec.timeout_s {
                return Err(ControlError::InvalidConfig(format!(
                    "phase {phase:?} needs 0 <= dwell <= timeout and a positive timeout"
                )));
            }
        }
        if let Some(extra) = self.phases.iter().find(|p| !StartupPhase::GATED.contains(&p.phase)) {
            return Err(ControlError::InvalidConfig(format!("phase {:?} is not gated", extra.phase)));
        }
        if !self.abort_timeout_s.is_finite() || self.abort_timeout_s <= 0.0 {
            return Err(ControlError::InvalidConfig("abort timeout must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub loop_config: LoopConfig,
    pub limits: Vec<SafetyLimit>,
    /// Invalid or failed reads tolerated per sensor before a critical violation.
    pub stale_limit: u32,
    pub shutdown_actuators: Vec<ActuatorId>,
    pub shutdown_target: f64,
}

impl MonitorConfig {
    pub fn validate(&self) -> ControlResult<()> {
        self.loop_config.validate()?;
        if self.shutdown_actuators.is_empty() {
            return Err(ControlError::InvalidConfig("at least one shutdown actuator is required".into()));
        }
        if !self.shutdown_target.is_finite() {
            return Err(ControlError::InvalidConfig("shutdown target must be finite".into()));
        }
        if let Some(limit) = self.limits.iter().find(|l| !(l.min <= l.max)) {
            return Err(ControlError::InvalidConfig(format!("limit on {} has min > max", limit.sensor)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub throttle: ThrottleConfig,
    pub sequencer: SequencerConfig,
    pub monitor: MonitorConfig,
    pub steady_state_thrust_n: f64,
    /// Turn escalated faults into an Abort request instead of only reporting them.
    #[serde(default)]
    pub abort_on_escalation: bool,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> ControlResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ControlResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> ControlResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ControlResult<()> {
        self.throttle.validate()?;
        self.sequencer.validate()?;
        self.monitor.validate()?;
        if !(0.0..=self.throttle.max_thrust_n).contains(&self.steady_state_thrust_n) {
            return Err(ControlError::InvalidConfig("steady-state thrust exceeds the throttle maximum".into()));
        }
        ActuatorRegistry::from_config(self)?;
        Ok(())
    }
}

fn set(actuator: ActuatorId, target: f64) -> ActuatorSetting {
    ActuatorSetting { actuator, target }
}

fn when(sensor: SensorId, comparison: Comparison) -> SensorCondition {
    SensorCondition { sensor, comparison }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let steady_state_thrust_n = 1_500_000.0;
        Self {
            throttle: ThrottleConfig {
                loop_config: LoopConfig { frequency_hz: 100, max_consecutive_violations: 5 },
                thrust_sensor: THRUST_SENSOR,
                throttle_actuator: THROTTLE_VALVE,
                max_thrust_n: 1_800_000.0,
                gains: PidGains { kp: 1.0e-7, ki: 1.0e-6, kd: 2.0e-9, derivative_filter: 0.2 },
                output_min: 0.0,
                output_max: 1.0,
                max_delta_per_cycle: 0.01,
                feedback_stale_limit: 5,
                open_loop_schedule: vec![
                    SchedulePoint { at_s: 0.0, output: 0.1 },
                    SchedulePoint { at_s: 2.0, output: 0.75 },
                ],
            },
            sequencer: SequencerConfig {
                loop_config: LoopConfig { frequency_hz: 10, max_consecutive_violations: 3 },
                phases: vec![
                    PhaseSpec {
                        phase: StartupPhase::PreCheck,
                        entry_actions: vec![set(FUEL_VALVE, 0.0), set(OXIDIZER_VALVE, 0.0), set(IGNITER, 0.0)],
                        exit_conditions: vec![
                            when(CHAMBER_PRESSURE_SENSOR, Comparison::Below(5.0)),
                            when(FUEL_MANIFOLD_SENSOR, Comparison::Below(2.0)),
                        ],
                        min_dwell_s: 0.5,
                        timeout_s: 5.0,
                    },
                    PhaseSpec {
                        phase: StartupPhase::Purge,
                        entry_actions: vec![set(PURGE_VALVE, 1.0)],
                        exit_conditions: vec![when(PURGE_FLOW_SENSOR, Comparison::Above(0.5))],
                        min_dwell_s: 1.0,
                        timeout_s: 5.0,
                    },
                    PhaseSpec {
                        phase: StartupPhase::FuelPriming,
                        entry_actions: vec![set(PURGE_VALVE, 0.0), set(FUEL_VALVE, 1.0)],
                        exit_conditions: vec![when(FUEL_MANIFOLD_SENSOR, Comparison::Above(30.0))],
                        min_dwell_s: 0.5,
                        timeout_s: 5.0,
                    },
                    PhaseSpec {
                        phase: StartupPhase::Ignition,
                        entry_actions: vec![set(OXIDIZER_VALVE, 1.0), set(IGNITER, 1.0)],
                        exit_conditions: vec![when(CHAMBER_PRESSURE_SENSOR, Comparison::Above(5.0))],
                        min_dwell_s: 0.3,
                        timeout_s: 3.0,
                    },
                    PhaseSpec {
                        phase: StartupPhase::RampUp,
                        entry_actions: vec![set(IGNITER, 0.0)],
                        exit_conditions: vec![when(
                            THRUST_SENSOR,
                            Comparison::Within { min: 0.9 * steady_state_thrust_n, max: 1.1 * steady_state_thrust_n },
                        )],
                        min_dwell_s: 0.5,
                        timeout_s: 10.0,
                    },
                ],
                abort_actions: vec![
                    set(FUEL_VALVE, 0.0),
                    set(OXIDIZER_VALVE, 0.0),
                    set(IGNITER, 0.0),
                    set(PURGE_VALVE, 1.0),
                ],
                abort_timeout_s: 2.0,
            },
            monitor: MonitorConfig {
                loop_config: LoopConfig { frequency_hz: 100, max_consecutive_violations: 5 },
                limits: vec![
                    SafetyLimit { sensor: CHAMBER_PRESSURE_SENSOR, min: -5.0, max: 110.0, severity: Severity::Critical },
                    SafetyLimit { sensor: THRUST_SENSOR, min: -50_000.0, max: 1_900_000.0, severity: Severity::Critical },
                    SafetyLimit { sensor: VIBRATION_SENSOR, min: 0.0, max: 2.5, severity: Severity::Critical },
                    SafetyLimit { sensor: VIBRATION_SENSOR, min: 0.0, max: 1.6, severity: Severity::Advisory },
                    SafetyLimit { sensor: FUEL_MANIFOLD_SENSOR, min: -1.0, max: 45.0, severity: Severity::Advisory },
                ],
                stale_limit: 3,
                shutdown_actuators: vec![EMERGENCY_SHUTDOWN_VALVE],
                shutdown_target: 1.0,
            },
            steady_state_thrust_n,
            abort_on_escalation: false,
        }
    }
}
