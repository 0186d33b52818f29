//! Engine startup state machine.
//!
//! ```text
//! Idle -> PreCheck -> Purge -> FuelPriming -> Ignition -> RampUp -> SteadyState
//!   \________\__________\__________\____________\__________\__________> Abort -> Shutdown
//! ```
//!
//! Each gated phase advances only when all of its sensor conditions hold and
//! its minimum dwell has passed; a phase that outlives its timeout aborts.
//! Abort can be requested from outside at any time and always wins.

use crate::config::{ActuatorSetting, PhaseSpec, SequencerConfig};
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, EventBus};
use crate::hal::{
    read_or_log, ActuatorCommand, ActuatorId, ActuatorWriter, SensorId, SensorReader, SequenceCounter, UNLIMITED_DELTA,
};
use crate::lock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MAX_TRANSITIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StartupPhase {
    Idle,
    PreCheck,
    Purge,
    FuelPriming,
    Ignition,
    RampUp,
    SteadyState,
    Abort,
    Shutdown,
}

impl StartupPhase {
    pub const ALL: [StartupPhase; 9] = [
        StartupPhase::Idle,
        StartupPhase::PreCheck,
        StartupPhase::Purge,
        StartupPhase::FuelPriming,
        StartupPhase::Ignition,
        StartupPhase::RampUp,
        StartupPhase::SteadyState,
        StartupPhase::Abort,
        StartupPhase::Shutdown,
    ];

    /// Phases left only through a satisfied exit condition.
    pub const GATED: [StartupPhase; 5] = [
        StartupPhase::PreCheck,
        StartupPhase::Purge,
        StartupPhase::FuelPriming,
        StartupPhase::Ignition,
        StartupPhase::RampUp,
    ];

    /// Nominal successor on the success path.
    pub fn next(self) -> Option<StartupPhase> {
        match self {
            StartupPhase::Idle => Some(StartupPhase::PreCheck),
            StartupPhase::PreCheck => Some(StartupPhase::Purge),
            StartupPhase::Purge => Some(StartupPhase::FuelPriming),
            StartupPhase::FuelPriming => Some(StartupPhase::Ignition),
            StartupPhase::Ignition => Some(StartupPhase::RampUp),
            StartupPhase::RampUp => Some(StartupPhase::SteadyState),
            StartupPhase::SteadyState | StartupPhase::Abort | StartupPhase::Shutdown => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StartupPhase::SteadyState | StartupPhase::Shutdown)
    }

    /// Abort is accepted everywhere except while already aborting or shut down.
    /// SteadyState ends the startup sequence but the engine can still be aborted.
    pub fn accepts_abort(self) -> bool {
        !matches!(self, StartupPhase::Abort | StartupPhase::Shutdown)
    }

    pub fn can_transition(self, to: StartupPhase) -> bool {
        match (self, to) {
            (_, StartupPhase::Abort) => self.accepts_abort(),
            (StartupPhase::Abort, StartupPhase::Shutdown) => true,
            _ => self.next() == Some(to),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Comparison {
    Above(f64),
    Below(f64),
    Within { min: f64, max: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorCondition {
    pub sensor: SensorId,
    pub comparison: Comparison,
}

impl SensorCondition {
    pub fn holds(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::Above(threshold) => value > threshold,
            Comparison::Below(threshold) => value < threshold,
            Comparison::Within { min, max } => (min..=max).contains(&value),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTransition {
    pub from: StartupPhase,
    pub to: StartupPhase,
    pub cycle: u64,
    pub reason: Option<String>,
}

/// Lock-free abort request, safe to trigger from any task.
#[derive(Debug, Clone, Default)]
pub struct AbortSwitch {
    requested: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl AbortSwitch {
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        lock(&self.reason).get_or_insert(reason);
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn take(&self) -> Option<String> {
        if !self.requested.swap(false, Ordering::SeqCst) {
            return None;
        }
        let reason = lock(&self.reason).take();
        Some(reason.unwrap_or_else(|| "external abort request".to_string()))
    }
}

pub struct StartupSequencer {
    config: SequencerConfig,
    sensors: BTreeMap<SensorId, Box<dyn SensorReader>>,
    actuators: BTreeMap<ActuatorId, Box<dyn ActuatorWriter>>,
    events: EventBus,
    abort_switch: AbortSwitch,
    phase: StartupPhase,
    phase_cycles: u64,
    cycle: u64,
    start_requested: bool,
    unconfirmed_abort_actions: BTreeSet<ActuatorId>,
    sequence: SequenceCounter,
    history: heapless::Vec<PhaseTransition, MAX_TRANSITIONS>,
    phase_tx: watch::Sender<StartupPhase>,
}

impl StartupSequencer {
    pub fn new(
        config: SequencerConfig,
        sensors: Vec<Box<dyn SensorReader>>,
        actuators: Vec<Box<dyn ActuatorWriter>>,
        events: EventBus,
    ) -> ControlResult<Self> {
        config.validate()?;
        let sensors: BTreeMap<_, _> = sensors.into_iter().map(|s| (s.id(), s)).collect();
        let actuators: BTreeMap<_, _> = actuators.into_iter().map(|a| (a.id(), a)).collect();

        let settings = config.phases.iter().flat_map(|p| p.entry_actions.iter()).chain(config.abort_actions.iter());
        for setting in settings {
            if !actuators.contains_key(&setting.actuator) {
                return Err(ControlError::InvalidConfig(format!(
                    "sequencer commands {} but does not own it",
                    setting.actuator
                )));
            }
        }
        for condition in config.phases.iter().flat_map(|p| p.exit_conditions.iter()) {
            if !sensors.contains_key(&condition.sensor) {
                return Err(ControlError::InvalidConfig(format!(
                    "sequencer condition reads {} but has no reader for it",
                    condition.sensor
                )));
            }
        }

        let (phase_tx, _) = watch::channel(StartupPhase::Idle);
        Ok(Self {
            config,
            sensors,
            actuators,
            events,
            abort_switch: AbortSwitch::default(),
            phase: StartupPhase::Idle,
            phase_cycles: 0,
            cycle: 0,
            start_requested: false,
            unconfirmed_abort_actions: BTreeSet::new(),
            sequence: SequenceCounter::new(),
            history: heapless::Vec::new(),
            phase_tx,
        })
    }

    pub fn phase(&self) -> StartupPhase {
        self.phase
    }

    pub fn history(&self) -> &[PhaseTransition] {
        &self.history
    }

    pub fn owned_actuators(&self) -> impl Iterator<Item = ActuatorId> + '_ {
        self.actuators.keys().copied()
    }

    pub fn abort_switch(&self) -> AbortSwitch {
        self.abort_switch.clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<StartupPhase> {
        self.phase_tx.subscribe()
    }

    /// Leave Idle on the next cycle.
    pub fn begin(&mut self) -> ControlResult<()> {
        if self.phase != StartupPhase::Idle {
            return Err(ControlError::InvalidTransition { from: self.phase, to: StartupPhase::PreCheck });
        }
        self.start_requested = true;
        Ok(())
    }

    pub fn request_abort(&self, reason: impl Into<String>) {
        self.abort_switch.trigger(reason);
    }

    fn period_s(&self) -> f64 {
        self.config.loop_config.period_s()
    }

    fn elapsed_s(&self) -> f64 {
        self.phase_cycles as f64 * self.period_s()
    }

    pub fn run_cycle(&mut self) -> StartupPhase {
        self.cycle += 1;
        self.phase_cycles += 1;

        if let Some(reason) = self.abort_switch.take() {
            if self.phase.accepts_abort() {
                self.enter_abort(reason);
                return self.phase;
            }
            debug!(phase = ?self.phase, %reason, "abort request ignored");
        }

        match self.phase {
            StartupPhase::Idle => {
                if self.start_requested {
                    self.start_requested = false;
                    self.transition(StartupPhase::PreCheck, None);
                }
            }
            StartupPhase::SteadyState | StartupPhase::Shutdown => {}
            StartupPhase::Abort => self.run_abort(),
            gated => self.run_gated(gated),
        }
        self.phase
    }

    fn run_gated(&mut self, phase: StartupPhase) {
        let Some(spec) = self.config.spec(phase).cloned() else {
            self.enter_abort(format!("{phase:?} is not configured"));
            return;
        };
        let elapsed = self.elapsed_s();
        let unmet = self.first_unmet(&spec);

        match (unmet, phase.next()) {
            (None, Some(next)) if elapsed >= spec.min_dwell_s => {
                debug!(?phase, elapsed_s = elapsed, "exit condition satisfied");
                self.transition(next, None);
            }
            _ if elapsed >= spec.timeout_s => {
                let waiting_on = unmet.map_or_else(|| "minimum dwell".to_string(), |c| format!("{} {:?}", c.sensor, c.comparison));
                self.enter_abort(format!("{phase:?} timed out after {elapsed:.1} s waiting on {waiting_on}"));
            }
            _ => {}
        }
    }

    /// First exit condition not currently satisfied; unreadable sensors never satisfy.
    fn first_unmet(&mut self, spec: &PhaseSpec) -> Option<SensorCondition> {
        for condition in &spec.exit_conditions {
            let satisfied = self
                .sensors
                .get_mut(&condition.sensor)
                .and_then(|reader| read_or_log(reader.as_mut()))
                .filter(|sample| sample.valid)
                .is_some_and(|sample| condition.holds(sample.value.magnitude()));
            if !satisfied {
                return Some(*condition);
            }
        }
        None
    }

    fn run_abort(&mut self) {
        if !self.unconfirmed_abort_actions.is_empty() {
            let pending: Vec<ActuatorSetting> = self
                .config
                .abort_actions
                .iter()
                .filter(|s| self.unconfirmed_abort_actions.contains(&s.actuator))
                .copied()
                .collect();
            for setting in pending {
                if self.command(setting, true) {
                    self.unconfirmed_abort_actions.remove(&setting.actuator);
                }
            }
        }

        if self.unconfirmed_abort_actions.is_empty() {
            self.transition(StartupPhase::Shutdown, Some("abort actions confirmed".into()));
        } else if self.elapsed_s() >= self.config.abort_timeout_s {
            error!(unconfirmed = ?self.unconfirmed_abort_actions, "abort timeout elapsed with unconfirmed actions");
            self.transition(StartupPhase::Shutdown, Some("abort timeout elapsed".into()));
        }
    }

    fn enter_abort(&mut self, reason: String) {
        error!(phase = ?self.phase, %reason, "startup abort");
        self.transition(StartupPhase::Abort, Some(reason));
        self.unconfirmed_abort_actions.clear();
        for setting in self.config.abort_actions.clone() {
            if !self.command(setting, true) {
                self.unconfirmed_abort_actions.insert(setting.actuator);
            }
        }
    }

    fn transition(&mut self, to: StartupPhase, reason: Option<String>) {
        let from = self.phase;
        if !from.can_transition(to) {
            warn!(?from, ?to, "refusing illegal phase transition");
            return;
        }
        self.phase = to;
        self.phase_cycles = 0;
        info!(?from, ?to, cycle = self.cycle, reason = reason.as_deref().unwrap_or(""), "phase change");

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(PhaseTransition { from, to, cycle: self.cycle, reason });
        self.phase_tx.send_replace(to);
        self.events.publish(ControlEvent::PhaseChanged { from, to, cycle: self.cycle });

        if let Some(spec) = self.config.spec(to) {
            for setting in spec.entry_actions.clone() {
                self.command(setting, false);
            }
        }
    }

    /// Write one setting; failures are published, never retried here.
    fn command(&mut self, setting: ActuatorSetting, abort: bool) -> bool {
        let Some(actuator) = self.actuators.get_mut(&setting.actuator) else {
            return false;
        };
        let command = ActuatorCommand {
            actuator: setting.actuator,
            target: setting.target,
            max_delta: UNLIMITED_DELTA,
            sequence: self.sequence.next_sequence(),
            emergency: false,
        };
        match actuator.write(command) {
            Ok(_) => true,
            Err(e) => {
                error!(actuator = %setting.actuator, abort, error = %e, "sequencer command failed");
                self.events.publish(ControlEvent::ActuatorFault { actuator: setting.actuator, reason: e.to_string() });
                false
            }
        }
    }
}
