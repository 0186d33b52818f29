//! Engine controller: wires the three loops to their hardware, validates
//! actuator ownership, and supervises the sequencer to throttle handoff.

use crate::config::EngineConfig;
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, EventBus};
use crate::hal::sim::{EnginePlant, PlantChannel, PlantInput};
use crate::hal::{ActuatorId, ActuatorWriter, SensorId, SensorReader};
use crate::lock;
use crate::registry::{ActuatorRegistry, LoopId};
use crate::rt_loop::{CycleContext, LoopStatistics, RtLoop};
use crate::safety::{MonitorState, SafetyMonitor, SafetyStatus};
use crate::sequencer::{AbortSwitch, StartupPhase, StartupSequencer};
use crate::throttle::{ControlMode, ThrottleController, ThrottleStatus};
use heapless::HistoryBuffer;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_HISTORY: usize = 64;

type SharedLoop = Arc<AsyncMutex<RtLoop>>;
type EventHistory = Arc<Mutex<HistoryBuffer<ControlEvent, EVENT_HISTORY>>>;

/// Per-loop device handles. Sensors may be shared by several loops through
/// separate readers; each actuator appears exactly once.
pub struct HardwareSet {
    pub throttle_sensor: Box<dyn SensorReader>,
    pub throttle_actuator: Box<dyn ActuatorWriter>,
    pub sequencer_sensors: Vec<Box<dyn SensorReader>>,
    pub sequencer_actuators: Vec<Box<dyn ActuatorWriter>>,
    pub monitor_sensors: Vec<Box<dyn SensorReader>>,
    pub shutdown_actuators: Vec<Box<dyn ActuatorWriter>>,
}

impl HardwareSet {
    /// Wire every device `config` refers to onto the simulated plant.
    pub fn simulated(plant: &EnginePlant, config: &EngineConfig) -> ControlResult<Self> {
        let registry = ActuatorRegistry::from_config(config)?;

        let sensor = |id: SensorId| -> ControlResult<Box<dyn SensorReader>> {
            let channel = PlantChannel::for_sensor(id)
                .ok_or_else(|| ControlError::InvalidConfig(format!("no simulated channel for {id}")))?;
            Ok(Box::new(plant.sensor(id, channel)))
        };
        let actuator = |id: ActuatorId| -> ControlResult<Box<dyn ActuatorWriter>> {
            let input = PlantInput::for_actuator(id)
                .ok_or_else(|| ControlError::InvalidConfig(format!("no simulated input for {id}")))?;
            Ok(Box::new(plant.actuator(id, input)))
        };

        let sequencer_sensors: BTreeSet<_> = config
            .sequencer
            .phases
            .iter()
            .flat_map(|p| p.exit_conditions.iter().map(|c| c.sensor))
            .collect();
        let monitor_sensors: BTreeSet<_> = config.monitor.limits.iter().map(|l| l.sensor).collect();

        Ok(Self {
            throttle_sensor: sensor(config.throttle.thrust_sensor)?,
            throttle_actuator: actuator(config.throttle.throttle_actuator)?,
            sequencer_sensors: sequencer_sensors.into_iter().map(sensor).collect::<ControlResult<_>>()?,
            sequencer_actuators: registry.owned_by(LoopId::Sequencer).map(actuator).collect::<ControlResult<_>>()?,
            monitor_sensors: monitor_sensors.into_iter().map(sensor).collect::<ControlResult<_>>()?,
            shutdown_actuators: registry
                .owned_by(LoopId::SafetyMonitor)
                .map(actuator)
                .collect::<ControlResult<_>>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStatistics {
    pub throttle: LoopStatistics,
    pub sequencer: LoopStatistics,
    pub monitor: LoopStatistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub phase: StartupPhase,
    pub monitor_state: MonitorState,
    pub throttle_mode: ControlMode,
    pub last_throttle_output: f64,
    pub statistics: EngineStatistics,
    pub events: Vec<ControlEvent>,
}

/// Shared pieces the supervisor task needs.
#[derive(Clone)]
struct LoopHandles {
    throttle: Arc<Mutex<ThrottleController>>,
    sequencer: Arc<Mutex<StartupSequencer>>,
    monitor: Arc<Mutex<SafetyMonitor>>,
    throttle_loop: SharedLoop,
    sequencer_loop: SharedLoop,
    monitor_loop: SharedLoop,
}

impl LoopHandles {
    fn start_throttle(&self, rt_loop: &mut RtLoop, config: &EngineConfig) -> ControlResult<()> {
        let throttle = Arc::clone(&self.throttle);
        rt_loop.start(config.throttle.loop_config, move |ctx: &CycleContext| {
            if let Err(e) = lock(&throttle).run_cycle() {
                debug!(cycle = ctx.index, error = %e, "throttle cycle escalated");
            }
        })
    }

    fn start_sequencer(&self, rt_loop: &mut RtLoop, config: &EngineConfig) -> ControlResult<()> {
        let sequencer = Arc::clone(&self.sequencer);
        rt_loop.start(config.sequencer.loop_config, move |_: &CycleContext| {
            lock(&sequencer).run_cycle();
        })
    }

    fn start_monitor(&self, rt_loop: &mut RtLoop, config: &EngineConfig) -> ControlResult<()> {
        let monitor = Arc::clone(&self.monitor);
        rt_loop.start(config.monitor.loop_config, move |_: &CycleContext| {
            lock(&monitor).run_cycle();
        })
    }
}

async fn stop_if_running(rt_loop: &SharedLoop) {
    let mut rt_loop = rt_loop.lock().await;
    if !rt_loop.is_running() {
        return;
    }
    if let Err(e) = rt_loop.stop().await {
        error!(loop_name = rt_loop.name(), error = %e, "loop did not stop cleanly");
    }
}

/// Reacts to published events: handoff, trip containment, escalation policy.
struct Supervisor {
    config: EngineConfig,
    handles: LoopHandles,
    events: EventBus,
    abort_switch: AbortSwitch,
    history: EventHistory,
}

impl Supervisor {
    async fn run(self, mut rx: broadcast::Receiver<ControlEvent>, mut stop_rx: oneshot::Receiver<()>) {
        loop {
            let event = tokio::select! {
                _ = &mut stop_rx => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "supervisor lagged behind the event bus, resyncing");
                        self.reconcile().await;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            lock(&self.history).write(event.clone());
            self.handle(event).await;
        }
        debug!("supervisor stopped");
    }

    async fn handle(&self, event: ControlEvent) {
        match event {
            ControlEvent::PhaseChanged { to: StartupPhase::RampUp, .. } => self.hand_to_open_loop().await,
            ControlEvent::PhaseChanged { to: StartupPhase::SteadyState, .. } => self.hand_to_closed_loop(),
            ControlEvent::PhaseChanged { to: StartupPhase::Abort, .. } => {
                info!("abort in progress, stopping throttle loop");
                stop_if_running(&self.handles.throttle_loop).await;
            }
            ControlEvent::PhaseChanged { to: StartupPhase::Shutdown, .. } => {
                stop_if_running(&self.handles.sequencer_loop).await;
            }
            ControlEvent::Tripped { ref reason, .. } => {
                error!(%reason, "safety trip, halting sequencer and throttle");
                self.contain_trip().await;
            }
            ref escalation if escalation.is_escalation() && self.config.abort_on_escalation => {
                let reason = format!("escalated: {escalation:?}");
                if lock(&self.handles.sequencer).phase().accepts_abort() {
                    warn!(%reason, "converting escalation into abort");
                    self.abort_switch.trigger(reason.clone());
                    self.events.publish(ControlEvent::AbortRequested { reason });
                }
            }
            _ => {}
        }
    }

    async fn contain_trip(&self) {
        stop_if_running(&self.handles.sequencer_loop).await;
        stop_if_running(&self.handles.throttle_loop).await;
    }

    /// Bring the loops in line with the latest monitor state and phase after
    /// events were dropped.
    async fn reconcile(&self) {
        if lock(&self.handles.monitor).is_tripped() {
            error!("safety monitor tripped while events were missed");
            self.contain_trip().await;
            return;
        }
        let phase = lock(&self.handles.sequencer).phase();
        debug!(?phase, "reconciling loops with phase");
        match phase {
            StartupPhase::RampUp => self.hand_to_open_loop().await,
            StartupPhase::SteadyState => {
                self.ensure_throttle_running().await;
                if lock(&self.handles.throttle).mode() != ControlMode::ClosedLoop {
                    self.hand_to_closed_loop();
                }
            }
            StartupPhase::Abort => stop_if_running(&self.handles.throttle_loop).await,
            StartupPhase::Shutdown => {
                stop_if_running(&self.handles.throttle_loop).await;
                stop_if_running(&self.handles.sequencer_loop).await;
            }
            _ => {}
        }
    }

    async fn hand_to_open_loop(&self) {
        {
            let mut throttle = lock(&self.handles.throttle);
            throttle.set_mode(ControlMode::OpenLoop);
            if let Err(e) = throttle.set_target(self.config.steady_state_thrust_n) {
                error!(error = %e, "steady-state setpoint rejected");
            }
        }
        self.ensure_throttle_running().await;
    }

    async fn ensure_throttle_running(&self) {
        let mut rt_loop = self.handles.throttle_loop.lock().await;
        if rt_loop.is_running() {
            return;
        }
        match self.handles.start_throttle(&mut rt_loop, &self.config) {
            Ok(()) => info!(mode = ?lock(&self.handles.throttle).mode(), "throttle loop started"),
            Err(e) => {
                error!(error = %e, "throttle loop failed to start");
                self.abort_switch.trigger(format!("throttle loop failed to start: {e}"));
            }
        }
    }

    fn hand_to_closed_loop(&self) {
        let mut throttle = lock(&self.handles.throttle);
        if let Err(e) = throttle.set_target(self.config.steady_state_thrust_n) {
            error!(error = %e, "steady-state setpoint rejected");
            return;
        }
        throttle.set_mode(ControlMode::ClosedLoop);
        info!(setpoint_n = self.config.steady_state_thrust_n, "throttle handed to closed loop");
    }
}

pub struct EngineController {
    config: EngineConfig,
    registry: ActuatorRegistry,
    events: EventBus,
    handles: LoopHandles,
    abort_switch: AbortSwitch,
    history: EventHistory,
    phase_rx: watch::Receiver<StartupPhase>,
    throttle_rx: watch::Receiver<ThrottleStatus>,
    safety_rx: watch::Receiver<SafetyStatus>,
    supervisor: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl EngineController {
    pub fn new(config: EngineConfig, hardware: HardwareSet) -> ControlResult<Self> {
        config.validate()?;
        let registry = ActuatorRegistry::from_config(&config)?;
        registry.check_wiring(LoopId::Throttle, [hardware.throttle_actuator.id()])?;
        registry.check_wiring(LoopId::Sequencer, hardware.sequencer_actuators.iter().map(|a| a.id()))?;
        registry.check_wiring(LoopId::SafetyMonitor, hardware.shutdown_actuators.iter().map(|a| a.id()))?;

        let events = EventBus::default();
        let throttle = ThrottleController::new(
            config.throttle.clone(),
            hardware.throttle_sensor,
            hardware.throttle_actuator,
            events.clone(),
        )?;
        let sequencer = StartupSequencer::new(
            config.sequencer.clone(),
            hardware.sequencer_sensors,
            hardware.sequencer_actuators,
            events.clone(),
        )?;
        let mut monitor = SafetyMonitor::new(
            config.monitor.clone(),
            hardware.monitor_sensors,
            hardware.shutdown_actuators,
            events.clone(),
        )?;

        let phase_rx = sequencer.subscribe_phase();
        let throttle_rx = throttle.subscribe_status();
        let safety_rx = monitor.subscribe_status();
        monitor.observe(phase_rx.clone(), throttle_rx.clone());
        let abort_switch = sequencer.abort_switch();

        let handles = LoopHandles {
            throttle: Arc::new(Mutex::new(throttle)),
            sequencer: Arc::new(Mutex::new(sequencer)),
            monitor: Arc::new(Mutex::new(monitor)),
            throttle_loop: Arc::new(AsyncMutex::new(RtLoop::new(LoopId::Throttle.name(), events.clone()))),
            sequencer_loop: Arc::new(AsyncMutex::new(RtLoop::new(LoopId::Sequencer.name(), events.clone()))),
            monitor_loop: Arc::new(AsyncMutex::new(RtLoop::new(LoopId::SafetyMonitor.name(), events.clone()))),
        };

        Ok(Self {
            config,
            registry,
            events,
            handles,
            abort_switch,
            history: Arc::new(Mutex::new(HistoryBuffer::new())),
            phase_rx,
            throttle_rx,
            safety_rx,
            supervisor: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActuatorRegistry {
        &self.registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Start the supervisor, then the safety monitor, then the sequencer.
    pub async fn start(&mut self) -> ControlResult<()> {
        if self.supervisor.is_some() {
            return Err(ControlError::AlreadyRunning("engine"));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = self.supervisor();
        let rx = self.events.subscribe();
        let handle = tokio::spawn(supervisor.run(rx, stop_rx));
        self.supervisor = Some((stop_tx, handle));

        {
            let mut monitor_loop = self.handles.monitor_loop.lock().await;
            self.handles.start_monitor(&mut monitor_loop, &self.config)?;
        }
        {
            let mut sequencer_loop = self.handles.sequencer_loop.lock().await;
            self.handles.start_sequencer(&mut sequencer_loop, &self.config)?;
        }
        info!("engine controller started");
        Ok(())
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor {
            config: self.config.clone(),
            handles: self.handles.clone(),
            events: self.events.clone(),
            abort_switch: self.abort_switch.clone(),
            history: Arc::clone(&self.history),
        }
    }

    /// Leave Idle.
    ///
    /// Refused with `MonitorTripped` while the monitor is latched. A trip
    /// halts the sequencer in whatever phase it was in, so after a successful
    /// [`reset_safety`](Self::reset_safety) this still fails with
    /// `InvalidTransition`: a new startup needs a new controller.
    pub fn begin_startup(&self) -> ControlResult<()> {
        if lock(&self.handles.monitor).is_tripped() {
            return Err(ControlError::MonitorTripped);
        }
        lock(&self.handles.sequencer).begin()
    }

    pub fn request_abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "abort requested");
        self.abort_switch.trigger(reason.clone());
        self.events.publish(ControlEvent::AbortRequested { reason });
    }

    pub fn set_thrust(&self, thrust_n: f64) -> ControlResult<()> {
        lock(&self.handles.throttle).set_target(thrust_n)
    }

    pub fn reset_safety(&self) -> ControlResult<()> {
        lock(&self.handles.monitor).reset()
    }

    pub fn phase(&self) -> StartupPhase {
        *self.phase_rx.borrow()
    }

    pub fn throttle_status(&self) -> ThrottleStatus {
        *self.throttle_rx.borrow()
    }

    pub fn safety_status(&self) -> SafetyStatus {
        self.safety_rx.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<StartupPhase> {
        self.phase_rx.clone()
    }

    pub fn event_history(&self) -> Vec<ControlEvent> {
        lock(&self.history).oldest_ordered().cloned().collect()
    }

    pub async fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            throttle: self.handles.throttle_loop.lock().await.statistics(),
            sequencer: self.handles.sequencer_loop.lock().await.statistics(),
            monitor: self.handles.monitor_loop.lock().await.statistics(),
        }
    }

    pub async fn is_loop_running(&self, id: LoopId) -> bool {
        let rt_loop = match id {
            LoopId::Throttle => &self.handles.throttle_loop,
            LoopId::Sequencer => &self.handles.sequencer_loop,
            LoopId::SafetyMonitor => &self.handles.monitor_loop,
        };
        rt_loop.lock().await.is_running()
    }

    /// Stop supervision and every loop, the safety monitor last.
    pub async fn shutdown(&mut self) -> ControlResult<EngineReport> {
        let (stop_tx, handle) = self.supervisor.take().ok_or(ControlError::NotRunning("engine"))?;
        let _ = stop_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "supervisor task ended abnormally");
        }

        stop_if_running(&self.handles.sequencer_loop).await;
        stop_if_running(&self.handles.throttle_loop).await;
        stop_if_running(&self.handles.monitor_loop).await;

        let throttle = self.throttle_status();
        let report = EngineReport {
            phase: self.phase(),
            monitor_state: self.safety_status().state,
            throttle_mode: throttle.mode,
            last_throttle_output: throttle.last_output,
            statistics: self.statistics().await,
            events: self.event_history(),
        };
        info!(phase = ?report.phase, monitor = ?report.monitor_state, "engine controller stopped");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::PlantParams;

    fn controller(plant: &EnginePlant) -> EngineController {
        let config = EngineConfig::default();
        let hardware = HardwareSet::simulated(plant, &config).unwrap();
        EngineController::new(config, hardware).unwrap()
    }

    async fn start_loop(engine: &EngineController, id: LoopId) {
        let handles = &engine.handles;
        match id {
            LoopId::Throttle => {
                let mut rt_loop = handles.throttle_loop.lock().await;
                handles.start_throttle(&mut rt_loop, &engine.config).unwrap();
            }
            LoopId::Sequencer => {
                let mut rt_loop = handles.sequencer_loop.lock().await;
                handles.start_sequencer(&mut rt_loop, &engine.config).unwrap();
            }
            LoopId::SafetyMonitor => {
                let mut rt_loop = handles.monitor_loop.lock().await;
                handles.start_monitor(&mut rt_loop, &engine.config).unwrap();
            }
        }
    }

    // No supervisor task runs in these tests, so every event goes unhandled
    // and `reconcile` alone must bring the loops in line.

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_contains_unhandled_trip() {
        let plant = EnginePlant::new(PlantParams::default());
        let engine = controller(&plant);
        start_loop(&engine, LoopId::Sequencer).await;
        start_loop(&engine, LoopId::Throttle).await;

        plant.inject_pressure_offset(150.0);
        assert_eq!(lock(&engine.handles.monitor).run_cycle(), MonitorState::Tripped);
        assert!(engine.is_loop_running(LoopId::Sequencer).await);

        engine.supervisor().reconcile().await;
        assert!(!engine.is_loop_running(LoopId::Sequencer).await);
        assert!(!engine.is_loop_running(LoopId::Throttle).await);
        assert!(matches!(engine.begin_startup(), Err(ControlError::MonitorTripped)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_stops_loops_after_unhandled_shutdown() {
        let plant = EnginePlant::new(PlantParams::default());
        let engine = controller(&plant);
        engine.request_abort("operator");
        {
            let mut sequencer = lock(&engine.handles.sequencer);
            sequencer.run_cycle();
            assert_eq!(sequencer.run_cycle(), StartupPhase::Shutdown);
        }
        start_loop(&engine, LoopId::Sequencer).await;
        start_loop(&engine, LoopId::Throttle).await;

        engine.supervisor().reconcile().await;
        assert!(!engine.is_loop_running(LoopId::Sequencer).await);
        assert!(!engine.is_loop_running(LoopId::Throttle).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_completes_missed_handoff() {
        let plant = EnginePlant::new(PlantParams::default());
        let engine = controller(&plant);
        lock(&engine.handles.sequencer).begin().unwrap();

        // Step plant, throttle and sequencer by hand at 100 Hz / 10 Hz.
        for tick in 0..2_000 {
            plant.step(0.01);
            if lock(&engine.handles.sequencer).phase() == StartupPhase::RampUp {
                let _ = lock(&engine.handles.throttle).run_cycle();
            }
            if tick % 10 == 9 && lock(&engine.handles.sequencer).run_cycle() == StartupPhase::SteadyState {
                break;
            }
        }
        assert_eq!(engine.phase(), StartupPhase::SteadyState);
        assert_eq!(lock(&engine.handles.throttle).mode(), ControlMode::OpenLoop);
        assert!(!engine.is_loop_running(LoopId::Throttle).await);

        engine.supervisor().reconcile().await;
        assert!(engine.is_loop_running(LoopId::Throttle).await);
        assert_eq!(lock(&engine.handles.throttle).mode(), ControlMode::ClosedLoop);
        stop_if_running(&engine.handles.throttle_loop).await;
    }
}
