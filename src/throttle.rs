//! Thrust regulation.
//!
//! Closed loop: PID on the thrust error with derivative-on-measurement and
//! conditional integration (anti-windup). Open loop: a time-indexed throttle
//! schedule. Either way the output is clamped to the valve range and then
//! rate limited against the previous command before it leaves the controller.

use crate::config::{PidGains, SchedulePoint, ThrottleConfig};
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, EventBus};
use crate::hal::{read_or_log, ActuatorCommand, ActuatorWriter, Freshness, LastKnownGood, SensorReader, SensorSample, SequenceCounter};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    OpenLoop,
    ClosedLoop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidTerms {
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub output: f64,
    pub saturated: bool,
}

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    output_min: f64,
    output_max: f64,
    integral: f64,
    prev_measurement: Option<f64>,
    filtered_rate: f64,
}

impl PidController {
    pub fn new(gains: PidGains, output_min: f64, output_max: f64) -> Self {
        Self { gains, output_min, output_max, integral: 0.0, prev_measurement: None, filtered_rate: 0.0 }
    }

    /// Bumpless transfer: continue from `output` at the current `measurement`.
    pub fn seed(&mut self, output: f64, measurement: Option<f64>) {
        self.integral = output.clamp(self.output_min, self.output_max);
        self.prev_measurement = measurement;
        self.filtered_rate = 0.0;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn update(&mut self, setpoint: f64, measurement: f64, dt_s: f64) -> PidTerms {
        let g = self.gains;
        let error = setpoint - measurement;

        // Differentiate the measurement, not the error, so setpoint steps don't kick.
        let rate = match self.prev_measurement {
            Some(prev) if dt_s > 0.0 => (measurement - prev) / dt_s,
            _ => 0.0,
        };
        self.prev_measurement = Some(measurement);
        self.filtered_rate += g.derivative_filter * (rate - self.filtered_rate);

        let proportional = g.kp * error;
        let derivative = -g.kd * self.filtered_rate;

        let candidate = self.integral + g.ki * error * dt_s;
        let unclamped = proportional + candidate + derivative;
        // Integrate only up to the point where the output saturates.
        self.integral = if unclamped > self.output_max && error > 0.0 {
            candidate.min((self.output_max - proportional - derivative).max(self.integral))
        } else if unclamped < self.output_min && error < 0.0 {
            candidate.max((self.output_min - proportional - derivative).min(self.integral))
        } else {
            candidate
        }
        .clamp(self.output_min, self.output_max);

        let raw = proportional + self.integral + derivative;
        let output = raw.clamp(self.output_min, self.output_max);
        PidTerms { proportional, integral: self.integral, derivative, output, saturated: output != raw }
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_measurement = None;
        self.filtered_rate = 0.0;
    }
}

/// Bounds the change between consecutive commands.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_delta: f64,
    last: f64,
}

impl RateLimiter {
    pub fn new(max_delta: f64, initial: f64) -> Self {
        Self { max_delta: max_delta.abs(), last: initial }
    }

    /// Value to command this cycle on the way to `target`; does not commit it.
    pub fn limit(&self, target: f64) -> f64 {
        target.clamp(self.last - self.max_delta, self.last + self.max_delta)
    }

    pub fn commit(&mut self, value: f64) {
        self.last = value;
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

#[derive(Debug, Clone)]
pub struct OpenLoopSchedule {
    points: Vec<SchedulePoint>,
}

impl OpenLoopSchedule {
    pub fn new(points: Vec<SchedulePoint>) -> Self {
        Self { points }
    }

    /// Piecewise-linear output at `t_s`, held flat beyond either end.
    pub fn output_at(&self, t_s: f64) -> Option<f64> {
        let first = self.points.first()?;
        if t_s <= first.at_s {
            return Some(first.output);
        }
        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if t_s <= b.at_s {
                let span = b.at_s - a.at_s;
                if span <= 0.0 {
                    return Some(b.output);
                }
                return Some(a.output + (b.output - a.output) * (t_s - a.at_s) / span);
            }
        }
        self.points.last().map(|p| p.output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThrottleStatus {
    pub mode: ControlMode,
    pub setpoint_n: f64,
    pub measured_n: Option<f64>,
    pub last_output: f64,
    pub frozen: bool,
    pub cycle: u64,
}

pub struct ThrottleController {
    config: ThrottleConfig,
    sensor: Box<dyn SensorReader>,
    actuator: Box<dyn ActuatorWriter>,
    events: EventBus,
    pid: PidController,
    limiter: RateLimiter,
    schedule: OpenLoopSchedule,
    feedback: LastKnownGood<f64>,
    mode: ControlMode,
    setpoint_n: f64,
    pending_setpoint: Option<f64>,
    open_loop_cycles: u64,
    frozen: bool,
    sequence: SequenceCounter,
    cycle: u64,
    status_tx: watch::Sender<ThrottleStatus>,
}

impl ThrottleController {
    pub fn new(
        config: ThrottleConfig,
        sensor: Box<dyn SensorReader>,
        actuator: Box<dyn ActuatorWriter>,
        events: EventBus,
    ) -> ControlResult<Self> {
        config.validate()?;
        if sensor.id() != config.thrust_sensor || actuator.id() != config.throttle_actuator {
            return Err(ControlError::InvalidConfig(format!(
                "throttle wired to {}/{} but configured for {}/{}",
                sensor.id(),
                actuator.id(),
                config.thrust_sensor,
                config.throttle_actuator
            )));
        }
        let status = ThrottleStatus {
            mode: ControlMode::OpenLoop,
            setpoint_n: 0.0,
            measured_n: None,
            last_output: config.output_min,
            frozen: false,
            cycle: 0,
        };
        let (status_tx, _) = watch::channel(status);
        Ok(Self {
            pid: PidController::new(config.gains, config.output_min, config.output_max),
            limiter: RateLimiter::new(config.max_delta_per_cycle, config.output_min),
            schedule: OpenLoopSchedule::new(config.open_loop_schedule.clone()),
            feedback: LastKnownGood::new(config.feedback_stale_limit),
            config,
            sensor,
            actuator,
            events,
            mode: ControlMode::OpenLoop,
            setpoint_n: 0.0,
            pending_setpoint: None,
            open_loop_cycles: 0,
            frozen: false,
            sequence: SequenceCounter::new(),
            cycle: 0,
            status_tx,
        })
    }

    /// New setpoint, applied at the start of the next cycle.
    pub fn set_target(&mut self, thrust_n: f64) -> ControlResult<()> {
        validate_setpoint(thrust_n, self.config.max_thrust_n)?;
        self.pending_setpoint = Some(thrust_n);
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ControlMode) {
        if mode == self.mode {
            return;
        }
        match mode {
            ControlMode::OpenLoop => {
                self.open_loop_cycles = 0;
                self.pid.reset();
            }
            ControlMode::ClosedLoop => {
                let measured = match self.feedback.stale_cycles() {
                    0 => self.status_tx.borrow().measured_n,
                    _ => None,
                };
                self.pid.seed(self.limiter.last(), measured);
            }
        }
        self.frozen = false;
        self.mode = mode;
        info!(?mode, output = self.limiter.last(), "throttle mode changed");
        self.events.publish(ControlEvent::ModeChanged { mode });
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn last_output(&self) -> f64 {
        self.limiter.last()
    }

    pub fn max_thrust_n(&self) -> f64 {
        self.config.max_thrust_n
    }

    pub fn status(&self) -> ThrottleStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ThrottleStatus> {
        self.status_tx.subscribe()
    }

    /// One read-compute-write cycle. Returns the command written, `None` when
    /// the output is frozen, or the escalation raised this cycle.
    pub fn run_cycle(&mut self) -> ControlResult<Option<ActuatorCommand>> {
        self.cycle += 1;
        if let Some(setpoint) = self.pending_setpoint.take() {
            debug!(setpoint, "throttle setpoint applied");
            self.setpoint_n = setpoint;
        }

        let sample = read_or_log(self.sensor.as_mut()).map(|s| SensorSample {
            value: s.value.magnitude(),
            timestamp_us: s.timestamp_us,
            valid: s.valid,
        });
        let freshness = self.feedback.observe(sample);
        let measured = freshness.usable();

        let target = match self.mode {
            ControlMode::OpenLoop => {
                let t_s = self.open_loop_cycles as f64 * self.config.loop_config.period_s();
                self.open_loop_cycles += 1;
                self.schedule.output_at(t_s).unwrap_or(self.limiter.last())
            }
            ControlMode::ClosedLoop => match self.closed_loop_target(freshness) {
                Ok(target) => target,
                Err(e) => {
                    self.publish_status(measured);
                    return Err(e);
                }
            },
        };

        if self.frozen {
            self.publish_status(measured);
            return Ok(None);
        }

        let clamped = target.clamp(self.config.output_min, self.config.output_max);
        let limited = self.limiter.limit(clamped);
        let command = ActuatorCommand {
            actuator: self.config.throttle_actuator,
            target: limited,
            max_delta: self.config.max_delta_per_cycle,
            sequence: self.sequence.next_sequence(),
            emergency: false,
        };

        // Write failures are escalated, never retried here.
        let result = self.actuator.write(command);
        self.publish_status(measured);
        match result {
            Ok(_) => {
                self.limiter.commit(limited);
                Ok(Some(command))
            }
            Err(e) => {
                error!(actuator = %command.actuator, error = %e, "throttle write failed");
                self.events.publish(ControlEvent::ActuatorFault { actuator: command.actuator, reason: e.to_string() });
                Err(e)
            }
        }
    }

    fn closed_loop_target(&mut self, freshness: Freshness<f64>) -> ControlResult<f64> {
        let sensor = self.config.thrust_sensor;
        match freshness {
            Freshness::Lost { cycles } => {
                if self.frozen {
                    return Ok(self.limiter.last());
                }
                self.frozen = true;
                error!(%sensor, stale_cycles = cycles, output = self.limiter.last(), "thrust feedback lost, output frozen");
                self.events.publish(ControlEvent::FeedbackLost { sensor, stale_cycles: cycles });
                Err(ControlError::FeedbackLost { sensor, stale_cycles: cycles })
            }
            Freshness::Fresh(measured) | Freshness::Stale { value: measured, .. } => {
                if let Freshness::Stale { cycles, .. } = freshness {
                    warn!(%sensor, stale_cycles = cycles, "using last known good thrust");
                }
                if self.frozen {
                    if !matches!(freshness, Freshness::Fresh(_)) {
                        return Ok(self.limiter.last());
                    }
                    self.frozen = false;
                    self.pid.seed(self.limiter.last(), Some(measured));
                    info!(%sensor, "thrust feedback restored");
                    self.events.publish(ControlEvent::FeedbackRestored { sensor });
                }
                let terms = self.pid.update(self.setpoint_n, measured, self.config.loop_config.period_s());
                if terms.saturated {
                    debug!(output = terms.output, integral = terms.integral, "throttle output saturated");
                }
                Ok(terms.output)
            }
        }
    }

    fn publish_status(&self, measured_n: Option<f64>) {
        self.status_tx.send_replace(ThrottleStatus {
            mode: self.mode,
            setpoint_n: self.setpoint_n,
            measured_n,
            last_output: self.limiter.last(),
            frozen: self.frozen,
            cycle: self.cycle,
        });
    }
}

pub fn validate_setpoint(thrust_n: f64, max_thrust_n: f64) -> ControlResult<()> {
    if thrust_n.is_finite() && (0.0..=max_thrust_n).contains(&thrust_n) {
        Ok(())
    } else {
        Err(ControlError::SetpointOutOfRange { requested: thrust_n, max: max_thrust_n })
    }
}
