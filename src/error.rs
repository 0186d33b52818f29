use crate::hal::{ActuatorId, SensorId};
use crate::sequencer::StartupPhase;
use thiserror::Error;

pub type ControlResult<T> = Result<T, ControlError>;

/// Every failure the control core can surface to an owning process.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("sensor {sensor} fault: {reason}")]
    SensorFault { sensor: SensorId, reason: String },

    #[error("actuator {actuator} fault: {reason}")]
    ActuatorFault { actuator: ActuatorId, reason: String },

    #[error("loop '{loop_name}' exceeded its cycle budget {consecutive} times in a row")]
    PersistentTimingFault { loop_name: &'static str, consecutive: u32 },

    #[error("feedback from sensor {sensor} lost after {stale_cycles} stale cycles")]
    FeedbackLost { sensor: SensorId, stale_cycles: u32 },

    #[error("setpoint {requested} N outside [0, {max}] N")]
    SetpointOutOfRange { requested: f64, max: f64 },

    #[error("phase transition {from:?} -> {to:?} is not allowed")]
    InvalidTransition { from: StartupPhase, to: StartupPhase },

    #[error("reset denied: {reason}")]
    ResetDenied { reason: String },

    #[error("safety monitor is tripped")]
    MonitorTripped,

    #[error("loop '{0}' is already running")]
    AlreadyRunning(&'static str),

    #[error("loop '{0}' is not running")]
    NotRunning(&'static str),

    #[error("loop '{0}' thread panicked")]
    LoopPanicked(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("actuator {actuator} is owned by {owner}, not {requester}")]
    OwnershipViolation {
        actuator: ActuatorId,
        owner: String,
        requester: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlError {
    /// Faults that the taxonomy treats as transient hardware hiccups.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SensorFault { .. } | Self::ActuatorFault { .. } | Self::Transport(_))
    }
}
