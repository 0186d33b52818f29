//! # Engine Control Core
//!
//! Deterministic fixed-frequency control loops for a simulated rocket engine:
//! throttle regulation, startup sequencing and safety interlocks.
//!
//! ## Features
//!
//! - **Loop runner**: fixed frequency, cycle budget, timing-violation accounting
//! - **Throttle control**: PID with anti-windup, derivative on measurement, rate limiting
//! - **Startup sequencing**: gated phases with dwell and timeout, abort from anywhere
//! - **Safety monitor**: latched trip, single emergency shutdown, guarded reset
//! - **Hardware boundary**: typed sensor/actuator traits, frame transport, simulated plant
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use enginectl::hal::sim::{EnginePlant, PlantParams};
//! use enginectl::{EngineConfig, EngineController, HardwareSet};
//!
//! # async fn run() -> enginectl::ControlResult<()> {
//! let config = EngineConfig::default();
//! let plant = EnginePlant::new(PlantParams::default());
//! let hardware = HardwareSet::simulated(&plant, &config)?;
//!
//! let mut engine = EngineController::new(config, hardware)?;
//! engine.start().await?;
//! engine.begin_startup()?;
//! // ... step the plant, watch engine.phase() ...
//! let report = engine.shutdown().await?;
//! println!("final phase: {:?}", report.phase);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`rt_loop`] - Periodic loop runner and timing statistics
//! - [`throttle`] - Thrust controller
//! - [`sequencer`] - Startup state machine
//! - [`safety`] - Independent limit monitor
//! - [`engine`] - Composition, ownership validation and handoff
//! - [`hal`] - Sensor/actuator contracts, transport, simulation

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hal;
pub mod registry;
pub mod rt_loop;
pub mod safety;
pub mod sequencer;
pub mod throttle;

// Re-export main public types for convenience
pub use config::EngineConfig;
pub use engine::{EngineController, HardwareSet};
pub use error::{ControlError, ControlResult};
pub use events::{ControlEvent, EventBus};
pub use rt_loop::{LoopStatistics, RtLoop};
pub use safety::{MonitorState, SafetyLimit, SafetyMonitor, Severity};
pub use sequencer::{StartupPhase, StartupSequencer};
pub use throttle::{ControlMode, ThrottleController};

/// Lock a shared controller, ignoring poisoning left by a panicked cycle.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
