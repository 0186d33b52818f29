//! Hardware abstraction boundary.
//!
//! The control loops see hardware only through [`SensorReader`] and
//! [`ActuatorWriter`]. Bus drivers speak frames over a
//! [`transport::Transport`]; the [`sim`] devices back the test suite and the
//! simulator binary.

pub mod sim;
pub mod transport;

use crate::error::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActuatorId(pub u16);

impl core::fmt::Display for SensorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl core::fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// Closed set of measurement shapes a sensor may produce.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SensorValue {
    Scalar(f64),
    Vector([f64; 3]),
}

impl SensorValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SensorValue::Scalar(v) => Some(*v),
            SensorValue::Vector(_) => None,
        }
    }

    /// Scalar value, or Euclidean norm for vectors. Limits are checked against this.
    pub fn magnitude(&self) -> f64 {
        match self {
            SensorValue::Scalar(v) => *v,
            SensorValue::Vector([x, y, z]) => (x * x + y * y + z * z).sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample<T = SensorValue> {
    pub value: T,
    pub timestamp_us: u64,
    pub valid: bool,
}

impl<T> SensorSample<T> {
    pub fn valid(value: T, timestamp_us: u64) -> Self {
        Self { value, timestamp_us, valid: true }
    }

    pub fn invalid(value: T, timestamp_us: u64) -> Self {
        Self { value, timestamp_us, valid: false }
    }
}

/// `max_delta` for discrete commands that are not rate limited.
pub const UNLIMITED_DELTA: f64 = f64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub actuator: ActuatorId,
    pub target: f64,
    /// Largest change from the previous command the issuing controller allows.
    pub max_delta: f64,
    pub sequence: u64,
    pub emergency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub actuator: ActuatorId,
    pub sequence: u64,
}

/// Bounded-latency sensor read. An out-of-range value is not a read failure.
pub trait SensorReader: Send {
    fn id(&self) -> SensorId;
    fn read(&mut self) -> ControlResult<SensorSample>;
}

/// Bounded-latency actuator write.
pub trait ActuatorWriter: Send {
    fn id(&self) -> ActuatorId;
    fn write(&mut self, command: ActuatorCommand) -> ControlResult<Ack>;
}

/// Monotonic command numbering, one counter per issuing controller.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next.max(1);
        self.next = sequence + 1;
        sequence
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Freshness<T> {
    Fresh(T),
    /// Last good value, still usable; `cycles` since it was read.
    Stale { value: T, cycles: u32 },
    Lost { cycles: u32 },
}

impl<T: Copy> Freshness<T> {
    pub fn usable(&self) -> Option<T> {
        match self {
            Freshness::Fresh(v) | Freshness::Stale { value: v, .. } => Some(*v),
            Freshness::Lost { .. } => None,
        }
    }
}

/// Last-known-good cache with an explicit staleness counter.
#[derive(Debug, Clone)]
pub struct LastKnownGood<T> {
    value: Option<T>,
    stale_cycles: u32,
    stale_limit: u32,
}

impl<T: Copy> LastKnownGood<T> {
    pub fn new(stale_limit: u32) -> Self {
        Self { value: None, stale_cycles: 0, stale_limit }
    }

    /// Feed one cycle's outcome; `None` means the read itself failed.
    pub fn observe(&mut self, sample: Option<SensorSample<T>>) -> Freshness<T> {
        match sample {
            Some(sample) if sample.valid => {
                self.value = Some(sample.value);
                self.stale_cycles = 0;
                Freshness::Fresh(sample.value)
            }
            _ => {
                self.stale_cycles = self.stale_cycles.saturating_add(1);
                match self.value {
                    Some(value) if self.stale_cycles <= self.stale_limit => {
                        Freshness::Stale { value, cycles: self.stale_cycles }
                    }
                    _ => {
                        self.value = None;
                        Freshness::Lost { cycles: self.stale_cycles }
                    }
                }
            }
        }
    }

    pub fn stale_cycles(&self) -> u32 {
        self.stale_cycles
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.stale_cycles = 0;
    }
}

/// Read once, logging and swallowing a `SensorFault` so the caller can count it.
pub fn read_or_log(reader: &mut dyn SensorReader) -> Option<SensorSample> {
    match reader.read() {
        Ok(sample) => Some(sample),
        Err(ControlError::SensorFault { sensor, reason }) => {
            warn!(%sensor, %reason, "sensor read failed");
            None
        }
        Err(e) => {
            warn!(sensor = %reader.id(), error = %e, "sensor read failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_magnitude() {
        let v = SensorValue::Vector([3.0, 4.0, 0.0]);
        assert!((v.magnitude() - 5.0).abs() < 1e-12);
        assert_eq!(v.as_scalar(), None);
        assert_eq!(SensorValue::Scalar(-2.0).magnitude(), -2.0);
    }

    #[test]
    fn test_sequence_counter_is_monotonic() {
        let mut counter = SequenceCounter::new();
        let a = counter.next_sequence();
        let b = counter.next_sequence();
        assert_eq!(a, 1);
        assert!(b > a);

        let mut defaulted = SequenceCounter::default();
        assert_eq!(defaulted.next_sequence(), 1);
    }

    #[test]
    fn test_last_known_good_goes_stale_then_lost() {
        let mut lkg = LastKnownGood::new(2);
        assert_eq!(lkg.observe(Some(SensorSample::valid(10.0, 0))), Freshness::Fresh(10.0));
        assert_eq!(
            lkg.observe(Some(SensorSample::invalid(99.0, 1))),
            Freshness::Stale { value: 10.0, cycles: 1 }
        );
        assert_eq!(lkg.observe(None), Freshness::Stale { value: 10.0, cycles: 2 });
        assert_eq!(lkg.observe(None), Freshness::Lost { cycles: 3 });
        // Once invalidated the cache stays empty until a fresh sample arrives.
        assert_eq!(lkg.observe(None), Freshness::Lost { cycles: 4 });
        assert_eq!(lkg.observe(Some(SensorSample::valid(11.0, 5))), Freshness::Fresh(11.0));
        assert_eq!(lkg.stale_cycles(), 0);
    }

    #[test]
    fn test_last_known_good_without_history_is_lost() {
        let mut lkg: LastKnownGood<f64> = LastKnownGood::new(5);
        assert_eq!(lkg.observe(None), Freshness::Lost { cycles: 1 });
    }
}
