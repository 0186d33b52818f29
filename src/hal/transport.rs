//! Frame transport contract.
//!
//! Device drivers implementing [`SensorReader`](super::SensorReader) or
//! [`ActuatorWriter`](super::ActuatorWriter) over a bus speak [`Frame`]s
//! through a [`Transport`]. Control loops never see a transport.

use crate::error::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    ReadRequest,
    Reading,
    Command,
    Ack,
    Nack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub device: u16,
    pub kind: FrameKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(device: u16, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { device, kind, payload }
    }

    pub fn encode(&self) -> ControlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ControlResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub trait Transport: Send {
    fn connect(&mut self) -> ControlResult<()>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn send(&mut self, frame: &Frame) -> ControlResult<()>;
    /// `WouldBlock` until a frame is available.
    fn receive(&mut self) -> nb::Result<Frame, ControlError>;
}
