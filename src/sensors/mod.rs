pub mod brake;
pub mod corner;
pub mod pressure;
pub mod thermal;

pub use brake::{BrakeSensor, BrakeTemperature};
pub use corner::{CornerBusSensor, CornerReport};
pub use pressure::{PressureSample, PressureSensor, TyrePressure};
pub use thermal::{ThermalSensor, TyreThermal};

use crate::protocol::{BusFrame, Corner, DecodeError};
use crate::zone::RawThermalFrame;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Thermal,
    Pressure,
    Brake,
    CornerNode,
}

impl SensorKind {
    pub fn label(self) -> &'static str {
        match self {
            SensorKind::Thermal => "thermal",
            SensorKind::Pressure => "pressure",
            SensorKind::Brake => "brake",
            SensorKind::CornerNode => "node",
        }
    }
}

/// Identifies one acquisition channel: a sensor kind at a corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub corner: Corner,
    pub kind: SensorKind,
}

impl ChannelId {
    pub fn new(corner: Corner, kind: SensorKind) -> Self {
        Self { corner, kind }
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.corner, self.kind.label())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// One read failed; retry with backoff.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// Device is not there (unplugged, not answering its probe).
    #[error("hardware absent: {0}")]
    Absent(String),

    /// Setup failed in a way retrying cannot fix.
    #[error("fatal hardware error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Processing took longer than the per-frame budget; the frame is dropped.
    #[error("processing deadline exceeded: {elapsed_us}us > {budget_us}us")]
    DeadlineExceeded { elapsed_us: u64, budget_us: u64 },
}

impl SensorError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn absent(reason: impl Into<String>) -> Self {
        Self::Absent(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }
}

/// One processed acquisition, ready to be published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading<T> {
    pub payload: T,
    pub valid: bool,
    /// Time spent in decode/analysis/filtering, excluding device I/O.
    pub processing: Duration,
}

impl<T> Reading<T> {
    pub fn new(payload: T, valid: bool, processing: Duration) -> Self {
        Self { payload, valid, processing }
    }
}

/// Frames a sensor discarded since it was last asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DroppedFrames {
    pub malformed: u32,
    pub unknown: u32,
}

impl DroppedFrames {
    pub fn is_empty(&self) -> bool {
        self.malformed == 0 && self.unknown == 0
    }

    pub fn record(&mut self, error: &DecodeError) {
        match error {
            DecodeError::UnknownIdentifier(_) => self.unknown = self.unknown.saturating_add(1),
            DecodeError::MalformedPayload { .. } => self.malformed = self.malformed.saturating_add(1),
        }
    }
}

/// A complete acquisition pipeline for one physical sensor: device access
/// plus whatever decoding, analysis and filtering its readings need.
pub trait Sensor: Send + 'static {
    type Payload: Copy + Send + Sync + 'static;

    fn channel(&self) -> ChannelId;

    /// Check the device is present and configured.
    fn probe(&mut self) -> Result<(), SensorError>;

    /// Read, process and filter one sample.
    fn acquire(&mut self) -> Result<Reading<Self::Payload>, SensorError>;

    /// Frames dropped during acquisition since the previous call. Sensors
    /// that read many frames per poll report their decode drops here.
    fn take_dropped(&mut self) -> DroppedFrames {
        DroppedFrames::default()
    }
}

// Hardware boundary. Register-level access lives behind these traits.

pub trait ThermalCamera: Send {
    fn probe(&mut self) -> Result<(), SensorError>;
    fn read_frame(&mut self, frame: &mut RawThermalFrame) -> Result<(), SensorError>;
}

pub trait PressureTransceiver: Send {
    fn probe(&mut self) -> Result<(), SensorError>;
    fn read(&mut self) -> Result<PressureSample, SensorError>;
}

pub trait Thermocouple: Send {
    fn probe(&mut self) -> Result<(), SensorError>;
    fn read_celsius(&mut self) -> Result<f32, SensorError>;
}

pub trait BusDevice: Send {
    fn probe(&mut self) -> Result<(), SensorError>;
    /// Next pending frame, or `None` when the receive queue is empty.
    fn receive(&mut self) -> Result<Option<BusFrame>, SensorError>;
    fn transmit(&mut self, frame: &BusFrame) -> Result<(), SensorError>;
}
