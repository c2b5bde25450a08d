use super::{ChannelId, PressureTransceiver, Reading, Sensor, SensorError, SensorKind};
use crate::config::FilterConfig;
use crate::filter::TemporalFilter;
use crate::protocol::Corner;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Raw transceiver report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureSample {
    pub pressure_kpa: f32,
    pub temperature_c: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TyrePressure {
    pub pressure_kpa: f32,
    pub temperature_c: f32,
}

pub struct PressureSensor {
    channel: ChannelId,
    transceiver: Box<dyn PressureTransceiver>,
    pressure_filter: TemporalFilter,
    temperature_filter: TemporalFilter,
}

impl PressureSensor {
    pub fn new(
        corner: Corner,
        transceiver: Box<dyn PressureTransceiver>,
        pressure: FilterConfig,
        temperature: FilterConfig,
    ) -> Self {
        Self {
            channel: ChannelId::new(corner, SensorKind::Pressure),
            transceiver,
            pressure_filter: TemporalFilter::new(pressure),
            temperature_filter: TemporalFilter::new(temperature),
        }
    }
}

impl Sensor for PressureSensor {
    type Payload = TyrePressure;

    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        self.transceiver.probe()
    }

    fn acquire(&mut self) -> Result<Reading<TyrePressure>, SensorError> {
        let sample = self.transceiver.read()?;

        let now = Instant::now();
        let payload = TyrePressure {
            pressure_kpa: self.pressure_filter.apply_at(sample.pressure_kpa, now),
            temperature_c: self.temperature_filter.apply_at(sample.temperature_c, now),
        };
        let valid = payload.pressure_kpa.is_finite() && payload.temperature_c.is_finite();

        Ok(Reading::new(payload, valid, now.elapsed()))
    }
}
