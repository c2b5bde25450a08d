use super::{ChannelId, Reading, Sensor, SensorError, SensorKind, Thermocouple};
use crate::config::FilterConfig;
use crate::filter::TemporalFilter;
use crate::protocol::Corner;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BrakeTemperature {
    pub temperature_c: f32,
}

pub struct BrakeSensor {
    channel: ChannelId,
    thermocouple: Box<dyn Thermocouple>,
    filter: TemporalFilter,
}

impl BrakeSensor {
    pub fn new(corner: Corner, thermocouple: Box<dyn Thermocouple>, filter: FilterConfig) -> Self {
        Self {
            channel: ChannelId::new(corner, SensorKind::Brake),
            thermocouple,
            filter: TemporalFilter::new(filter),
        }
    }
}

impl Sensor for BrakeSensor {
    type Payload = BrakeTemperature;

    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        self.thermocouple.probe()
    }

    fn acquire(&mut self) -> Result<Reading<BrakeTemperature>, SensorError> {
        let raw = self.thermocouple.read_celsius()?;
        // An open thermocouple reads as NaN; report it rather than publish.
        if !raw.is_finite() {
            return Err(SensorError::transient("thermocouple open circuit"));
        }

        let now = Instant::now();
        let temperature_c = self.filter.apply_at(raw, now);
        Ok(Reading::new(BrakeTemperature { temperature_c }, true, now.elapsed()))
    }
}
