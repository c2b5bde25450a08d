use super::{ChannelId, Reading, Sensor, SensorError, SensorKind, ThermalCamera};
use crate::config::{FilterConfig, ZoneConfig};
use crate::filter::TemporalFilter;
use crate::protocol::Corner;
use crate::zone::{RawThermalFrame, ZoneProcessor, ZoneResult};
use std::time::{Duration, Instant};

/// Published payload of a thermal channel: zone analysis with the three band
/// medians smoothed by per-band temporal filters.
pub type TyreThermal = ZoneResult;

pub struct ThermalSensor {
    channel: ChannelId,
    camera: Box<dyn ThermalCamera>,
    processor: ZoneProcessor,
    frame: RawThermalFrame,
    filters: [TemporalFilter; 3],
    budget: Duration,
}

impl ThermalSensor {
    pub fn new(corner: Corner, camera: Box<dyn ThermalCamera>, zone: ZoneConfig, filter: FilterConfig) -> Self {
        Self {
            channel: ChannelId::new(corner, SensorKind::Thermal),
            camera,
            processor: ZoneProcessor::new(zone),
            frame: RawThermalFrame::default(),
            filters: [
                TemporalFilter::new(filter),
                TemporalFilter::new(filter),
                TemporalFilter::new(filter),
            ],
            budget: Duration::from_micros(u64::from(zone.processing_budget_us)),
        }
    }

    pub fn processor(&self) -> &ZoneProcessor {
        &self.processor
    }

}

fn smooth(filters: &mut [TemporalFilter; 3], result: &mut ZoneResult, now: Instant) {
    let [left, centre, right] = filters;
    result.left_median = left.apply_at(result.left_median, now);
    result.centre_median = centre.apply_at(result.centre_median, now);
    result.right_median = right.apply_at(result.right_median, now);
    result.lateral_gradient = result.right_median - result.left_median;
}

impl Sensor for ThermalSensor {
    type Payload = TyreThermal;

    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        self.camera.probe()
    }

    fn acquire(&mut self) -> Result<Reading<TyreThermal>, SensorError> {
        self.camera.read_frame(&mut self.frame)?;

        // Edge and filter state only advance for frames that make the budget.
        let started = Instant::now();
        let (mut result, next_edges) = self.processor.analyse(&self.frame, self.processor.edge_state());
        let mut filters = self.filters.clone();
        // Medians of a frame without a tyre are not temperatures of anything;
        // keep them out of the filters so they cannot drag the display.
        if result.detected {
            smooth(&mut filters, &mut result, started);
        }

        let elapsed = started.elapsed();
        if elapsed > self.budget {
            return Err(SensorError::DeadlineExceeded {
                elapsed_us: elapsed.as_micros() as u64,
                budget_us: self.budget.as_micros() as u64,
            });
        }

        self.processor.commit(next_edges);
        self.filters = filters;
        Ok(Reading::new(result, result.detected, elapsed))
    }
}
