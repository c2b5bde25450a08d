//! All acquisition channels of the vehicle and the consumer's view of them.
//!
//! The render loop calls [`SnapshotStore::read_cycle`] once per frame. That
//! call only loads the latest snapshot of every channel, so it costs the same
//! whether the hardware behind a channel is healthy, slow or missing.

use crate::config::{Config, ConfigError};
use crate::handler::{HandlerError, HandlerState, HandlerStats, SensorHandler, TimingSink};
use crate::protocol::Corner;
use crate::sensors::{
    BrakeSensor, BrakeTemperature, BusDevice, ChannelId, CornerBusSensor, CornerReport, PressureSensor,
    PressureTransceiver, SensorKind, ThermalCamera, ThermalSensor, Thermocouple, TyrePressure, TyreThermal,
};
use crate::snapshot::Snapshot;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A running or runnable acquisition channel.
#[derive(Debug)]
pub enum SensorChannel {
    Thermal(SensorHandler<ThermalSensor>),
    Pressure(SensorHandler<PressureSensor>),
    Brake(SensorHandler<BrakeSensor>),
    CornerNode(SensorHandler<CornerBusSensor>),
}

macro_rules! each_handler {
    ($channel:expr, $handler:ident => $body:expr) => {
        match $channel {
            SensorChannel::Thermal($handler) => $body,
            SensorChannel::Pressure($handler) => $body,
            SensorChannel::Brake($handler) => $body,
            SensorChannel::CornerNode($handler) => $body,
        }
    };
}

impl SensorChannel {
    pub fn channel(&self) -> ChannelId {
        each_handler!(self, h => h.channel())
    }

    pub fn state(&self) -> HandlerState {
        each_handler!(self, h => h.state())
    }

    pub fn stats(&self) -> HandlerStats {
        each_handler!(self, h => h.stats())
    }

    pub fn start(&mut self) -> Result<(), HandlerError> {
        each_handler!(self, h => h.start())
    }

    pub fn stop(&mut self) -> Result<(), HandlerError> {
        each_handler!(self, h => h.stop())
    }

    pub fn set_timing_sink(&mut self, sink: Option<Arc<dyn TimingSink>>) {
        each_handler!(self, h => h.set_timing_sink(sink))
    }

    /// Copy this channel's latest snapshot into its slot of `view`.
    fn read_into(&self, view: &mut CornerView) {
        match self {
            SensorChannel::Thermal(h) => view.thermal = h.get_latest(),
            SensorChannel::Pressure(h) => view.pressure = h.get_latest(),
            SensorChannel::Brake(h) => view.brake = h.get_latest(),
            SensorChannel::CornerNode(h) => view.node = h.get_latest(),
        }
    }
}

/// Result of the capability probe done while building the store.
#[derive(Debug)]
pub enum Availability {
    Available(SensorChannel),
    Unavailable { channel: ChannelId, reason: &'static str },
}

impl Availability {
    pub fn channel(&self) -> ChannelId {
        match self {
            Availability::Available(c) => c.channel(),
            Availability::Unavailable { channel, .. } => *channel,
        }
    }
}

/// Device drivers fitted at one corner. `None` means no driver.
#[derive(Default)]
pub struct CornerDevices {
    pub thermal: Option<Box<dyn ThermalCamera>>,
    pub pressure: Option<Box<dyn PressureTransceiver>>,
    pub brake: Option<Box<dyn Thermocouple>>,
    pub node: Option<Box<dyn BusDevice>>,
}

/// Latest snapshots for one corner. A `None` channel has never published or
/// is not fitted.
#[derive(Debug, Clone, Copy)]
pub struct CornerView {
    pub corner: Corner,
    pub thermal: Option<Snapshot<TyreThermal>>,
    pub pressure: Option<Snapshot<TyrePressure>>,
    pub brake: Option<Snapshot<BrakeTemperature>>,
    pub node: Option<Snapshot<CornerReport>>,
}

impl CornerView {
    fn empty(corner: Corner) -> Self {
        Self {
            corner,
            thermal: None,
            pressure: None,
            brake: None,
            node: None,
        }
    }

    /// Thermal snapshot only if it is a detection younger than `max_age`.
    pub fn fresh_thermal(&self, now: Instant, max_age: Duration) -> Option<Snapshot<TyreThermal>> {
        self.thermal.filter(|s| s.valid && !s.is_stale(now, max_age))
    }

    /// Kinds whose latest snapshot is missing or older than `max_age`.
    pub fn stale_kinds(&self, now: Instant, max_age: Duration) -> heapless::Vec<SensorKind, 4> {
        let ages = [
            (SensorKind::Thermal, self.thermal.map(|s| s.age(now))),
            (SensorKind::Pressure, self.pressure.map(|s| s.age(now))),
            (SensorKind::Brake, self.brake.map(|s| s.age(now))),
            (SensorKind::CornerNode, self.node.map(|s| s.age(now))),
        ];
        ages.into_iter()
            .filter(|(_, age)| age.map_or(true, |age| age > max_age))
            .map(|(kind, _)| kind)
            .collect()
    }
}

/// What the consumer sees for one render cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleView {
    pub taken_at: Instant,
    pub corners: [CornerView; 4],
}

impl CycleView {
    pub fn corner(&self, corner: Corner) -> &CornerView {
        &self.corners[corner.index()]
    }
}

#[derive(Debug, Default)]
pub struct SnapshotStore {
    channels: Vec<SensorChannel>,
    unavailable: Vec<(ChannelId, &'static str)>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every channel `config` enables from the drivers in `devices`
    /// (indexed by [`Corner::index`]). Channels that are disabled or have no
    /// driver are recorded as unavailable rather than failing the build.
    pub fn from_config(config: &Config, devices: [CornerDevices; 4]) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut store = Self::new();
        for (corner, devices) in Corner::ALL.into_iter().zip(devices) {
            let fitted = config.corner(corner);
            let handler = config.handler;

            store.add(probe_capability(
                ChannelId::new(corner, SensorKind::Thermal),
                fitted.thermal_enabled,
                devices.thermal,
                |camera| {
                    let sensor = ThermalSensor::new(corner, camera, config.zone, config.tyre_filter);
                    SensorChannel::Thermal(SensorHandler::new(sensor, handler))
                },
            ));
            store.add(probe_capability(
                ChannelId::new(corner, SensorKind::Pressure),
                fitted.pressure_enabled,
                devices.pressure,
                |transceiver| {
                    let sensor =
                        PressureSensor::new(corner, transceiver, config.pressure_filter, config.tyre_filter);
                    SensorChannel::Pressure(SensorHandler::new(sensor, handler))
                },
            ));
            store.add(probe_capability(
                ChannelId::new(corner, SensorKind::Brake),
                fitted.brake_enabled,
                devices.brake,
                |thermocouple| {
                    let sensor = BrakeSensor::new(corner, thermocouple, config.brake_filter);
                    SensorChannel::Brake(SensorHandler::new(sensor, handler))
                },
            ));
            store.add(probe_capability(
                ChannelId::new(corner, SensorKind::CornerNode),
                fitted.bus_node_enabled,
                devices.node,
                |bus| {
                    let mut sensor =
                        CornerBusSensor::new(corner, bus, config.tyre_filter, config.brake_filter, config.zone);
                    if let Some(ms) = fitted.frame_request_interval_ms {
                        sensor = sensor.with_frame_requests(Duration::from_millis(ms));
                    }
                    SensorChannel::CornerNode(SensorHandler::new(sensor, handler))
                },
            ));
        }

        Ok(store)
    }

    pub fn add(&mut self, availability: Availability) {
        match availability {
            Availability::Available(channel) => self.channels.push(channel),
            Availability::Unavailable { channel, reason } => {
                info!(channel = %channel, reason, "channel unavailable");
                self.unavailable.push((channel, reason));
            }
        }
    }

    pub fn channels(&self) -> &[SensorChannel] {
        &self.channels
    }

    pub fn unavailable(&self) -> &[(ChannelId, &'static str)] {
        &self.unavailable
    }

    pub fn set_timing_sink(&mut self, sink: Arc<dyn TimingSink>) {
        for channel in &mut self.channels {
            channel.set_timing_sink(Some(Arc::clone(&sink)));
        }
    }

    /// Start every available channel. One channel failing to start does not
    /// keep the others down; the first error is returned.
    pub fn start_all(&mut self) -> Result<(), HandlerError> {
        self.for_each_channel(SensorChannel::start, "start")
    }

    /// Stop every channel, waiting for each up to its stop timeout.
    pub fn stop_all(&mut self) -> Result<(), HandlerError> {
        self.for_each_channel(SensorChannel::stop, "stop")
    }

    fn for_each_channel(
        &mut self,
        mut op: impl FnMut(&mut SensorChannel) -> Result<(), HandlerError>,
        action: &str,
    ) -> Result<(), HandlerError> {
        let mut first = None;
        for channel in &mut self.channels {
            if let Err(e) = op(channel) {
                warn!(channel = %channel.channel(), error = %e, "failed to {action} channel");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// One consumer read: the latest snapshot of every channel. Never blocks.
    pub fn read_cycle(&self) -> CycleView {
        let mut corners = Corner::ALL.map(CornerView::empty);
        for channel in &self.channels {
            let corner = channel.channel().corner;
            channel.read_into(&mut corners[corner.index()]);
        }
        CycleView {
            taken_at: Instant::now(),
            corners,
        }
    }

    pub fn states(&self) -> impl Iterator<Item = (ChannelId, HandlerState)> + '_ {
        self.channels.iter().map(|c| (c.channel(), c.state()))
    }
}

fn probe_capability<D>(
    channel: ChannelId,
    enabled: bool,
    device: Option<D>,
    build: impl FnOnce(D) -> SensorChannel,
) -> Availability {
    match (enabled, device) {
        (false, _) => Availability::Unavailable {
            channel,
            reason: "disabled in configuration",
        },
        (true, None) => Availability::Unavailable {
            channel,
            reason: "no driver",
        },
        (true, Some(device)) => Availability::Available(build(device)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CornerConfig;
    use crate::sim::{FaultProfile, SimThermalCamera, TyreScene};

    #[test]
    fn test_capability_probe() {
        let mut config = Config::default();
        config.corners = [CornerConfig {
            thermal_enabled: true,
            pressure_enabled: false,
            brake_enabled: true,
            bus_node_enabled: false,
            frame_request_interval_ms: None,
        }; 4];

        let mut devices: [CornerDevices; 4] = Default::default();
        devices[0].thermal = Some(Box::new(SimThermalCamera::new(TyreScene::default(), FaultProfile::healthy(), 1)));

        let store = SnapshotStore::from_config(&config, devices).unwrap();
        assert_eq!(store.channels().len(), 1);
        assert_eq!(store.channels()[0].channel(), ChannelId::new(Corner::FrontLeft, SensorKind::Thermal));
        // 3 corners without a camera, 4 without brakes, 4 disabled pressure, 4 disabled nodes.
        assert_eq!(store.unavailable().len(), 15);
    }

    #[test]
    fn test_read_cycle_before_start_is_empty() {
        let store = SnapshotStore::new();
        let view = store.read_cycle();
        for (corner, view) in Corner::ALL.into_iter().zip(view.corners) {
            assert_eq!(view.corner, corner);
            assert!(view.thermal.is_none() && view.node.is_none());
        }
    }
}
