use super::{BusDevice, ChannelId, DroppedFrames, Reading, Sensor, SensorError, SensorKind};
use crate::config::{FilterConfig, ZoneConfig};
use crate::filter::TemporalFilter;
use crate::protocol::{encode, Corner, CornerMessage, DecodeError, FrameAssembler};
use crate::zone::{ZoneProcessor, ZoneResult};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Upper bound on frames drained from the bus per poll, so a chatty node
/// cannot starve the publish step.
pub const MAX_FRAMES_PER_POLL: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeTyre {
    pub left: f32,
    pub centre: f32,
    pub right: f32,
    pub gradient: f32,
    pub detected: bool,
    pub confidence: f32,
    pub edge_left: u8,
    pub edge_right: u8,
    pub width_mm: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeBrake {
    pub inner: f32,
    pub outer: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    pub uptime_s: u32,
    pub frame_rate_dhz: u16,
    pub flags: u8,
}

/// Latest aggregated view of one corner node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CornerReport {
    pub tyre: Option<NodeTyre>,
    pub brake: Option<NodeBrake>,
    pub status: Option<NodeStatus>,
    /// Host-side zone analysis of the most recent full-frame transfer.
    pub host_zones: Option<ZoneResult>,
}

pub struct CornerBusSensor {
    channel: ChannelId,
    bus: Box<dyn BusDevice>,
    report: CornerReport,
    tyre_filters: [TemporalFilter; 3],
    brake_filters: [TemporalFilter; 2],
    assembler: FrameAssembler,
    processor: ZoneProcessor,
    frame_request_interval: Option<Duration>,
    last_frame_request: Option<Instant>,
    request_id: u8,
    unknown_identifiers: u64,
    dropped: DroppedFrames,
}

impl CornerBusSensor {
    pub fn new(
        corner: Corner,
        bus: Box<dyn BusDevice>,
        tyre_filter: FilterConfig,
        brake_filter: FilterConfig,
        zone: ZoneConfig,
    ) -> Self {
        Self {
            channel: ChannelId::new(corner, SensorKind::CornerNode),
            bus,
            report: CornerReport::default(),
            tyre_filters: [
                TemporalFilter::new(tyre_filter),
                TemporalFilter::new(tyre_filter),
                TemporalFilter::new(tyre_filter),
            ],
            brake_filters: [TemporalFilter::new(brake_filter), TemporalFilter::new(brake_filter)],
            assembler: FrameAssembler::new(corner),
            processor: ZoneProcessor::new(zone),
            frame_request_interval: None,
            last_frame_request: None,
            request_id: 0,
            unknown_identifiers: 0,
            dropped: DroppedFrames::default(),
        }
    }

    /// Periodically ask the node for a full thermal frame and analyse it on
    /// the host as well. The first request goes out one interval after the
    /// first poll, once the node's own reports are flowing.
    pub fn with_frame_requests(mut self, interval: Duration) -> Self {
        self.frame_request_interval = Some(interval);
        self
    }

    pub fn unknown_identifiers(&self) -> u64 {
        self.unknown_identifiers
    }

    fn corner(&self) -> Corner {
        self.channel.corner
    }

    fn maybe_request_frame(&mut self, now: Instant) -> Result<(), SensorError> {
        let Some(interval) = self.frame_request_interval else {
            return Ok(());
        };
        let Some(last) = self.last_frame_request else {
            self.last_frame_request = Some(now);
            return Ok(());
        };
        if now.duration_since(last) < interval {
            return Ok(());
        }

        self.request_id = self.request_id.wrapping_add(1);
        let request = CornerMessage::FrameRequest {
            corner: self.corner(),
            request_id: self.request_id,
        };
        self.bus.transmit(&encode(&request))?;
        self.assembler.reset();
        self.last_frame_request = Some(now);
        debug!(channel = %self.channel, request_id = self.request_id, "requested full frame");
        Ok(())
    }

    fn apply(&mut self, message: CornerMessage, now: Instant) {
        match message {
            CornerMessage::TyreTemps { left, centre, right, .. } => {
                let [fl, fc, fr] = &mut self.tyre_filters;
                let tyre = self.report.tyre.get_or_insert_with(NodeTyre::default);
                tyre.left = fl.apply_at(left, now);
                tyre.centre = fc.apply_at(centre, now);
                tyre.right = fr.apply_at(right, now);
                tyre.gradient = tyre.right - tyre.left;
            }
            CornerMessage::TyreDetection { detected, confidence, edge_left, edge_right, width_mm, .. } => {
                let tyre = self.report.tyre.get_or_insert_with(NodeTyre::default);
                tyre.detected = detected;
                tyre.confidence = confidence;
                tyre.edge_left = edge_left;
                tyre.edge_right = edge_right;
                tyre.width_mm = width_mm;
            }
            CornerMessage::BrakeTemps { inner, outer, .. } => {
                let [fi, fo] = &mut self.brake_filters;
                self.report.brake = Some(NodeBrake {
                    inner: fi.apply_at(inner, now),
                    outer: fo.apply_at(outer, now),
                });
            }
            CornerMessage::Status { uptime_s, frame_rate_hz, flags, .. } => {
                self.report.status = Some(NodeStatus {
                    uptime_s,
                    frame_rate_dhz: (frame_rate_hz * 10.0).round() as u16,
                    flags,
                });
            }
            CornerMessage::FrameData { .. } => {
                if let Some(frame) = self.assembler.push(&message) {
                    self.report.host_zones = Some(self.processor.process(&frame));
                }
            }
            // Requests travel host → node; an echo is nothing to act on.
            CornerMessage::FrameRequest { .. } => {}
        }
    }
}

impl Sensor for CornerBusSensor {
    type Payload = CornerReport;

    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        self.bus.probe()
    }

    fn acquire(&mut self) -> Result<Reading<CornerReport>, SensorError> {
        self.maybe_request_frame(Instant::now())?;

        // A failed receive ends the drain; frames already taken still count.
        let mut frames: Vec<_, MAX_FRAMES_PER_POLL> = Vec::new();
        let mut receive_error = None;
        while !frames.is_full() {
            match self.bus.receive() {
                Ok(Some(frame)) => {
                    let _ = frames.push(frame);
                }
                Ok(None) => break,
                Err(e @ SensorError::Transient(_)) => {
                    receive_error = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let started = Instant::now();
        let mut applied = 0usize;

        for frame in &frames {
            match frame.decode() {
                Ok(message) if message.corner() == self.corner() => {
                    self.apply(message, started);
                    applied += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    match e {
                        DecodeError::UnknownIdentifier(identifier) => {
                            self.unknown_identifiers += 1;
                            trace!(channel = %self.channel, identifier, "ignoring unknown identifier");
                        }
                        DecodeError::MalformedPayload { .. } => {
                            debug!(channel = %self.channel, error = %e, "dropping malformed frame");
                        }
                    }
                    self.dropped.record(&e);
                }
            }
        }

        if applied == 0 {
            return Err(receive_error.unwrap_or_else(|| SensorError::transient("no usable frames from corner node")));
        }
        if let Some(e) = receive_error {
            debug!(channel = %self.channel, error = %e, "bus read failed mid-batch");
        }

        let valid = self.report.tyre.map_or(true, |t| t.detected);
        Ok(Reading::new(self.report, valid, started.elapsed()))
    }

    fn take_dropped(&mut self) -> DroppedFrames {
        core::mem::take(&mut self.dropped)
    }
}
