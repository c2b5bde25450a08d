//! Simulated hardware for bench runs and tests.
//!
//! Every device draws from a seeded linear congruential generator so runs are
//! repeatable, and carries a [`FaultProfile`] that decides how often it
//! misbehaves: transient read errors, malformed bus payloads, a device that
//! only appears after a number of probes, or one that never appears at all.

use crate::config::ZoneConfig;
use crate::protocol::{
    encode, frame_chunks, BusFrame, Corner, CornerMessage, MessageKind, STATUS_FLAG_FRAME_PENDING,
};
use crate::sensors::{BusDevice, PressureSample, PressureTransceiver, SensorError, ThermalCamera, Thermocouple};
use crate::zone::{RawThermalFrame, ZoneProcessor, FRAME_COLS};
use heapless::Deque;
use serde::{Deserialize, Serialize};
use std::time::Instant;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

const DEFAULT_TRANSIENT_RATE_PERCENT: f32 = 0.5;
const DEFAULT_MALFORMED_RATE_PERCENT: f32 = 0.2;
const DEFAULT_UNKNOWN_RATE_PERCENT: f32 = 0.5;

// Scene defaults: a warm tyre with a hotter inside shoulder on a cool road.
const AMBIENT_C: f32 = 25.0;
const TYRE_LEFT_C: f32 = 80.0;
const TYRE_CENTRE_C: f32 = 95.0;
const TYRE_RIGHT_C: f32 = 110.0;
const TYRE_FIRST_COLUMN: u8 = 8;
const TYRE_LAST_COLUMN: u8 = 23;
const PIXEL_NOISE_C: f32 = 0.5;

const NODE_QUEUE_DEPTH: usize = 512;
const NODE_FRAME_RATE_HZ: f32 = 16.0;

/// How a simulated device misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultProfile {
    pub enabled: bool,
    /// Chance per read of a transient I/O error.
    pub transient_rate_percent: f32,
    /// Chance per bus batch of one truncated payload.
    pub malformed_rate_percent: f32,
    /// Chance per bus batch of one frame with an unassigned identifier.
    pub unknown_rate_percent: f32,
    /// Probes that report the device absent before it shows up.
    pub absent_probes: u32,
    /// Never shows up.
    pub always_absent: bool,
    /// Probe fails with an unrecoverable error.
    pub fatal: bool,
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self {
            enabled: true,
            transient_rate_percent: DEFAULT_TRANSIENT_RATE_PERCENT,
            malformed_rate_percent: DEFAULT_MALFORMED_RATE_PERCENT,
            unknown_rate_percent: DEFAULT_UNKNOWN_RATE_PERCENT,
            absent_probes: 0,
            always_absent: false,
            fatal: false,
        }
    }
}

impl FaultProfile {
    /// A device that always behaves.
    pub fn healthy() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Same fault mix with every rate set to `rate_percent`.
    pub fn with_rate(rate_percent: f32) -> Self {
        Self {
            transient_rate_percent: rate_percent,
            malformed_rate_percent: rate_percent,
            unknown_rate_percent: rate_percent,
            ..Self::default()
        }
    }

    pub fn absent() -> Self {
        Self {
            always_absent: true,
            ..Self::healthy()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimStats {
    pub probes: u32,
    pub reads: u32,
    pub transient_faults: u32,
    pub malformed_frames: u32,
    pub unknown_frames: u32,
}

/// Linear congruential generator (Numerical Recipes constants).
#[derive(Debug, Clone)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_random(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.state
    }

    /// Uniform in `0.0..1.0`, from the high bits.
    pub fn random_float(&mut self) -> f32 {
        (self.next_random() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform in `-amplitude..amplitude`.
    pub fn noise(&mut self, amplitude: f32) -> f32 {
        (self.random_float() * 2.0 - 1.0) * amplitude
    }

    pub fn chance(&mut self, rate_percent: f32) -> bool {
        self.random_float() < rate_percent / 100.0
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

/// Decides, per call, whether a device fails.
#[derive(Debug, Clone)]
struct FaultSource {
    profile: FaultProfile,
    rng: SimRng,
    probes_remaining: u32,
    stats: SimStats,
}

impl FaultSource {
    fn new(profile: FaultProfile, seed: u64) -> Self {
        Self {
            profile,
            rng: SimRng::new(seed),
            probes_remaining: profile.absent_probes,
            stats: SimStats::default(),
        }
    }

    fn probe(&mut self, device: &str) -> Result<(), SensorError> {
        self.stats.probes += 1;
        if self.profile.fatal {
            return Err(SensorError::fatal(format!("{device}: configuration rejected")));
        }
        if self.profile.always_absent {
            return Err(SensorError::absent(format!("{device}: no response")));
        }
        if self.probes_remaining > 0 {
            self.probes_remaining -= 1;
            return Err(SensorError::absent(format!("{device}: no response")));
        }
        Ok(())
    }

    fn read(&mut self, device: &str) -> Result<(), SensorError> {
        self.stats.reads += 1;
        if self.profile.enabled && self.rng.chance(self.profile.transient_rate_percent) {
            self.stats.transient_faults += 1;
            return Err(SensorError::transient(format!("{device}: read timed out")));
        }
        Ok(())
    }

    fn inject(&mut self, rate_percent: f32) -> bool {
        self.profile.enabled && self.rng.chance(rate_percent)
    }
}

/// What the simulated camera is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TyreScene {
    pub ambient_c: f32,
    pub left_c: f32,
    pub centre_c: f32,
    pub right_c: f32,
    pub first_column: u8,
    pub last_column: u8,
    /// Peak amplitude of the slow warm-up/cool-down swing.
    pub swing_c: f32,
    pub noise_c: f32,
}

impl Default for TyreScene {
    fn default() -> Self {
        Self {
            ambient_c: AMBIENT_C,
            left_c: TYRE_LEFT_C,
            centre_c: TYRE_CENTRE_C,
            right_c: TYRE_RIGHT_C,
            first_column: TYRE_FIRST_COLUMN,
            last_column: TYRE_LAST_COLUMN,
            swing_c: 5.0,
            noise_c: PIXEL_NOISE_C,
        }
    }
}

impl TyreScene {
    /// Render the scene at `tick` into `frame`.
    pub fn render(&self, tick: u32, rng: &mut SimRng, frame: &mut RawThermalFrame) {
        let swing = self.swing_c * (tick as f32 * 0.05).sin();
        let first = usize::from(self.first_column).min(FRAME_COLS - 1);
        let last = usize::from(self.last_column).clamp(first, FRAME_COLS - 1);
        let span = last - first + 1;
        let b1 = first + span / 3;
        let b2 = first + (2 * span) / 3;

        *frame = RawThermalFrame::from_fn(|_, col| {
            let base = match col {
                c if c < first || c > last => self.ambient_c,
                c if c < b1 => self.left_c + swing,
                c if c < b2 => self.centre_c + swing,
                _ => self.right_c + swing,
            };
            base + rng.noise(self.noise_c)
        });
    }
}

pub struct SimThermalCamera {
    scene: TyreScene,
    faults: FaultSource,
    rng: SimRng,
    tick: u32,
}

impl SimThermalCamera {
    pub fn new(scene: TyreScene, faults: FaultProfile, seed: u64) -> Self {
        Self {
            scene,
            faults: FaultSource::new(faults, seed),
            rng: SimRng::new(seed.rotate_left(17)),
            tick: 0,
        }
    }

    pub fn stats(&self) -> SimStats {
        self.faults.stats
    }
}

impl ThermalCamera for SimThermalCamera {
    fn probe(&mut self) -> Result<(), SensorError> {
        self.faults.probe("thermal camera")
    }

    fn read_frame(&mut self, frame: &mut RawThermalFrame) -> Result<(), SensorError> {
        self.faults.read("thermal camera")?;
        self.scene.render(self.tick, &mut self.rng, frame);
        self.tick = self.tick.wrapping_add(1);
        Ok(())
    }
}

pub struct SimPressureTransceiver {
    base_kpa: f32,
    faults: FaultSource,
    tick: u32,
}

impl SimPressureTransceiver {
    pub fn new(base_kpa: f32, faults: FaultProfile, seed: u64) -> Self {
        Self {
            base_kpa,
            faults: FaultSource::new(faults, seed),
            tick: 0,
        }
    }
}

impl PressureTransceiver for SimPressureTransceiver {
    fn probe(&mut self) -> Result<(), SensorError> {
        self.faults.probe("pressure transceiver")
    }

    fn read(&mut self) -> Result<PressureSample, SensorError> {
        self.faults.read("pressure transceiver")?;
        // Pressure climbs with carcass temperature, roughly 1 kPa per 3 °C.
        let warmup = (self.tick as f32 * 0.01).min(1.0);
        self.tick = self.tick.wrapping_add(1);
        Ok(PressureSample {
            pressure_kpa: self.base_kpa + 20.0 * warmup + self.faults.rng.noise(0.3),
            temperature_c: AMBIENT_C + 60.0 * warmup + self.faults.rng.noise(0.2),
        })
    }
}

pub struct SimThermocouple {
    base_c: f32,
    faults: FaultSource,
    tick: u32,
}

impl SimThermocouple {
    pub fn new(base_c: f32, faults: FaultProfile, seed: u64) -> Self {
        Self {
            base_c,
            faults: FaultSource::new(faults, seed),
            tick: 0,
        }
    }
}

impl Thermocouple for SimThermocouple {
    fn probe(&mut self) -> Result<(), SensorError> {
        self.faults.probe("thermocouple")
    }

    fn read_celsius(&mut self) -> Result<f32, SensorError> {
        self.faults.read("thermocouple")?;
        // Braking zones: sharp spikes every 40 reads, exponential cool-down.
        let phase = self.tick % 40;
        self.tick = self.tick.wrapping_add(1);
        let heat = 300.0 * (-(phase as f32) / 10.0).exp();
        Ok(self.base_c + heat + self.faults.rng.noise(1.0))
    }
}

/// A corner node on the bus: it runs its own zone analysis on a simulated
/// camera and streams the results, and answers full-frame requests.
pub struct SimCornerNode {
    corner: Corner,
    scene: TyreScene,
    faults: FaultSource,
    rng: SimRng,
    processor: ZoneProcessor,
    frame: RawThermalFrame,
    queue: Deque<BusFrame, NODE_QUEUE_DEPTH>,
    batch_drained: bool,
    started: Instant,
    tick: u32,
}

impl SimCornerNode {
    pub fn new(corner: Corner, scene: TyreScene, zone: ZoneConfig, faults: FaultProfile, seed: u64) -> Self {
        let mut rng = SimRng::new(seed.rotate_left(23));
        let mut frame = RawThermalFrame::default();
        scene.render(0, &mut rng, &mut frame);

        Self {
            corner,
            scene,
            faults: FaultSource::new(faults, seed),
            rng,
            processor: ZoneProcessor::new(zone),
            frame,
            queue: Deque::new(),
            batch_drained: true,
            started: Instant::now(),
            tick: 0,
        }
    }

    pub fn stats(&self) -> SimStats {
        self.faults.stats
    }

    fn enqueue(&mut self, message: &CornerMessage) {
        // A full queue drops the newest frame, like a saturated mailbox.
        let _ = self.queue.push_back(encode(message));
    }

    fn enqueue_batch(&mut self) {
        self.scene.render(self.tick, &mut self.rng, &mut self.frame);
        let result = self.processor.process(&self.frame);
        let brake = 250.0 + 150.0 * (self.tick as f32 * 0.1).sin();
        let corner = self.corner;
        self.tick = self.tick.wrapping_add(1);

        self.enqueue(&CornerMessage::TyreTemps {
            corner,
            left: result.left_median,
            centre: result.centre_median,
            right: result.right_median,
            gradient: result.lateral_gradient,
        });
        self.enqueue(&CornerMessage::TyreDetection {
            corner,
            detected: result.detected,
            confidence: result.confidence,
            edge_left: result.edge_left,
            edge_right: result.edge_right,
            width_mm: result.estimated_width,
        });
        self.enqueue(&CornerMessage::BrakeTemps {
            corner,
            inner: brake + 15.0,
            outer: brake,
        });

        let FaultProfile { malformed_rate_percent, unknown_rate_percent, .. } = self.faults.profile;
        if self.faults.inject(malformed_rate_percent) {
            // A detection frame cut short on the wire.
            self.faults.stats.malformed_frames += 1;
            let mut truncated = encode(&CornerMessage::TyreDetection {
                corner,
                detected: result.detected,
                confidence: result.confidence,
                edge_left: result.edge_left,
                edge_right: result.edge_right,
                width_mm: result.estimated_width,
            });
            truncated.len = 3;
            let _ = self.queue.push_back(truncated);
        }
        if self.faults.inject(unknown_rate_percent) {
            self.faults.stats.unknown_frames += 1;
            if let Ok(frame) = BusFrame::new(corner.base_identifier() + 0x0F, &[0xAA, 0x55]) {
                let _ = self.queue.push_back(frame);
            }
        }

        let flags = if self.queue.len() > 8 { STATUS_FLAG_FRAME_PENDING } else { 0 };
        self.enqueue(&CornerMessage::Status {
            corner,
            uptime_s: self.started.elapsed().as_secs() as u32,
            frame_rate_hz: NODE_FRAME_RATE_HZ,
            flags,
        });
    }
}

impl BusDevice for SimCornerNode {
    fn probe(&mut self) -> Result<(), SensorError> {
        self.faults.probe("corner node")
    }

    fn receive(&mut self) -> Result<Option<BusFrame>, SensorError> {
        if self.batch_drained {
            self.faults.read("corner node")?;
            self.enqueue_batch();
            self.batch_drained = false;
        }
        match self.queue.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.batch_drained = true;
                Ok(None)
            }
        }
    }

    fn transmit(&mut self, frame: &BusFrame) -> Result<(), SensorError> {
        let request = self.corner.identifier(MessageKind::FrameRequest);
        if frame.identifier != request {
            return Ok(());
        }
        // Answer with the frame the node last analysed.
        for chunk in frame_chunks(self.corner, &self.frame) {
            let _ = self.queue.push_back(encode(&chunk));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DecodeError;

    #[test]
    fn test_rng_is_repeatable() {
        let mut a = SimRng::new(7);
        let mut b = SimRng::new(7);
        for _ in 0..16 {
            assert_eq!(a.random_float(), b.random_float());
        }
    }

    #[test]
    fn test_random_float_range() {
        let mut rng = SimRng::default();
        for _ in 0..1000 {
            let value = rng.random_float();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_absent_probes_then_present() {
        let profile = FaultProfile {
            absent_probes: 2,
            ..FaultProfile::healthy()
        };
        let mut camera = SimThermalCamera::new(TyreScene::default(), profile, 1);
        assert!(matches!(camera.probe(), Err(SensorError::Absent(_))));
        assert!(matches!(camera.probe(), Err(SensorError::Absent(_))));
        assert!(camera.probe().is_ok());
        assert_eq!(camera.stats().probes, 3);
    }

    #[test]
    fn test_healthy_device_never_fails_reads() {
        let mut thermocouple = SimThermocouple::new(100.0, FaultProfile::healthy(), 3);
        for _ in 0..200 {
            assert!(thermocouple.read_celsius().unwrap().is_finite());
        }
    }

    #[test]
    fn test_corner_node_batch_ends_with_none() {
        let mut node = SimCornerNode::new(
            Corner::RearLeft,
            TyreScene::default(),
            ZoneConfig::default(),
            FaultProfile::healthy(),
            5,
        );
        let mut frames = 0;
        while let Some(frame) = node.receive().unwrap() {
            assert_eq!(frame.decode().unwrap().corner(), Corner::RearLeft);
            frames += 1;
        }
        assert_eq!(frames, 4);
    }

    #[test]
    fn test_corner_node_injects_bad_frames() {
        let mut node = SimCornerNode::new(
            Corner::FrontLeft,
            TyreScene::default(),
            ZoneConfig::default(),
            FaultProfile { transient_rate_percent: 0.0, ..FaultProfile::with_rate(100.0) },
            9,
        );
        let mut malformed = 0;
        let mut unknown = 0;
        while let Some(frame) = node.receive().unwrap() {
            match frame.decode() {
                Err(DecodeError::MalformedPayload { .. }) => malformed += 1,
                Err(DecodeError::UnknownIdentifier(_)) => unknown += 1,
                Ok(_) => {}
            }
        }
        assert_eq!(malformed, 1);
        assert_eq!(unknown, 1);
    }
}
