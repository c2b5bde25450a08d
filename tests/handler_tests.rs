use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tyretherm::config::{Config, FilterConfig, HandlerConfig, ZoneConfig};
use tyretherm::handler::*;
use tyretherm::protocol::{encode, BusFrame, Corner, CornerMessage, DecodeError};
use tyretherm::sensors::*;
use tyretherm::sim::{FaultProfile, SimThermalCamera, TyreScene};

const WAIT: Duration = Duration::from_secs(3);

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn fast_config() -> HandlerConfig {
    HandlerConfig {
        poll_interval_ms: 5,
        max_consecutive_failures: 3,
        backoff_initial_ms: 1,
        backoff_max_ms: 4,
        reprobe_interval_ms: 20,
        stop_timeout_ms: 1000,
    }
}

/// Knobs a test flips while the handler runs.
#[derive(Clone)]
struct Script {
    present: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
    acquire_delay_ms: Arc<AtomicU64>,
}

impl Script {
    fn healthy() -> Self {
        Self {
            present: Arc::new(AtomicBool::new(true)),
            healthy: Arc::new(AtomicBool::new(true)),
            fatal: Arc::new(AtomicBool::new(false)),
            acquire_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }
}

struct ScriptedSensor {
    script: Script,
    counter: u32,
}

impl ScriptedSensor {
    fn new(script: &Script) -> Self {
        Self {
            script: script.clone(),
            counter: 0,
        }
    }
}

impl Sensor for ScriptedSensor {
    type Payload = u32;

    fn channel(&self) -> ChannelId {
        ChannelId::new(Corner::FrontLeft, SensorKind::Brake)
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        if self.script.fatal.load(Ordering::SeqCst) {
            return Err(SensorError::fatal("bad wiring"));
        }
        if self.script.present.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SensorError::absent("not answering"))
        }
    }

    fn acquire(&mut self) -> Result<Reading<u32>, SensorError> {
        let delay = self.script.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if !self.script.healthy.load(Ordering::SeqCst) {
            return Err(SensorError::transient("bus timeout"));
        }
        self.counter += 1;
        Ok(Reading::new(self.counter, true, Duration::from_micros(5)))
    }
}

#[test]
fn test_absent_hardware_degrades_without_publishing() {
    let camera = SimThermalCamera::new(TyreScene::default(), FaultProfile::absent(), 1);
    let sensor = ThermalSensor::new(Corner::FrontLeft, Box::new(camera), ZoneConfig::default(), FilterConfig::default());
    let mut handler = SensorHandler::new(sensor, fast_config());
    assert_eq!(handler.state(), HandlerState::Stopped);

    handler.start().unwrap();
    assert!(wait_for(|| handler.state() == HandlerState::Degraded));
    assert!(handler.get_latest().is_none());

    // It keeps re-probing in the background.
    assert!(wait_for(|| handler.stats().probe_attempts >= 3));
    assert!(handler.get_latest().is_none());

    handler.stop().unwrap();
    assert_eq!(handler.state(), HandlerState::Stopped);
}

#[test]
fn test_healthy_sensor_publishes_increasing_sequences() {
    let script = Script::healthy();
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), fast_config());
    handler.start().unwrap();

    assert!(wait_for(|| handler.get_latest().is_some_and(|s| s.sequence >= 5)));
    assert_eq!(handler.state(), HandlerState::Running);

    let first = handler.get_latest().unwrap();
    assert!(wait_for(|| handler.get_latest().is_some_and(|s| s.sequence > first.sequence)));
    let second = handler.get_latest().unwrap();
    assert!(second.payload > first.payload);
    assert!(second.timestamp >= first.timestamp);

    handler.stop().unwrap();
    assert!(handler.stats().published >= second.sequence);
}

#[test]
fn test_restart_continues_sequence() {
    let script = Script::healthy();
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), fast_config());

    handler.start().unwrap();
    assert!(wait_for(|| handler.get_latest().is_some()));
    handler.stop().unwrap();
    let before = handler.get_latest().unwrap();

    // Stopped handlers still serve their last snapshot.
    assert_eq!(handler.get_latest(), Some(before));

    handler.start().unwrap();
    assert!(wait_for(|| handler.get_latest().is_some_and(|s| s.sequence > before.sequence)));
    handler.stop().unwrap();
}

#[test]
fn test_transient_failures_degrade_then_recover() {
    let script = Script::healthy();
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), fast_config());
    handler.start().unwrap();
    assert!(wait_for(|| handler.get_latest().is_some()));

    script.healthy.store(false, Ordering::SeqCst);
    assert!(wait_for(|| handler.state() == HandlerState::Degraded));
    assert!(handler.stats().transient_failures >= 3);

    // The last good value stays readable while degraded.
    let held = handler.get_latest().unwrap();
    assert!(held.valid);

    script.healthy.store(true, Ordering::SeqCst);
    assert!(wait_for(|| handler.state() == HandlerState::Running));
    assert!(wait_for(|| handler.get_latest().is_some_and(|s| s.sequence > held.sequence)));

    handler.stop().unwrap();
}

#[test]
fn test_late_hardware_is_picked_up_by_reprobe() {
    let script = Script::healthy();
    script.present.store(false, Ordering::SeqCst);
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), fast_config());

    handler.start().unwrap();
    assert!(wait_for(|| handler.state() == HandlerState::Degraded));
    assert!(handler.get_latest().is_none());

    script.present.store(true, Ordering::SeqCst);
    assert!(wait_for(|| handler.get_latest().is_some()));
    assert_eq!(handler.state(), HandlerState::Running);
    handler.stop().unwrap();
}

#[test]
fn test_fatal_probe_is_terminal() {
    let script = Script::healthy();
    script.fatal.store(true, Ordering::SeqCst);
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), fast_config());

    handler.start().unwrap();
    assert!(wait_for(|| handler.state() == HandlerState::Failed));
    handler.stop().unwrap();
    assert_eq!(handler.state(), HandlerState::Failed);

    script.fatal.store(false, Ordering::SeqCst);
    assert!(matches!(handler.start(), Err(HandlerError::Failed { .. })));
    assert!(handler.get_latest().is_none());
}

#[test]
fn test_double_start_is_rejected() {
    let script = Script::healthy();
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), fast_config());
    handler.start().unwrap();
    assert!(matches!(handler.start(), Err(HandlerError::AlreadyRunning { .. })));
    handler.stop().unwrap();
    // Stopping twice is harmless.
    handler.stop().unwrap();
}

#[test]
fn test_stop_times_out_on_stuck_device() {
    let script = Script::healthy();
    script.acquire_delay_ms.store(400, Ordering::SeqCst);
    let config = HandlerConfig {
        stop_timeout_ms: 20,
        ..fast_config()
    };
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), config);
    handler.start().unwrap();
    assert!(wait_for(|| handler.stats().probe_attempts == 1));
    // Let the thread get into the slow read.
    thread::sleep(Duration::from_millis(50));

    let err = handler.stop().unwrap_err();
    assert!(matches!(err, HandlerError::StopTimeout { timeout_ms: 20, .. }));
    assert!(handler.is_running());

    // Once the read returns the thread honours the stop request.
    script.acquire_delay_ms.store(0, Ordering::SeqCst);
    let mut stopped = false;
    for _ in 0..100 {
        if handler.stop().is_ok() {
            stopped = true;
            break;
        }
    }
    assert!(stopped);
    assert!(!handler.is_running());
}

#[derive(Default)]
struct RecordingSink {
    samples: Mutex<Vec<TimingSample>>,
}

impl TimingSink for RecordingSink {
    fn record(&self, sample: TimingSample) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample);
        }
    }
}

#[test]
fn test_timing_samples_reach_the_sink() {
    let script = Script::healthy();
    let sink = Arc::new(RecordingSink::default());
    let mut handler =
        SensorHandler::new(ScriptedSensor::new(&script), fast_config()).with_timing_sink(sink.clone());

    handler.start().unwrap();
    assert!(wait_for(|| sink.samples.lock().unwrap().len() >= 3));
    handler.stop().unwrap();

    let samples = sink.samples.lock().unwrap();
    for sample in samples.iter() {
        assert_eq!(sample.channel, ChannelId::new(Corner::FrontLeft, SensorKind::Brake));
        assert_eq!(sample.processing, Duration::from_micros(5));
        assert!(sample.acquisition >= Duration::ZERO);
    }
}

#[test]
fn test_reader_outlives_handler() {
    let script = Script::healthy();
    let mut handler = SensorHandler::new(ScriptedSensor::new(&script), fast_config());
    let reader = handler.reader();
    handler.start().unwrap();
    assert!(wait_for(|| reader.latest().is_some()));
    drop(handler);
    assert!(reader.latest().is_some());
}

/// Sensor that fails every poll, cycling through a fixed list of errors.
struct CyclingErrors {
    errors: Vec<SensorError>,
    next: usize,
}

impl Sensor for CyclingErrors {
    type Payload = u32;

    fn channel(&self) -> ChannelId {
        ChannelId::new(Corner::RearRight, SensorKind::Thermal)
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn acquire(&mut self) -> Result<Reading<u32>, SensorError> {
        let error = self.errors[self.next % self.errors.len()].clone();
        self.next += 1;
        Err(error)
    }
}

#[test]
fn test_skipped_polls_do_not_clear_failure_streak() {
    let sensor = CyclingErrors {
        errors: vec![
            SensorError::transient("bus timeout"),
            SensorError::DeadlineExceeded { elapsed_us: 1500, budget_us: 1000 },
        ],
        next: 0,
    };
    let mut handler = SensorHandler::new(sensor, fast_config());
    handler.start().unwrap();

    assert!(wait_for(|| handler.state() == HandlerState::Degraded));
    let stats = handler.stats();
    assert!(stats.transient_failures >= 3);
    assert!(stats.deadline_misses >= 2);
    assert!(handler.get_latest().is_none());
    handler.stop().unwrap();
}

#[test]
fn test_decode_errors_are_counted_by_kind() {
    let sensor = CyclingErrors {
        errors: vec![
            SensorError::Decode(DecodeError::UnknownIdentifier(0x7A0)),
            SensorError::Decode(DecodeError::MalformedPayload { identifier: 0x100, expected: 8, actual: 3 }),
        ],
        next: 0,
    };
    let mut handler = SensorHandler::new(sensor, fast_config());
    handler.start().unwrap();

    assert!(wait_for(|| {
        let stats = handler.stats();
        stats.unknown_identifiers >= 2 && stats.malformed_frames >= 2
    }));
    assert_eq!(handler.state(), HandlerState::Running);
    assert!(handler.get_latest().is_none());
    handler.stop().unwrap();
}

/// Bus that hands out the same batch on every poll, then reports empty.
struct RepeatingBus {
    batch: Vec<BusFrame>,
    cursor: usize,
}

impl BusDevice for RepeatingBus {
    fn probe(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<BusFrame>, SensorError> {
        match self.batch.get(self.cursor) {
            Some(frame) => {
                self.cursor += 1;
                Ok(Some(*frame))
            }
            None => {
                self.cursor = 0;
                Ok(None)
            }
        }
    }

    fn transmit(&mut self, _frame: &BusFrame) -> Result<(), SensorError> {
        Ok(())
    }
}

#[test]
fn test_corner_node_publishes_alongside_malformed_frames() {
    let corner = Corner::FrontLeft;
    let mut truncated = encode(&CornerMessage::TyreTemps { corner, left: 80.0, centre: 85.0, right: 90.0, gradient: 10.0 });
    truncated.len = 3;
    let bus = RepeatingBus {
        batch: vec![
            encode(&CornerMessage::BrakeTemps { corner, inner: 300.0, outer: 280.0 }),
            truncated,
            truncated,
            BusFrame::new(0x7A0, &[0]).unwrap(),
        ],
        cursor: 0,
    };
    let config = Config::default();
    let sensor = CornerBusSensor::new(corner, Box::new(bus), config.tyre_filter, config.brake_filter, config.zone);
    let mut handler = SensorHandler::new(sensor, fast_config());

    handler.start().unwrap();
    assert!(wait_for(|| handler.stats().published >= 3));
    assert_eq!(handler.state(), HandlerState::Running);

    let latest = handler.get_latest().unwrap();
    assert!(latest.payload.brake.is_some());
    assert!(latest.payload.tyre.is_none());

    handler.stop().unwrap();
    // Every poll publishes once and drops every bad frame of its batch.
    let stats = handler.stats();
    assert_eq!(stats.malformed_frames, 2 * stats.published);
    assert_eq!(stats.unknown_identifiers, stats.published);
    assert_eq!(stats.transient_failures, 0);
}
