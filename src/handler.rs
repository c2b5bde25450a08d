//! Per-sensor acquisition thread.
//!
//! A [`SensorHandler`] owns one [`Sensor`] and, while started, drives it from a
//! dedicated thread: probe, acquire at the poll interval, publish each reading
//! into a [`snapshot_channel`] and back off on failure. Consumers only ever
//! touch the reader half of the slot, so a slow or missing device can never
//! hold up the render loop.
//!
//! ```text
//!   Stopped ──start──▶ Initialising ──probe ok──▶ Running ◀──reprobe ok──┐
//!                           │                       │                    │
//!                           │ absent                │ N transient fails  │
//!                           ▼                       ▼                    │
//!                        Degraded ◀────────────── Degraded ──────────────┘
//!
//!   fatal error anywhere ──▶ Failed (terminal)
//! ```

use crate::config::HandlerConfig;
use crate::sensors::{ChannelId, DroppedFrames, Reading, Sensor, SensorError};
use crate::snapshot::{snapshot_channel, Snapshot, SnapshotReader, SnapshotWriter};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HandlerState {
    Stopped = 0,
    Initialising = 1,
    Running = 2,
    Degraded = 3,
    Failed = 4,
}

impl HandlerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HandlerState::Initialising,
            2 => HandlerState::Running,
            3 => HandlerState::Degraded,
            4 => HandlerState::Failed,
            _ => HandlerState::Stopped,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HandlerState::Stopped => "stopped",
            HandlerState::Initialising => "initialising",
            HandlerState::Running => "running",
            HandlerState::Degraded => "degraded",
            HandlerState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{channel}: handler already running")]
    AlreadyRunning { channel: ChannelId },

    #[error("{channel}: handler failed and cannot be restarted")]
    Failed { channel: ChannelId },

    #[error("{channel}: failed to spawn acquisition thread: {source}")]
    Spawn {
        channel: ChannelId,
        #[source]
        source: std::io::Error,
    },

    #[error("{channel}: acquisition thread did not stop within {timeout_ms}ms")]
    StopTimeout { channel: ChannelId, timeout_ms: u64 },

    #[error("{channel}: acquisition thread panicked")]
    Panicked { channel: ChannelId },
}

/// Point-in-time copy of a handler's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HandlerStats {
    pub published: u64,
    pub transient_failures: u64,
    pub malformed_frames: u64,
    pub unknown_identifiers: u64,
    pub deadline_misses: u64,
    pub probe_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    transient_failures: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_identifiers: AtomicU64,
    deadline_misses: AtomicU64,
    probe_attempts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add_dropped(&self, dropped: DroppedFrames) {
        self.malformed_frames.fetch_add(u64::from(dropped.malformed), Ordering::Relaxed);
        self.unknown_identifiers.fetch_add(u64::from(dropped.unknown), Ordering::Relaxed);
    }

    fn snapshot(&self) -> HandlerStats {
        HandlerStats {
            published: self.published.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_identifiers: self.unknown_identifiers.load(Ordering::Relaxed),
            deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
            probe_attempts: self.probe_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Timing of one successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSample {
    pub channel: ChannelId,
    /// Device read plus processing.
    pub acquisition: Duration,
    pub processing: Duration,
}

/// Receives timing samples from acquisition threads. Called on the hot path,
/// so implementations must not block.
pub trait TimingSink: Send + Sync {
    fn record(&self, sample: TimingSample);
}

struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Dropped when the acquisition thread exits, however it exits. Disconnecting
/// the channel is what `stop()` waits on.
struct ExitGuard {
    shared: Arc<Shared>,
    _exited: mpsc::Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.set_state(HandlerState::Failed);
        } else if self.shared.state() != HandlerState::Failed {
            self.shared.set_state(HandlerState::Stopped);
        }
    }
}

type Parts<S> = (S, SnapshotWriter<<S as Sensor>::Payload>);

struct Worker<S: Sensor> {
    thread: JoinHandle<Parts<S>>,
    exited: mpsc::Receiver<()>,
}

pub struct SensorHandler<S: Sensor> {
    channel: ChannelId,
    config: HandlerConfig,
    parts: Option<Parts<S>>,
    reader: SnapshotReader<S::Payload>,
    shared: Arc<Shared>,
    sink: Option<Arc<dyn TimingSink>>,
    worker: Option<Worker<S>>,
}

impl<S: Sensor> SensorHandler<S> {
    pub fn new(sensor: S, config: HandlerConfig) -> Self {
        let (writer, reader) = snapshot_channel();
        Self {
            channel: sensor.channel(),
            config,
            parts: Some((sensor, writer)),
            reader,
            shared: Arc::new(Shared {
                state: AtomicU8::new(HandlerState::Stopped as u8),
                stop: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            sink: None,
            worker: None,
        }
    }

    pub fn with_timing_sink(mut self, sink: Arc<dyn TimingSink>) -> Self {
        self.set_timing_sink(Some(sink));
        self
    }

    /// Takes effect at the next `start()`.
    pub fn set_timing_sink(&mut self, sink: Option<Arc<dyn TimingSink>>) {
        self.sink = sink;
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> HandlerState {
        self.shared.state()
    }

    pub fn stats(&self) -> HandlerStats {
        self.shared.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Most recent published snapshot, or `None` if nothing has been published
    /// yet. Never blocks and never fails.
    pub fn get_latest(&self) -> Option<Snapshot<S::Payload>> {
        self.reader.latest()
    }

    /// Reader half for consumers on other threads.
    pub fn reader(&self) -> SnapshotReader<S::Payload> {
        self.reader.clone()
    }

    pub fn start(&mut self) -> Result<(), HandlerError> {
        let channel = self.channel;
        if self.worker.is_some() {
            return Err(HandlerError::AlreadyRunning { channel });
        }
        if self.shared.state() == HandlerState::Failed {
            return Err(HandlerError::Failed { channel });
        }
        let Some((sensor, writer)) = self.parts.take() else {
            return Err(HandlerError::Failed { channel });
        };

        self.shared.stop.store(false, Ordering::Release);
        self.shared.set_state(HandlerState::Initialising);

        let (exited_tx, exited_rx) = mpsc::channel();
        let guard = ExitGuard {
            shared: Arc::clone(&self.shared),
            _exited: exited_tx,
        };
        let mut acquisition = AcquisitionLoop {
            channel,
            config: self.config,
            sensor,
            writer,
            shared: Arc::clone(&self.shared),
            sink: self.sink.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("acq-{}", channel))
            .spawn(move || {
                let _guard = guard;
                acquisition.run();
                (acquisition.sensor, acquisition.writer)
            });

        match spawned {
            Ok(thread) => {
                info!(channel = %channel, "acquisition started");
                self.worker = Some(Worker { thread, exited: exited_rx });
                Ok(())
            }
            Err(source) => {
                error!(channel = %channel, error = %source, "failed to spawn acquisition thread");
                self.shared.set_state(HandlerState::Failed);
                Err(HandlerError::Spawn { channel, source })
            }
        }
    }

    /// Ask the acquisition thread to exit and wait up to `stop_timeout_ms`.
    /// Stopping a handler that is not running is a no-op.
    pub fn stop(&mut self) -> Result<(), HandlerError> {
        let channel = self.channel;
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.shared.stop.store(true, Ordering::Release);
        worker.thread.thread().unpark();

        let timeout_ms = self.config.stop_timeout_ms;
        match worker.exited.recv_timeout(Duration::from_millis(timeout_ms)) {
            Err(RecvTimeoutError::Timeout) => {
                error!(channel = %channel, timeout_ms, "acquisition thread did not stop in time");
                // Keep the handle so a later stop() can still collect the thread.
                self.worker = Some(worker);
                Err(HandlerError::StopTimeout { channel, timeout_ms })
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match worker.thread.join() {
                Ok(parts) => {
                    self.parts = Some(parts);
                    info!(channel = %channel, state = %self.state(), "acquisition stopped");
                    Ok(())
                }
                Err(_) => {
                    error!(channel = %channel, "acquisition thread panicked");
                    self.shared.set_state(HandlerState::Failed);
                    Err(HandlerError::Panicked { channel })
                }
            },
        }
    }
}

impl<S: Sensor> Drop for SensorHandler<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(channel = %self.channel, error = %e, "handler dropped while running");
        }
    }
}

impl<S: Sensor> core::fmt::Debug for SensorHandler<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SensorHandler")
            .field("channel", &self.channel)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Outcome of one poll, as seen by the state machine.
enum Poll {
    Published,
    Skipped,
    Failed,
    Absent,
    Fatal,
}

struct AcquisitionLoop<S: Sensor> {
    channel: ChannelId,
    config: HandlerConfig,
    sensor: S,
    writer: SnapshotWriter<S::Payload>,
    shared: Arc<Shared>,
    sink: Option<Arc<dyn TimingSink>>,
}

impl<S: Sensor> AcquisitionLoop<S> {
    fn run(&mut self) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let backoff_initial = Duration::from_millis(self.config.backoff_initial_ms);
        let backoff_max = Duration::from_millis(self.config.backoff_max_ms);
        let reprobe_interval = Duration::from_millis(self.config.reprobe_interval_ms);

        match self.probe() {
            Ok(()) => self.transition(HandlerState::Running),
            Err(SensorError::Fatal(reason)) => {
                error!(channel = %self.channel, %reason, "sensor setup failed");
                self.transition(HandlerState::Failed);
                return;
            }
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "sensor not available, will re-probe");
                self.transition(HandlerState::Degraded);
            }
        }

        let mut failures = 0u32;
        let mut backoff = backoff_initial;

        while !self.shared.stop_requested() {
            if self.shared.state() == HandlerState::Degraded {
                self.sleep(reprobe_interval);
                if self.shared.stop_requested() {
                    break;
                }
                match self.probe() {
                    Ok(()) => {
                        failures = 0;
                        backoff = backoff_initial;
                        self.transition(HandlerState::Running);
                    }
                    Err(SensorError::Fatal(reason)) => {
                        error!(channel = %self.channel, %reason, "sensor failed during re-probe");
                        self.transition(HandlerState::Failed);
                        return;
                    }
                    Err(e) => debug!(channel = %self.channel, error = %e, "re-probe failed"),
                }
                continue;
            }

            let started = Instant::now();
            match self.poll(started) {
                Poll::Published => {
                    failures = 0;
                    backoff = backoff_initial;
                    self.sleep(poll_interval.saturating_sub(started.elapsed()));
                }
                // Neither a success nor a read failure: the streak stands.
                Poll::Skipped => self.sleep(poll_interval.saturating_sub(started.elapsed())),
                Poll::Failed => {
                    failures += 1;
                    if failures >= self.config.max_consecutive_failures {
                        warn!(channel = %self.channel, failures, "too many consecutive failures");
                        self.transition(HandlerState::Degraded);
                    } else {
                        self.sleep(backoff);
                        backoff = (backoff * 2).min(backoff_max);
                    }
                }
                Poll::Absent => {
                    warn!(channel = %self.channel, "sensor went away, will re-probe");
                    self.transition(HandlerState::Degraded);
                }
                Poll::Fatal => {
                    self.transition(HandlerState::Failed);
                    return;
                }
            }
        }
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        Counters::bump(&self.shared.counters.probe_attempts);
        self.sensor.probe()
    }

    fn poll(&mut self, started: Instant) -> Poll {
        let outcome = self.sensor.acquire();
        let dropped = self.sensor.take_dropped();
        let counters = &self.shared.counters;
        if !dropped.is_empty() {
            counters.add_dropped(dropped);
        }

        match outcome {
            Ok(reading) => {
                self.publish(reading, started);
                Poll::Published
            }
            Err(SensorError::Transient(reason)) => {
                Counters::bump(&counters.transient_failures);
                debug!(channel = %self.channel, %reason, "transient read failure");
                Poll::Failed
            }
            Err(SensorError::Absent(_)) => Poll::Absent,
            Err(SensorError::Fatal(reason)) => {
                error!(channel = %self.channel, %reason, "unrecoverable sensor error");
                Poll::Fatal
            }
            Err(SensorError::Decode(e)) => {
                let mut single = DroppedFrames::default();
                single.record(&e);
                counters.add_dropped(single);
                debug!(channel = %self.channel, error = %e, "dropping undecodable frame");
                Poll::Skipped
            }
            Err(SensorError::DeadlineExceeded { elapsed_us, budget_us }) => {
                Counters::bump(&counters.deadline_misses);
                debug!(channel = %self.channel, elapsed_us, budget_us, "frame over budget, skipped");
                Poll::Skipped
            }
        }
    }

    fn publish(&mut self, reading: Reading<S::Payload>, started: Instant) {
        let snapshot = self.writer.publish(reading.payload, reading.valid);
        Counters::bump(&self.shared.counters.published);

        if let Some(sink) = &self.sink {
            sink.record(TimingSample {
                channel: self.channel,
                acquisition: snapshot.timestamp.saturating_duration_since(started),
                processing: reading.processing,
            });
        }
    }

    fn transition(&self, next: HandlerState) {
        let previous = self.shared.state();
        if previous == next {
            return;
        }
        self.shared.set_state(next);
        match next {
            HandlerState::Running => info!(channel = %self.channel, from = %previous, "running"),
            HandlerState::Degraded => warn!(channel = %self.channel, from = %previous, "degraded"),
            HandlerState::Failed => error!(channel = %self.channel, from = %previous, "failed"),
            _ => debug!(channel = %self.channel, from = %previous, to = %next, "state change"),
        }
    }

    /// Sleep that returns early once a stop has been requested.
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shared.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            HandlerState::Stopped,
            HandlerState::Initialising,
            HandlerState::Running,
            HandlerState::Degraded,
            HandlerState::Failed,
        ] {
            assert_eq!(HandlerState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        Counters::bump(&counters.published);
        Counters::bump(&counters.published);
        Counters::bump(&counters.deadline_misses);
        let stats = counters.snapshot();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.deadline_misses, 1);
        assert_eq!(stats.transient_failures, 0);
    }

    #[test]
    fn test_dropped_frames_accumulate() {
        let counters = Counters::default();
        counters.add_dropped(DroppedFrames { malformed: 3, unknown: 1 });
        counters.add_dropped(DroppedFrames { malformed: 2, unknown: 0 });
        let stats = counters.snapshot();
        assert_eq!(stats.malformed_frames, 5);
        assert_eq!(stats.unknown_identifiers, 1);
    }
}
