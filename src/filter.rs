//! Per-channel temporal filter: exponential moving average followed by a
//! slew-rate clamp on the output.
//!
//! The EMA suppresses sample-to-sample jitter; the clamp bounds how fast the
//! displayed value may move, measured against wall-clock time between calls.
//! One filter instance belongs to exactly one channel and is only touched by
//! that channel's acquisition thread.

use crate::config::FilterConfig;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterState {
    pub previous_value: f32,
    pub initialised: bool,
}

#[derive(Debug, Clone)]
pub struct TemporalFilter {
    config: FilterConfig,
    state: FilterState,
    last_update: Option<Instant>,
}

impl TemporalFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            state: FilterState::default(),
            last_update: None,
        }
    }

    /// Filter `raw` against the current wall clock.
    pub fn apply(&mut self, raw: f32) -> f32 {
        self.apply_at(raw, Instant::now())
    }

    /// Filter `raw` as if it was sampled at `now`.
    pub fn apply_at(&mut self, raw: f32, now: Instant) -> f32 {
        if !raw.is_finite() {
            // Rejected sample: hold the last output.
            return if self.state.initialised { self.state.previous_value } else { raw };
        }

        let raw = self.clamp_plausible(raw);

        if !self.state.initialised {
            self.state = FilterState { previous_value: raw, initialised: true };
            self.last_update = Some(now);
            return raw;
        }

        let previous = self.state.previous_value;
        let alpha = self.config.alpha;
        let ema = alpha * raw + (1.0 - alpha) * previous;

        let dt_s = self
            .last_update
            .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f32());
        let max_step = self.config.max_rate * dt_s;
        let output = previous + (ema - previous).clamp(-max_step, max_step);

        self.state.previous_value = output;
        self.last_update = Some(now);
        output
    }

    fn clamp_plausible(&self, raw: f32) -> f32 {
        let mut value = raw;
        if let Some(min) = self.config.plausible_min {
            value = value.max(min);
        }
        if let Some(max) = self.config.plausible_max {
            value = value.min(max);
        }
        value
    }

    pub fn reset(&mut self) {
        self.state = FilterState::default();
        self.last_update = None;
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn filter(max_rate: f32) -> TemporalFilter {
        TemporalFilter::new(FilterConfig::with_max_rate(max_rate))
    }

    #[test]
    fn test_first_sample_passes_through() {
        let mut f = filter(50.0);
        assert_eq!(f.apply_at(42.5, Instant::now()), 42.5);
        assert!(f.state().initialised);
    }

    #[test]
    fn test_ema_within_rate_limit() {
        let mut f = filter(1000.0);
        let t0 = Instant::now();
        f.apply_at(20.0, t0);
        let out = f.apply_at(30.0, t0 + Duration::from_secs(1));
        // 0.3 * 30 + 0.7 * 20
        assert!((out - 23.0).abs() < 1e-4);
    }

    #[test]
    fn test_zero_elapsed_time_holds_output() {
        let mut f = filter(50.0);
        let t0 = Instant::now();
        f.apply_at(20.0, t0);
        assert_eq!(f.apply_at(200.0, t0), 20.0);
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let mut f = filter(50.0);
        let t0 = Instant::now();
        f.apply_at(20.0, t0);
        assert_eq!(f.apply_at(f32::NAN, t0 + Duration::from_millis(100)), 20.0);
        assert_eq!(f.state().previous_value, 20.0);
    }

    #[test]
    fn test_reset_reseeds() {
        let mut f = filter(50.0);
        let t0 = Instant::now();
        f.apply_at(20.0, t0);
        f.reset();
        assert_eq!(f.apply_at(90.0, t0 + Duration::from_millis(10)), 90.0);
    }
}
