//! Thermal zone analysis for one tyre-facing infrared array.
//!
//! A frame is emissivity corrected, the tyre edges are located on the column
//! profile (with hysteresis against the previous frame), the span between the
//! edges is split into left/centre/right bands and each band is reduced to a
//! trimmed median. Everything runs over fixed-size stack buffers so a frame
//! never touches the heap.

use crate::config::ZoneConfig;
use arrayvec::ArrayVec;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const FRAME_ROWS: usize = 24;
pub const FRAME_COLS: usize = 32;
pub const FRAME_PIXELS: usize = FRAME_ROWS * FRAME_COLS;

/// Number of past edge positions used to judge edge stability.
pub const EDGE_HISTORY: usize = 8;

/// Narrowest tyre span (columns) that can still be split into three bands.
const MIN_SPAN_COLUMNS: usize = 3;

const KELVIN_OFFSET: f32 = 273.15;

const_assert!(FRAME_COLS <= u8::MAX as usize);
const_assert!(FRAME_COLS >= MIN_SPAN_COLUMNS);

type Scratch = ArrayVec<f32, FRAME_PIXELS>;

/// One 24 × 32 frame of temperatures in °C, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RawThermalFrame {
    pixels: [[f32; FRAME_COLS]; FRAME_ROWS],
}

impl Default for RawThermalFrame {
    fn default() -> Self {
        Self::filled(0.0)
    }
}

impl RawThermalFrame {
    pub fn filled(value: f32) -> Self {
        Self {
            pixels: [[value; FRAME_COLS]; FRAME_ROWS],
        }
    }

    pub fn from_fn(mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut frame = Self::filled(0.0);
        for (row, line) in frame.pixels.iter_mut().enumerate() {
            for (col, pixel) in line.iter_mut().enumerate() {
                *pixel = f(row, col);
            }
        }
        frame
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.pixels[row][col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.pixels[row][col] = value;
    }

    /// Set every row of `cols` to `value`.
    pub fn fill_columns(&mut self, cols: core::ops::Range<usize>, value: f32) {
        for line in &mut self.pixels {
            for pixel in &mut line[cols.clone()] {
                *pixel = value;
            }
        }
    }

    pub fn rows(&self) -> &[[f32; FRAME_COLS]; FRAME_ROWS] {
        &self.pixels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ZoneResult {
    pub left_median: f32,
    pub centre_median: f32,
    pub right_median: f32,
    /// `right_median - left_median`.
    pub lateral_gradient: f32,
    pub detected: bool,
    pub confidence: f32,
    /// Tyre width across the detected edges, in millimetres.
    pub estimated_width: f32,
    pub edge_left: u8,
    pub edge_right: u8,
}

impl ZoneResult {
    fn no_tyre(edges: (usize, usize)) -> Self {
        Self {
            edge_left: edges.0 as u8,
            edge_right: edges.1 as u8,
            ..Self::default()
        }
    }
}

/// Edge hysteresis state carried from one frame to the next.
#[derive(Debug, Clone)]
pub struct EdgeState {
    edges: Option<(u8, u8)>,
    history: Deque<(u8, u8), EDGE_HISTORY>,
}

impl Default for EdgeState {
    fn default() -> Self {
        Self {
            edges: None,
            history: Deque::new(),
        }
    }
}

impl EdgeState {
    pub fn edges(&self) -> Option<(u8, u8)> {
        self.edges
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn record(&mut self, edges: (usize, usize)) {
        let edges = (edges.0 as u8, edges.1 as u8);
        if self.history.is_full() {
            self.history.pop_front();
        }
        let _ = self.history.push_back(edges);
        self.edges = Some(edges);
    }

    /// Mean absolute deviation (columns) of the history from `edges`.
    fn deviation_from(&self, edges: (usize, usize)) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let total: f32 = self
            .history
            .iter()
            .map(|&(l, r)| {
                let dl = (f32::from(l) - edges.0 as f32).abs();
                let dr = (f32::from(r) - edges.1 as f32).abs();
                (dl + dr) * 0.5
            })
            .sum();
        total / self.history.len() as f32
    }
}

/// Zone processor bound to one physical sensor.
#[derive(Debug, Clone)]
pub struct ZoneProcessor {
    config: ZoneConfig,
    state: EdgeState,
}

impl ZoneProcessor {
    pub fn new(config: ZoneConfig) -> Self {
        Self {
            config,
            state: EdgeState::default(),
        }
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn edge_state(&self) -> &EdgeState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = EdgeState::default();
    }

    /// Adopt a successor state produced by [`ZoneProcessor::analyse`].
    pub fn commit(&mut self, state: EdgeState) {
        self.state = state;
    }

    /// Analyse `frame` against this processor's own edge state and keep the
    /// updated state for the next frame.
    pub fn process(&mut self, frame: &RawThermalFrame) -> ZoneResult {
        let (result, next) = self.analyse(frame, &self.state);
        self.state = next;
        result
    }

    /// True when `result` is a detection good enough to show.
    pub fn is_confident(&self, result: &ZoneResult) -> bool {
        result.detected && result.confidence >= self.config.min_confidence
    }

    /// Pure analysis step: the same frame and prior state always give the
    /// same result and successor state.
    pub fn analyse(&self, frame: &RawThermalFrame, prior: &EdgeState) -> (ZoneResult, EdgeState) {
        let fallback_edges = prior
            .edges
            .map_or((0, FRAME_COLS - 1), |(l, r)| (usize::from(l), usize::from(r)));

        let corrected = self.correct(frame);
        if !corrected.iter().flatten().any(|p| p.is_finite()) {
            return (ZoneResult::no_tyre(fallback_edges), prior.clone());
        }

        let profile = column_profile(&corrected);
        let found = find_edges(&profile, self.config.edge_threshold_c);
        let (left, right) = self.resolve_edges(found, prior, fallback_edges);

        let span = right - left + 1;
        let b1 = left + span / 3;
        let b2 = left + (2 * span) / 3;

        let trim = self.config.trim_fraction;
        let mut scratch = Scratch::new();

        let (left_median, left_count) = band_median(&corrected, left..b1, trim, &mut scratch);
        let (centre_median, centre_count) = band_median(&corrected, b1..b2, trim, &mut scratch);
        let (right_median, right_count) = band_median(&corrected, b2..right + 1, trim, &mut scratch);
        let (tyre_median, _) = band_median(&corrected, left..right + 1, trim, &mut scratch);

        collect_outside(&corrected, left, right, &mut scratch);
        let contrast = trimmed_median(&mut scratch, trim).map_or(0.0, |background| tyre_median - background);
        let detected = contrast > self.config.detection_contrast_c;

        let mut next = prior.clone();
        if detected && found.0.is_some() && found.1.is_some() {
            next.record((left, right));
        } else if detected {
            next.edges = Some((left as u8, right as u8));
        }

        let stability = 1.0 / (1.0 + next.deviation_from((left, right)));
        let min_count = left_count.min(centre_count).min(right_count);
        let pixel_factor = (min_count as f32 / f32::from(self.config.min_band_pixels)).min(1.0);
        let contrast_factor = (contrast / (2.0 * self.config.detection_contrast_c)).clamp(0.0, 1.0);
        let confidence = (stability * pixel_factor * contrast_factor).clamp(0.0, 1.0);

        let estimated_width = span as f32 * self.config.geometry.mm_per_column(FRAME_COLS);

        let result = ZoneResult {
            left_median,
            centre_median,
            right_median,
            lateral_gradient: right_median - left_median,
            detected,
            confidence,
            estimated_width,
            edge_left: left as u8,
            edge_right: right as u8,
        };

        (result, next)
    }

    /// Emissivity-corrected copy of the frame; fault pixels become NaN.
    fn correct(&self, frame: &RawThermalFrame) -> [[f32; FRAME_COLS]; FRAME_ROWS] {
        let cfg = &self.config;
        let factor = cfg.emissivity.powf(0.25);
        let needs_correction = (factor - 1.0).abs() > f32::EPSILON;

        let mut out = [[f32::NAN; FRAME_COLS]; FRAME_ROWS];
        for (dst, src) in out.iter_mut().zip(frame.rows()) {
            for (d, &raw) in dst.iter_mut().zip(src) {
                if raw.is_finite() && raw >= cfg.valid_min_c && raw <= cfg.valid_max_c {
                    *d = if needs_correction {
                        (raw + KELVIN_OFFSET) / factor - KELVIN_OFFSET
                    } else {
                        raw
                    };
                }
            }
        }
        out
    }

    fn resolve_edges(
        &self,
        found: (Option<usize>, Option<usize>),
        prior: &EdgeState,
        fallback: (usize, usize),
    ) -> (usize, usize) {
        let band = usize::from(self.config.hysteresis_columns);
        let prior_edges = prior.edges.map(|(l, r)| (usize::from(l), usize::from(r)));

        let hold = |new: Option<usize>, prev: Option<usize>, default: usize| match (new, prev) {
            (Some(new), Some(prev)) if new.abs_diff(prev) <= band => prev,
            (Some(new), _) => new,
            (None, Some(prev)) => prev,
            (None, None) => default,
        };

        let left = hold(found.0, prior_edges.map(|e| e.0), 0);
        let right = hold(found.1, prior_edges.map(|e| e.1), FRAME_COLS - 1);

        if right >= left && right - left + 1 >= MIN_SPAN_COLUMNS {
            (left, right)
        } else if fallback.1 >= fallback.0 && fallback.1 - fallback.0 + 1 >= MIN_SPAN_COLUMNS {
            fallback
        } else {
            (0, FRAME_COLS - 1)
        }
    }
}

/// Mean of valid pixels per column; NaN where a column has none.
fn column_profile(grid: &[[f32; FRAME_COLS]; FRAME_ROWS]) -> [f32; FRAME_COLS] {
    let mut profile = [f32::NAN; FRAME_COLS];
    for (col, out) in profile.iter_mut().enumerate() {
        let (sum, count) = grid
            .iter()
            .map(|row| row[col])
            .filter(|p| p.is_finite())
            .fold((0.0f32, 0u32), |(s, n), p| (s + p, n + 1));
        if count > 0 {
            *out = sum / count as f32;
        }
    }
    profile
}

/// First rising step from the left and first rising step from the right.
fn find_edges(profile: &[f32; FRAME_COLS], threshold: f32) -> (Option<usize>, Option<usize>) {
    let rises = |from: f32, to: f32| from.is_finite() && to.is_finite() && to - from > threshold;

    let left = (1..FRAME_COLS).find(|&c| rises(profile[c - 1], profile[c]));
    let right = (0..FRAME_COLS - 1).rev().find(|&c| rises(profile[c + 1], profile[c]));

    match (left, right) {
        (Some(l), Some(r)) if r < l => (None, None),
        edges => edges,
    }
}

fn band_median(
    grid: &[[f32; FRAME_COLS]; FRAME_ROWS],
    cols: core::ops::Range<usize>,
    trim: f32,
    scratch: &mut Scratch,
) -> (f32, usize) {
    scratch.clear();
    for row in grid {
        scratch.extend(row[cols.clone()].iter().copied().filter(|p| p.is_finite()));
    }
    let count = scratch.len();
    (trimmed_median(scratch, trim).unwrap_or(0.0), count)
}

fn collect_outside(grid: &[[f32; FRAME_COLS]; FRAME_ROWS], left: usize, right: usize, scratch: &mut Scratch) {
    scratch.clear();
    for row in grid {
        let outside = row[..left].iter().chain(&row[right + 1..]);
        scratch.extend(outside.copied().filter(|p| p.is_finite()));
    }
}

/// Median after discarding `trim` of the samples from each end.
pub fn trimmed_median(values: &mut [f32], trim: f32) -> Option<f32> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    values.sort_unstable_by(f32::total_cmp);

    let mut k = (n as f32 * trim).floor() as usize;
    if 2 * k >= n {
        k = (n - 1) / 2;
    }
    let kept = &values[k..n - k];
    let mid = kept.len() / 2;
    Some(if kept.len() % 2 == 0 {
        (kept[mid - 1] + kept[mid]) * 0.5
    } else {
        kept[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trimmed_median_rejects_hot_pixels() {
        let mut values = [20.0f32, 21.0, 22.0, 23.0, 24.0, 25.0, 26.0, 27.0, 28.0, 900.0];
        // one value trimmed from each end leaves 21..=28
        assert_eq!(trimmed_median(&mut values, 0.1), Some(24.5));
    }

    #[test]
    fn test_trimmed_median_small_samples() {
        let mut empty: [f32; 0] = [];
        let mut single = [7.0f32];
        let mut pair = [3.0f32, 1.0];
        assert_eq!(trimmed_median(&mut empty, 0.1), None);
        assert_eq!(trimmed_median(&mut single, 0.4), Some(7.0));
        assert_eq!(trimmed_median(&mut pair, 0.49), Some(2.0));
    }

    #[test]
    fn test_find_edges_on_step_profile() {
        let mut profile = [25.0; FRAME_COLS];
        for p in &mut profile[10..20] {
            *p = 90.0;
        }
        assert_eq!(find_edges(&profile, 8.0), (Some(10), Some(19)));
    }

    #[test]
    fn test_find_edges_flat_profile() {
        let profile = [40.0; FRAME_COLS];
        assert_eq!(find_edges(&profile, 8.0), (None, None));
    }

    #[test]
    fn test_column_profile_skips_faults() {
        let mut grid = [[50.0; FRAME_COLS]; FRAME_ROWS];
        grid[0][3] = f32::NAN;
        for row in &mut grid {
            row[5] = f32::NAN;
        }
        let profile = column_profile(&grid);
        assert_eq!(profile[3], 50.0);
        assert!(profile[5].is_nan());
    }
}
