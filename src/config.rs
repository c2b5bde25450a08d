//! Immutable configuration handed to every sensor, processor and handler at
//! construction time.
//!
//! Values are plain `serde` structs with defaults taken from the constants
//! below. Nothing in the crate reads configuration from a global; callers
//! build a [`Config`] (usually via [`Config::from_json_str`]) and pass the
//! relevant section down.

use crate::protocol::Corner;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Temporal filter defaults
pub const DEFAULT_EMA_ALPHA: f32 = 0.3;
pub const DEFAULT_TYRE_MAX_RATE: f32 = 50.0;      // °C per second
pub const DEFAULT_BRAKE_MAX_RATE: f32 = 400.0;    // °C per second, discs heat fast
pub const DEFAULT_PRESSURE_MAX_RATE: f32 = 20.0;  // kPa per second

// Zone analysis defaults
pub const DEFAULT_EMISSIVITY: f32 = 0.95;
pub const DEFAULT_EDGE_THRESHOLD_C: f32 = 8.0;
pub const DEFAULT_HYSTERESIS_COLUMNS: u8 = 2;
pub const DEFAULT_TRIM_FRACTION: f32 = 0.10;
pub const DEFAULT_DETECTION_CONTRAST_C: f32 = 5.0;
pub const DEFAULT_MIN_BAND_PIXELS: u16 = 48;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_VALID_MIN_C: f32 = -40.0;
pub const DEFAULT_VALID_MAX_C: f32 = 300.0;
pub const DEFAULT_PROCESSING_BUDGET_US: u32 = 1000;

// Sensor geometry (MLX90640 narrow lens, mounted under the wheel arch)
pub const DEFAULT_FOV_DEG: f32 = 55.0;
pub const DEFAULT_DISTANCE_MM: f32 = 200.0;

// Handler timing
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 10;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 1000;
pub const DEFAULT_REPROBE_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },

    #[error("configuration parse error: {0}")]
    Parse(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}

/// Smoothing and plausibility limits for one scalar channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub alpha: f32,
    /// Maximum change of the filtered output per second.
    pub max_rate: f32,
    /// Raw readings are clamped into this range before smoothing.
    pub plausible_min: Option<f32>,
    pub plausible_max: Option<f32>,
}

impl FilterConfig {
    pub fn with_max_rate(max_rate: f32) -> Self {
        Self { max_rate, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(ConfigError::invalid("filter.alpha", "must be in (0, 1]"));
        }
        if !(self.max_rate.is_finite() && self.max_rate > 0.0) {
            return Err(ConfigError::invalid("filter.max_rate", "must be a positive finite rate"));
        }
        if let (Some(min), Some(max)) = (self.plausible_min, self.plausible_max) {
            if min >= max {
                return Err(ConfigError::invalid("filter.plausible_min", "must be below plausible_max"));
            }
        }
        Ok(())
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_EMA_ALPHA,
            max_rate: DEFAULT_TYRE_MAX_RATE,
            plausible_min: None,
            plausible_max: None,
        }
    }
}

/// Thermal camera field of view and mounting distance, used to turn a column
/// span into a physical width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    pub fov_deg: f32,
    pub distance_mm: f32,
}

impl GeometryConfig {
    /// Width of the tyre surface covered by one sensor column.
    pub fn mm_per_column(&self, columns: usize) -> f32 {
        let half_fov = (self.fov_deg * 0.5).to_radians();
        2.0 * self.distance_mm * half_fov.tan() / columns as f32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fov_deg > 0.0 && self.fov_deg < 180.0) {
            return Err(ConfigError::invalid("geometry.fov_deg", "must be in (0, 180)"));
        }
        if !(self.distance_mm > 0.0) {
            return Err(ConfigError::invalid("geometry.distance_mm", "must be positive"));
        }
        Ok(())
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            fov_deg: DEFAULT_FOV_DEG,
            distance_mm: DEFAULT_DISTANCE_MM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub emissivity: f32,
    /// Column-to-column rise (°C) that marks a tyre edge.
    pub edge_threshold_c: f32,
    pub hysteresis_columns: u8,
    /// Fraction of samples discarded from each end before taking the median.
    pub trim_fraction: f32,
    /// Tyre minus background contrast required for `detected`.
    pub detection_contrast_c: f32,
    /// Band pixel count at which the pixel factor of confidence saturates.
    pub min_band_pixels: u16,
    pub min_confidence: f32,
    pub valid_min_c: f32,
    pub valid_max_c: f32,
    pub processing_budget_us: u32,
    pub geometry: GeometryConfig,
}

impl ZoneConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.emissivity > 0.0 && self.emissivity <= 1.0) {
            return Err(ConfigError::invalid("zone.emissivity", "must be in (0, 1]"));
        }
        if !(self.edge_threshold_c > 0.0) {
            return Err(ConfigError::invalid("zone.edge_threshold_c", "must be positive"));
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(ConfigError::invalid("zone.trim_fraction", "must be in [0, 0.5)"));
        }
        if !(self.detection_contrast_c > 0.0) {
            return Err(ConfigError::invalid("zone.detection_contrast_c", "must be positive"));
        }
        if self.min_band_pixels == 0 {
            return Err(ConfigError::invalid("zone.min_band_pixels", "must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid("zone.min_confidence", "must be in [0, 1]"));
        }
        if self.valid_min_c >= self.valid_max_c {
            return Err(ConfigError::invalid("zone.valid_min_c", "must be below valid_max_c"));
        }
        if self.processing_budget_us == 0 {
            return Err(ConfigError::invalid("zone.processing_budget_us", "must be non-zero"));
        }
        self.geometry.validate()
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            emissivity: DEFAULT_EMISSIVITY,
            edge_threshold_c: DEFAULT_EDGE_THRESHOLD_C,
            hysteresis_columns: DEFAULT_HYSTERESIS_COLUMNS,
            trim_fraction: DEFAULT_TRIM_FRACTION,
            detection_contrast_c: DEFAULT_DETECTION_CONTRAST_C,
            min_band_pixels: DEFAULT_MIN_BAND_PIXELS,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            valid_min_c: DEFAULT_VALID_MIN_C,
            valid_max_c: DEFAULT_VALID_MAX_C,
            processing_budget_us: DEFAULT_PROCESSING_BUDGET_US,
            geometry: GeometryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub poll_interval_ms: u64,
    /// Consecutive transient failures tolerated before entering `Degraded`.
    pub max_consecutive_failures: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub reprobe_interval_ms: u64,
    pub stop_timeout_ms: u64,
}

impl HandlerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid("handler.max_consecutive_failures", "must be non-zero"));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::invalid("handler.backoff_initial_ms", "must be in 1..=backoff_max_ms"));
        }
        if self.stop_timeout_ms == 0 {
            return Err(ConfigError::invalid("handler.stop_timeout_ms", "must be non-zero"));
        }
        Ok(())
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            reprobe_interval_ms: DEFAULT_REPROBE_INTERVAL_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
        }
    }
}

/// Which sensors are fitted at one corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CornerConfig {
    pub thermal_enabled: bool,
    pub pressure_enabled: bool,
    pub brake_enabled: bool,
    pub bus_node_enabled: bool,
    /// Request a full frame from the corner node this often; `None` disables
    /// host-side analysis of node frames.
    pub frame_request_interval_ms: Option<u64>,
}

impl Default for CornerConfig {
    fn default() -> Self {
        Self {
            thermal_enabled: true,
            pressure_enabled: true,
            brake_enabled: true,
            bus_node_enabled: false,
            frame_request_interval_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub handler: HandlerConfig,
    pub zone: ZoneConfig,
    pub tyre_filter: FilterConfig,
    pub brake_filter: FilterConfig,
    pub pressure_filter: FilterConfig,
    /// Indexed by [`Corner::index`].
    pub corners: [CornerConfig; 4],
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn corner(&self, corner: Corner) -> &CornerConfig {
        &self.corners[corner.index()]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.handler.validate()?;
        self.zone.validate()?;
        self.tyre_filter.validate()?;
        self.brake_filter.validate()?;
        self.pressure_filter.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handler: HandlerConfig::default(),
            zone: ZoneConfig::default(),
            tyre_filter: FilterConfig {
                plausible_min: Some(DEFAULT_VALID_MIN_C),
                plausible_max: Some(DEFAULT_VALID_MAX_C),
                ..FilterConfig::with_max_rate(DEFAULT_TYRE_MAX_RATE)
            },
            brake_filter: FilterConfig {
                plausible_min: Some(-40.0),
                plausible_max: Some(1200.0),
                ..FilterConfig::with_max_rate(DEFAULT_BRAKE_MAX_RATE)
            },
            pressure_filter: FilterConfig {
                plausible_min: Some(0.0),
                plausible_max: Some(600.0),
                ..FilterConfig::with_max_rate(DEFAULT_PRESSURE_MAX_RATE)
            },
            corners: [CornerConfig::default(); 4],
        }
    }
}
