use serde::{Deserialize, Serialize};

use crate::error::{Result, SentryError};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Cameras to ingest.
    pub cameras: Vec<CameraConfig>,
    /// Correlation engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Per-class detector thresholds and limits.
    #[serde(default)]
    pub detector: DetectorConfig,
    /// HTTP control/event API.
    #[serde(default)]
    pub api: ApiConfig,
    /// Monitor relationships registered at startup (also mutable via the
    /// control API).
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
}

/// Per-camera configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Unique identifier, stable for the camera's entire participation.
    pub camera_id: String,
    /// RTSP URL or local device index.
    pub source_url: String,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default = "default_resolution")]
    pub resolution: (u32, u32),
    #[serde(default = "default_buffer_depth")]
    pub buffer_depth: usize,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub detection_enabled: bool,
    /// Reconnect attempt limit before a `PermanentSource` error
    /// (0 = unlimited, used once `auto_reconnect` is true).
    #[serde(default = "default_max_initial_attempts")]
    pub max_initial_attempts: u32,
}

fn default_target_fps() -> u32 {
    15
}
fn default_resolution() -> (u32, u32) {
    (1280, 720)
}
fn default_buffer_depth() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_max_initial_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelationshipConfig {
    pub monitor_a: String,
    pub monitor_b: String,
    pub kind: crate::types::RelationshipKind,
    pub confidence_multiplier: f64,
}

/// Correlation Engine tuning (§4.3, §6).
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_min_correlation_confidence")]
    pub min_correlation_confidence: f64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_seconds: u64,
    #[serde(default = "default_handoff_timeout_secs")]
    pub handoff_timeout_seconds: u64,
    #[serde(default = "default_clock_skew_tolerance_ms")]
    pub clock_skew_tolerance_ms: u64,
    #[serde(default = "default_window_cap_per_monitor")]
    pub window_cap_per_monitor: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub weights: ScoreWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_correlation_confidence: default_min_correlation_confidence(),
            max_age_seconds: default_max_age_secs(),
            handoff_timeout_seconds: default_handoff_timeout_secs(),
            clock_skew_tolerance_ms: default_clock_skew_tolerance_ms(),
            window_cap_per_monitor: default_window_cap_per_monitor(),
            sweep_interval_ms: default_sweep_interval_ms(),
            weights: ScoreWeights::default(),
        }
    }
}

fn default_min_correlation_confidence() -> f64 {
    0.65
}
fn default_max_age_secs() -> u64 {
    300
}
fn default_handoff_timeout_secs() -> u64 {
    8
}
fn default_clock_skew_tolerance_ms() -> u64 {
    500
}
fn default_window_cap_per_monitor() -> usize {
    256
}
fn default_sweep_interval_ms() -> u64 {
    1000
}

/// The 5-factor score weights; must sum to `1.0 +/- 1e-6`.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ScoreWeights {
    #[serde(default = "default_weight_spatial")]
    pub spatial: f64,
    #[serde(default = "default_weight_temporal")]
    pub temporal: f64,
    #[serde(default = "default_weight_class")]
    pub class: f64,
    #[serde(default = "default_weight_features")]
    pub features: f64,
    #[serde(default = "default_weight_movement")]
    pub movement: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            spatial: default_weight_spatial(),
            temporal: default_weight_temporal(),
            class: default_weight_class(),
            features: default_weight_features(),
            movement: default_weight_movement(),
        }
    }
}

fn default_weight_spatial() -> f64 {
    0.30
}
fn default_weight_temporal() -> f64 {
    0.25
}
fn default_weight_class() -> f64 {
    0.20
}
fn default_weight_features() -> f64 {
    0.15
}
fn default_weight_movement() -> f64 {
    0.10
}

/// Per-class confidence thresholds and per-frame limits for the Detector.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_threshold_person")]
    pub threshold_person: f64,
    #[serde(default = "default_threshold_vehicle")]
    pub threshold_vehicle: f64,
    #[serde(default = "default_threshold_weapon")]
    pub threshold_weapon: f64,
    #[serde(default = "default_threshold_other")]
    pub threshold_other: f64,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold_person: default_threshold_person(),
            threshold_vehicle: default_threshold_vehicle(),
            threshold_weapon: default_threshold_weapon(),
            threshold_other: default_threshold_other(),
            max_detections: default_max_detections(),
        }
    }
}

fn default_threshold_person() -> f64 {
    0.5
}
fn default_threshold_vehicle() -> f64 {
    0.6
}
fn default_threshold_weapon() -> f64 {
    0.3
}
fn default_threshold_other() -> f64 {
    0.5
}
fn default_max_detections() -> usize {
    100
}

/// HTTP control/event API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            port: default_api_port(),
        }
    }
}

fn default_api_enabled() -> bool {
    true
}
fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SentryError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| SentryError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(SentryError::Config("No cameras defined".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(&cam.camera_id) {
                return Err(SentryError::Config(format!(
                    "Duplicate camera_id '{}'",
                    cam.camera_id
                )));
            }
            if cam.target_fps == 0 || cam.target_fps > 60 {
                return Err(SentryError::Config(format!(
                    "Camera '{}': target_fps must be in 1..=60",
                    cam.camera_id
                )));
            }
        }

        let w = &self.engine.weights;
        let sum = w.spatial + w.temporal + w.class + w.features + w.movement;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(SentryError::Config(format!(
                "Correlation score weights must sum to 1.0 (got {sum})"
            )));
        }

        if !(0.0..=1.0).contains(&self.engine.min_correlation_confidence) {
            return Err(SentryError::Config(
                "min_correlation_confidence must be in [0,1]".into(),
            ));
        }

        for rel in &self.relationships {
            if !(0.5..=2.0).contains(&rel.confidence_multiplier) {
                return Err(SentryError::Config(format!(
                    "Relationship ({}, {}) confidence_multiplier must be in [0.5, 2.0]",
                    rel.monitor_a, rel.monitor_b
                )));
            }
        }

        Ok(())
    }
}
