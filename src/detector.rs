//! Detector: turns a [`Frame`] into zero or more [`Observation`]s and
//! derives each observation's [`ThreatLevel`].
//!
//! Grounded on the original YOLO detection engine's threshold table and
//! class taxonomy (person/vehicle/weapon thresholds, per-frame cap), reread
//! here as a synchronous, pure `Detector` trait rather than a stateful
//! Python class so a frame-level model failure can never propagate to a
//! Stream Worker.

use chrono::{NaiveTime, Timelike};
use uuid::Uuid;

use crate::config::DetectorConfig;
use crate::error::{Result, SentryError};
use crate::types::{BBox, Frame, Observation, ObservationClass, ThreatEvent, ThreatLevel};

/// A pluggable object detector. Implementations must be deterministic for a
/// given frame and model state, and must never block on I/O.
pub trait Detector: Send + Sync {
    /// `Detect(frame) -> []Observation`. Below-threshold and over-capacity
    /// candidates are already pruned by the time this returns.
    fn detect(&self, frame: &Frame) -> Result<Vec<Observation>>;
}

/// A raw, un-thresholded candidate as an inference backend would produce it.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub class: ObservationClass,
    pub confidence: f64,
    pub bbox: BBox,
}

/// Applies per-class confidence thresholds and the per-frame detection cap
/// to a list of raw model outputs. Shared by every `Detector` implementation
/// so the admission rules live in exactly one place.
pub fn threshold_and_prune(
    config: &DetectorConfig,
    camera_id: &str,
    zone_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
    raw: Vec<RawDetection>,
) -> Vec<Observation> {
    let mut admitted: Vec<Observation> = raw
        .into_iter()
        .filter(|d| d.confidence >= threshold_for(config, d.class))
        .filter(|d| d.bbox.in_unit_square())
        .map(|d| Observation {
            observation_id: Uuid::new_v4(),
            camera_id: camera_id.to_string(),
            zone_id: zone_id.to_string(),
            class: d.class,
            confidence: d.confidence,
            bbox: d.bbox,
            movement_vector: None,
            features: None,
            timestamp,
        })
        .collect();

    admitted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
    admitted.truncate(config.max_detections);
    admitted
}

fn threshold_for(config: &DetectorConfig, class: ObservationClass) -> f64 {
    match class {
        ObservationClass::Person => config.threshold_person,
        ObservationClass::Vehicle => config.threshold_vehicle,
        ObservationClass::Weapon => config.threshold_weapon,
        ObservationClass::Package | ObservationClass::Animal | ObservationClass::Other => {
            config.threshold_other
        }
    }
}

/// Base risk anchor on the [0,10] scale before confidence scaling, one per
/// class. Weapon carries the engine's only CRITICAL-base class (the
/// original model's separate knife/gun subclasses collapse into `Weapon`
/// here; see the design ledger).
fn base_risk_anchor(class: ObservationClass) -> f64 {
    match class {
        ObservationClass::Weapon => 9.0,
        ObservationClass::Person | ObservationClass::Vehicle | ObservationClass::Package => 1.5,
        ObservationClass::Animal | ObservationClass::Other => 1.0,
    }
}

const NIGHT_BOOST: f64 = 2.0;

fn is_night(time_of_day: NaiveTime) -> bool {
    let hour = time_of_day.hour();
    !(6..22).contains(&hour)
}

/// Pure function mapping `(class, confidence, time_of_day)` to a threat
/// bucket. Independent of any `Detector` implementation so it stays
/// trivially testable.
pub fn threat_level(class: ObservationClass, confidence: f64, time_of_day: NaiveTime) -> ThreatLevel {
    let mut risk = base_risk_anchor(class) * confidence.clamp(0.0, 1.0);
    if is_night(time_of_day) {
        risk += NIGHT_BOOST;
    }
    let risk = risk.min(10.0);

    if risk >= 8.0 {
        ThreatLevel::Critical
    } else if risk >= 6.0 {
        ThreatLevel::High
    } else if risk >= 3.0 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    }
}

pub fn to_threat_event(observation: Observation) -> ThreatEvent {
    let time_of_day = observation.timestamp.time();
    let level = threat_level(observation.class, observation.confidence, time_of_day);
    ThreatEvent {
        observation,
        threat_level: level,
    }
}

/// Threshold-only detector backed by a caller-supplied raw-detection
/// producer. Represents the adapter over an external inference backend
/// (e.g. a YOLO-family model loaded at startup); the admission pipeline
/// (thresholds, cap, bbox validation) is identical regardless of backend.
pub struct ThresholdDetector<F>
where
    F: Fn(&Frame) -> Result<Vec<RawDetection>> + Send + Sync,
{
    config: DetectorConfig,
    infer: F,
}

impl<F> ThresholdDetector<F>
where
    F: Fn(&Frame) -> Result<Vec<RawDetection>> + Send + Sync,
{
    pub fn new(config: DetectorConfig, infer: F) -> Self {
        Self { config, infer }
    }
}

impl<F> Detector for ThresholdDetector<F>
where
    F: Fn(&Frame) -> Result<Vec<RawDetection>> + Send + Sync,
{
    fn detect(&self, frame: &Frame) -> Result<Vec<Observation>> {
        let raw = match (self.infer)(frame) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(camera = frame.camera_id, error = %e, "frame-level inference error");
                return Ok(Vec::new());
            }
        };
        Ok(threshold_and_prune(
            &self.config,
            &frame.camera_id,
            "default",
            frame.timestamp,
            raw,
        ))
    }
}

/// Fixed-output detector for tests and demos: always emits the same
/// detections it was constructed with, confidence-thresholded as usual.
pub struct StubDetector {
    config: DetectorConfig,
    fixed: Vec<RawDetection>,
}

impl StubDetector {
    pub fn new(config: DetectorConfig, fixed: Vec<RawDetection>) -> Self {
        Self { config, fixed }
    }

    pub fn failing() -> FailingDetector {
        FailingDetector
    }
}

impl Detector for StubDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Observation>> {
        Ok(threshold_and_prune(
            &self.config,
            &frame.camera_id,
            "default",
            frame.timestamp,
            self.fixed.clone(),
        ))
    }
}

/// Always returns a `Detector` error, for exercising the "model init
/// failure is fatal" path in the manager.
pub struct FailingDetector;

impl Detector for FailingDetector {
    fn detect(&self, _frame: &Frame) -> Result<Vec<Observation>> {
        Err(SentryError::Detector("model not loaded".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bbox() -> BBox {
        BBox {
            x: 0.1,
            y: 0.1,
            w: 0.2,
            h: 0.2,
        }
    }

    #[test]
    fn below_threshold_discarded() {
        let config = DetectorConfig::default();
        let raw = vec![RawDetection {
            class: ObservationClass::Person,
            confidence: 0.2,
            bbox: bbox(),
        }];
        let out = threshold_and_prune(&config, "cam0", "z", Utc::now(), raw);
        assert!(out.is_empty());
    }

    #[test]
    fn prunes_to_max_detections_by_confidence() {
        let mut config = DetectorConfig::default();
        config.max_detections = 2;
        config.threshold_person = 0.0;
        let raw = vec![
            RawDetection { class: ObservationClass::Person, confidence: 0.3, bbox: bbox() },
            RawDetection { class: ObservationClass::Person, confidence: 0.9, bbox: bbox() },
            RawDetection { class: ObservationClass::Person, confidence: 0.6, bbox: bbox() },
        ];
        let out = threshold_and_prune(&config, "cam0", "z", Utc::now(), raw);
        assert_eq!(out.len(), 2);
        assert!(out[0].confidence >= out[1].confidence);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn out_of_bounds_bbox_rejected() {
        let config = DetectorConfig::default();
        let raw = vec![RawDetection {
            class: ObservationClass::Person,
            confidence: 0.9,
            bbox: BBox { x: 0.9, y: 0.9, w: 0.5, h: 0.5 },
        }];
        let out = threshold_and_prune(&config, "cam0", "z", Utc::now(), raw);
        assert!(out.is_empty());
    }

    #[test]
    fn weapon_high_confidence_is_critical() {
        let level = threat_level(ObservationClass::Weapon, 0.95, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(level, ThreatLevel::Critical);
    }

    #[test]
    fn night_boost_raises_bucket() {
        let day = threat_level(ObservationClass::Person, 0.9, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        let night = threat_level(ObservationClass::Person, 0.9, NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert!(night >= day);
    }

    #[test]
    fn low_confidence_person_is_low() {
        let level = threat_level(ObservationClass::Person, 0.5, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(level, ThreatLevel::Low);
    }
}
