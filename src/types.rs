//! Shared data model for the ingestion → detection → correlation pipeline.
//!
//! Observations never reference correlations and correlations reference
//! observations only by id, so the object graph stays acyclic end to end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Axis-aligned bounding box, normalized to `[0,1]^2` relative to frame size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn in_unit_square(&self) -> bool {
        (0.0..=1.0).contains(&self.x)
            && (0.0..=1.0).contains(&self.y)
            && (0.0..=1.0).contains(&(self.x + self.w))
            && (0.0..=1.0).contains(&(self.y + self.h))
    }
}

/// `(dx/dt, dy/dt)` in normalized units per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementVector {
    pub dx: f64,
    pub dy: f64,
}

/// A single decoded video frame produced by a Stream Worker.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    /// Strictly increasing per `camera_id`; restarts at 1 on every `Start`.
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Detection classes recognized by the Detector. Unknown upstream classes
/// are mapped to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationClass {
    Person,
    Vehicle,
    Weapon,
    Package,
    Animal,
    Other,
}

impl ObservationClass {
    /// Two classes are in the "same semantic group" when they're identical
    /// or both describe a person-shaped actor (person <-> person only, per
    /// spec; no other cross-class grouping is defined).
    pub fn semantic_group_matches(self, other: Self) -> bool {
        self == other
    }

    pub fn default_confidence_threshold(self) -> f64 {
        match self {
            ObservationClass::Person => 0.5,
            ObservationClass::Vehicle => 0.6,
            ObservationClass::Weapon => 0.3,
            ObservationClass::Package => 0.5,
            ObservationClass::Animal => 0.5,
            ObservationClass::Other => 0.5,
        }
    }
}

/// One detection in one frame on one camera, produced by the Detector and
/// admitted into the Correlation Engine's per-monitor window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub observation_id: Uuid,
    pub camera_id: String,
    pub zone_id: String,
    pub class: ObservationClass,
    pub confidence: f64,
    pub bbox: BBox,
    pub movement_vector: Option<MovementVector>,
    /// Opaque embedding used for the `features` scoring factor. `None`
    /// when the extractor is disabled (spec §9 Open Questions).
    pub features: Option<Vec<f32>>,
    pub timestamp: DateTime<Utc>,
}

/// A declared spatial relationship between two cameras. Registration is
/// always symmetric: registering `(a, b)` implicitly registers `(b, a)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Adjacent,
    Sequential,
    Overlapping,
    Unrelated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRelationship {
    pub monitor_a: String,
    pub monitor_b: String,
    pub kind: RelationshipKind,
    pub confidence_multiplier: f64,
}

/// State of a cross-camera track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationState {
    Open,
    Closed,
}

/// An ordered set of observations on two or more distinct cameras believed
/// to represent one physical actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub correlation_id: Uuid,
    pub observation_ids: Vec<Uuid>,
    pub cameras: Vec<String>,
    pub confidence_score: f64,
    pub opened_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub state: CorrelationState,
    /// Number of join events folded into `confidence_score`'s running mean.
    pub join_count: u64,
}

/// Derived severity bucket assigned by the Detector adapter before engine
/// admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Wraps an `Observation` with its derived threat level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub observation: Observation,
    pub threat_level: ThreatLevel,
}

/// Score breakdown for a successful (or attempted) correlation join.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub spatial: f64,
    pub temporal: f64,
    pub class: f64,
    pub features: f64,
    pub movement: f64,
    pub total: f64,
}

/// What kind of correlation lifecycle transition produced a `CorrelationEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationEventKind {
    Opened,
    Extended,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationEvent {
    pub kind: CorrelationEventKind,
    pub correlation_id: Uuid,
    pub observation_ids: Vec<Uuid>,
    pub confidence_score: f64,
    pub factors: Option<ScoreBreakdown>,
}

/// Stream Worker lifecycle state. Only `Running` emits frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
    Terminated,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Connecting => "connecting",
            WorkerState::Running => "running",
            WorkerState::Reconnecting => "reconnecting",
            WorkerState::Stopping => "stopping",
            WorkerState::Terminated => "terminated",
        }
    }
}

/// Runtime statistics for a single Stream Worker, returned by `Stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub connected: bool,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub fps_actual: f64,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
}

/// Top-level event envelope pushed to subscribers (§6 event stream).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventEnvelope {
    Observation {
        timestamp: DateTime<Utc>,
        payload: Observation,
    },
    ThreatEvent {
        timestamp: DateTime<Utc>,
        payload: ThreatEvent,
    },
    CorrelationOpened {
        timestamp: DateTime<Utc>,
        payload: CorrelationEvent,
    },
    CorrelationExtended {
        timestamp: DateTime<Utc>,
        payload: CorrelationEvent,
    },
    CorrelationClosed {
        timestamp: DateTime<Utc>,
        payload: CorrelationEvent,
    },
    WorkerStatus {
        timestamp: DateTime<Utc>,
        camera_id: String,
        state: String,
        stats: WorkerStats,
    },
}
