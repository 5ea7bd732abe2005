//! Threat Correlation Engine — the single serialization domain that decides
//! whether an incoming observation extends a cross-camera track.
//!
//! Structured after the storage layer's global writer: one task owns all
//! mutable state and every caller talks to it through a channel, so the
//! window/correlations/index invariants never need a lock. Unlike the
//! writer's fire-and-forget `WriteRequest`, `Analyze` needs a reply, so each
//! request carries a `oneshot::Sender` back to the caller.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, RelationshipConfig};
use crate::error::{Result, SentryError};
use crate::types::{
    Correlation, CorrelationEvent, CorrelationEventKind, CorrelationState, MonitorRelationship,
    Observation, RelationshipKind, ScoreBreakdown,
};
use crate::util::EvictingQueue;

/// Outcome of a successful `Analyze` call: the (possibly newly opened)
/// correlation plus the factor breakdown that produced the join.
#[derive(Debug, Clone)]
pub struct AnalyzeOutcome {
    pub correlation: Correlation,
    pub breakdown: ScoreBreakdown,
}

enum Command {
    Analyze(Observation, oneshot::Sender<Result<Option<AnalyzeOutcome>>>),
    RegisterRelationship(MonitorRelationship, oneshot::Sender<Result<()>>),
    Stats(oneshot::Sender<EngineStats>),
    Sweep,
    Shutdown,
}

/// Aggregate engine statistics returned by `GET /stats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineStats {
    pub open_correlations: u64,
    pub closed_correlations: u64,
    pub observations_seen: u64,
    pub joins: u64,
    pub avg_processing_time_ms: f64,
}

/// Handle to a running engine. Cheap to clone; every clone talks to the same
/// serialization domain.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    invariant_violation: watch::Receiver<Option<String>>,
}

impl EngineHandle {
    /// Watch channel a supervisor can observe independent of any in-flight
    /// `Analyze` call. Fires once the engine's own bookkeeping has diverged
    /// and the task has stopped serving requests; the caller is expected to
    /// treat this as fatal (spec'd exit code 3).
    pub fn invariant_violations(&self) -> watch::Receiver<Option<String>> {
        self.invariant_violation.clone()
    }
    pub async fn analyze(&self, observation: Observation) -> Result<Option<AnalyzeOutcome>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Analyze(observation, reply_tx))
            .await
            .map_err(|_| SentryError::EngineInvariantViolation("engine task not running".into()))?;
        reply_rx
            .await
            .map_err(|_| SentryError::EngineInvariantViolation("engine dropped reply channel".into()))?
    }

    pub async fn register_relationship(&self, rel: MonitorRelationship) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::RegisterRelationship(rel, reply_tx))
            .await
            .map_err(|_| SentryError::EngineInvariantViolation("engine task not running".into()))?;
        reply_rx
            .await
            .map_err(|_| SentryError::EngineInvariantViolation("engine dropped reply channel".into()))?
    }

    pub async fn stats(&self) -> EngineStats {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Stats(reply_tx)).await.is_err() {
            return EngineStats::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

fn normalize_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

struct EngineState {
    config: EngineConfig,
    relationships: HashMap<(String, String), MonitorRelationship>,
    window: HashMap<String, VecDeque<Observation>>,
    correlations: HashMap<Uuid, Correlation>,
    index: HashMap<Uuid, Uuid>,
    stats: EngineStats,
    ema_processing_ms: f64,
}

impl EngineState {
    fn new(config: EngineConfig, seed_relationships: Vec<RelationshipConfig>) -> Self {
        let mut relationships = HashMap::new();
        for r in seed_relationships {
            let key = normalize_pair(&r.monitor_a, &r.monitor_b);
            relationships.insert(
                key,
                MonitorRelationship {
                    monitor_a: r.monitor_a,
                    monitor_b: r.monitor_b,
                    kind: r.kind,
                    confidence_multiplier: r.confidence_multiplier,
                },
            );
        }
        Self {
            config,
            relationships,
            window: HashMap::new(),
            correlations: HashMap::new(),
            index: HashMap::new(),
            stats: EngineStats::default(),
            ema_processing_ms: 0.0,
        }
    }

    fn register_relationship(&mut self, rel: MonitorRelationship) -> Result<()> {
        if !(0.0..=2.0).contains(&rel.confidence_multiplier) {
            return Err(SentryError::Config(
                "confidence_multiplier out of range".into(),
            ));
        }
        let key = normalize_pair(&rel.monitor_a, &rel.monitor_b);
        self.relationships.insert(key, rel);
        Ok(())
    }

    fn evict_window(&mut self, camera_id: &str, now: DateTime<Utc>) {
        let max_age = chrono::Duration::seconds(self.config.max_age_seconds as i64);
        if let Some(w) = self.window.get_mut(camera_id) {
            while let Some(front) = w.front() {
                if now - front.timestamp > max_age {
                    w.pop_front();
                } else {
                    break;
                }
            }
            while w.len() > self.config.window_cap_per_monitor {
                w.pop_front();
            }
        }
    }

    fn relationship_for(&self, a: &str, b: &str) -> Option<&MonitorRelationship> {
        self.relationships.get(&normalize_pair(a, b))
    }

    fn candidate_set<'a>(&'a self, observation: &Observation) -> Vec<&'a Observation> {
        let handoff = chrono::Duration::milliseconds(
            (self.config.handoff_timeout_seconds as i64) * 1000,
        );
        let mut out = Vec::new();
        for (monitor, obs_list) in &self.window {
            if monitor == &observation.camera_id {
                continue;
            }
            let Some(rel) = self.relationship_for(monitor, &observation.camera_id) else {
                continue;
            };
            if rel.kind == RelationshipKind::Unrelated {
                continue;
            }
            for o in obs_list {
                if (observation.timestamp - o.timestamp).abs() <= handoff {
                    out.push(o);
                }
            }
        }
        out
    }

    fn score(&self, o_prime: &Observation, observation: &Observation, rel: &MonitorRelationship) -> (f64, ScoreBreakdown) {
        let spatial = spatial_factor(o_prime, observation, rel);
        let temporal = temporal_factor(o_prime, observation, &self.config);
        let class = class_factor(o_prime, observation);
        let features = features_factor(o_prime, observation);
        let movement = movement_factor(o_prime, observation);

        let w = &self.config.weights;
        let raw = w.spatial * spatial
            + w.temporal * temporal
            + w.class * class
            + w.features * features
            + w.movement * movement;
        let total = (raw * rel.confidence_multiplier).clamp(0.0, 1.0);

        (
            total,
            ScoreBreakdown {
                spatial,
                temporal,
                class,
                features,
                movement,
                total,
            },
        )
    }

    /// Self-check: every `index` entry must point at a live correlation.
    /// A violation here means the engine's own bookkeeping has diverged
    /// from its data and is never safe to keep running on.
    fn check_invariants(&self) -> Result<()> {
        for (obs_id, corr_id) in &self.index {
            if !self.correlations.contains_key(corr_id) {
                return Err(SentryError::EngineInvariantViolation(format!(
                    "index entry for observation {obs_id} points at missing correlation {corr_id}"
                )));
            }
        }
        Ok(())
    }

    fn analyze(&mut self, observation: Observation) -> Result<Option<AnalyzeOutcome>> {
        let start = Instant::now();
        self.check_invariants()?;

        self.stats.observations_seen += 1;
        let camera_id = observation.camera_id.clone();
        self.window
            .entry(camera_id.clone())
            .or_default()
            .push_back(observation.clone());
        self.evict_window(&camera_id, observation.timestamp);

        let candidates = self.candidate_set(&observation);
        if candidates.is_empty() {
            self.record_processing_time(start);
            return Ok(None);
        }

        let mut best: Option<(Uuid, f64, ScoreBreakdown, DateTime<Utc>, f64)> = None;
        for o_prime in candidates {
            let Some(rel) = self.relationship_for(&o_prime.camera_id, &observation.camera_id) else {
                continue;
            };
            let (score, breakdown) = self.score(o_prime, &observation, rel);
            let replace = match &best {
                None => true,
                Some((_, best_score, _, best_ts, best_mult)) => {
                    if score > *best_score {
                        true
                    } else if (score - *best_score).abs() < 1e-9 {
                        if o_prime.timestamp > *best_ts {
                            true
                        } else if o_prime.timestamp == *best_ts {
                            rel.confidence_multiplier > *best_mult
                        } else {
                            false
                        }
                    } else {
                        false
                    }
                }
            };
            if replace {
                best = Some((
                    o_prime.observation_id,
                    score,
                    breakdown,
                    o_prime.timestamp,
                    rel.confidence_multiplier,
                ));
            }
        }

        let Some((best_id, score, breakdown, _, _)) = best else {
            self.record_processing_time(start);
            return Ok(None);
        };

        if score < self.config.min_correlation_confidence {
            self.record_processing_time(start);
            return Ok(None);
        }

        let outcome = self.join(best_id, &observation, score, breakdown)?;
        self.record_processing_time(start);
        Ok(Some(outcome))
    }

    fn join(
        &mut self,
        matched_id: Uuid,
        observation: &Observation,
        score: f64,
        breakdown: ScoreBreakdown,
    ) -> Result<AnalyzeOutcome> {
        if let Some(&corr_id) = self.index.get(&matched_id) {
            let corr = self
                .correlations
                .get_mut(&corr_id)
                .ok_or_else(|| {
                    SentryError::EngineInvariantViolation(format!(
                        "index pointed at missing correlation {corr_id}"
                    ))
                })?;
            corr.observation_ids.push(observation.observation_id);
            if !corr.cameras.contains(&observation.camera_id) {
                corr.cameras.push(observation.camera_id.clone());
            }
            corr.confidence_score =
                (corr.confidence_score * corr.join_count as f64 + score) / (corr.join_count as f64 + 1.0);
            corr.join_count += 1;
            corr.last_updated = observation.timestamp;
            corr.state = CorrelationState::Open;
            self.index.insert(observation.observation_id, corr_id);
            self.stats.joins += 1;

            Ok(AnalyzeOutcome {
                correlation: corr.clone(),
                breakdown,
            })
        } else {
            let matched = self
                .window
                .values()
                .flatten()
                .find(|o| o.observation_id == matched_id)
                .cloned()
                .ok_or_else(|| {
                    SentryError::EngineInvariantViolation(
                        "best candidate vanished from window before join".into(),
                    )
                })?;

            let corr_id = Uuid::new_v4();
            let corr = Correlation {
                correlation_id: corr_id,
                observation_ids: vec![matched.observation_id, observation.observation_id],
                cameras: vec![matched.camera_id.clone(), observation.camera_id.clone()],
                confidence_score: score,
                opened_at: observation.timestamp,
                last_updated: observation.timestamp,
                state: CorrelationState::Open,
                join_count: 1,
            };
            self.correlations.insert(corr_id, corr.clone());
            self.index.insert(matched.observation_id, corr_id);
            self.index.insert(observation.observation_id, corr_id);
            self.stats.joins += 1;

            Ok(AnalyzeOutcome {
                correlation: corr,
                breakdown,
            })
        }
    }

    fn record_processing_time(&mut self, start: Instant) {
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        const ALPHA: f64 = 0.2;
        self.ema_processing_ms = if self.ema_processing_ms == 0.0 {
            ms
        } else {
            ALPHA * ms + (1.0 - ALPHA) * self.ema_processing_ms
        };
        self.stats.avg_processing_time_ms = self.ema_processing_ms;
        if ms > 500.0 {
            warn!(processing_time_ms = ms, "Analyze exceeded 500ms latency target");
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> Vec<CorrelationEvent> {
        let handoff = chrono::Duration::seconds(self.config.handoff_timeout_seconds as i64);
        let mut closed_events = Vec::new();

        for corr in self.correlations.values_mut() {
            if corr.state == CorrelationState::Open && now - corr.last_updated > handoff {
                corr.state = CorrelationState::Closed;
                self.stats.closed_correlations += 1;
                closed_events.push(CorrelationEvent {
                    kind: CorrelationEventKind::Closed,
                    correlation_id: corr.correlation_id,
                    observation_ids: corr.observation_ids.clone(),
                    confidence_score: corr.confidence_score,
                    factors: None,
                });
            }
        }

        for corr in self.correlations.values() {
            if corr.state == CorrelationState::Closed {
                for obs_id in &corr.observation_ids {
                    self.index.remove(obs_id);
                }
            }
        }

        let cameras: Vec<String> = self.window.keys().cloned().collect();
        for cam in cameras {
            self.evict_window(&cam, now);
        }

        self.stats.open_correlations = self
            .correlations
            .values()
            .filter(|c| c.state == CorrelationState::Open)
            .count() as u64;

        closed_events
    }
}

fn spatial_factor(o_prime: &Observation, observation: &Observation, rel: &MonitorRelationship) -> f64 {
    let (ax, ay) = o_prime.bbox.center();
    let (bx, by) = observation.bbox.center();
    let (dx, dy) = (bx - ax, by - ay);
    let raw_distance = (dx * dx + dy * dy).sqrt();
    let normalized_distance = (raw_distance / std::f64::consts::SQRT_2).min(1.0);
    let base = 1.0 - normalized_distance;

    match rel.kind {
        RelationshipKind::Adjacent => base,
        RelationshipKind::Overlapping => (base + 0.1).min(1.0),
        RelationshipKind::Sequential => match observation.movement_vector {
            Some(mv) => {
                let mv_len = (mv.dx * mv.dx + mv.dy * mv.dy).sqrt();
                if mv_len < 1e-9 || raw_distance < 1e-9 {
                    base
                } else {
                    let cos_align = (mv.dx * dx + mv.dy * dy) / (mv_len * raw_distance);
                    (base * (0.5 + 0.5 * cos_align.clamp(-1.0, 1.0))).clamp(0.0, 1.0)
                }
            }
            None => base,
        },
        RelationshipKind::Unrelated => 0.0,
    }
}

fn temporal_factor(o_prime: &Observation, observation: &Observation, config: &EngineConfig) -> f64 {
    let dt_ms = (observation.timestamp - o_prime.timestamp).num_milliseconds().unsigned_abs() as f64;
    let tolerance_ms = config.clock_skew_tolerance_ms as f64;
    let effective_ms = (dt_ms - tolerance_ms).max(0.0);
    let handoff_ms = (config.handoff_timeout_seconds as f64) * 1000.0;
    (1.0 - effective_ms / handoff_ms).max(0.0)
}

fn class_factor(o_prime: &Observation, observation: &Observation) -> f64 {
    if o_prime.class == observation.class {
        1.0
    } else if o_prime.class.semantic_group_matches(observation.class) {
        0.5
    } else {
        0.0
    }
}

fn features_factor(o_prime: &Observation, observation: &Observation) -> f64 {
    match (&o_prime.features, &observation.features) {
        (Some(a), Some(b)) if a.len() == b.len() && !a.is_empty() => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na < f32::EPSILON || nb < f32::EPSILON {
                0.5
            } else {
                ((dot / (na * nb)) as f64).clamp(-1.0, 1.0).max(0.0)
            }
        }
        _ => 0.5,
    }
}

fn movement_factor(o_prime: &Observation, observation: &Observation) -> f64 {
    match (o_prime.movement_vector, observation.movement_vector) {
        (Some(a), Some(b)) => {
            let len_a = (a.dx * a.dx + a.dy * a.dy).sqrt();
            let len_b = (b.dx * b.dx + b.dy * b.dy).sqrt();
            if len_a < 1e-9 || len_b < 1e-9 {
                0.5
            } else {
                let cos_theta = (a.dx * b.dx + a.dy * b.dy) / (len_a * len_b);
                0.5 * (1.0 + cos_theta.clamp(-1.0, 1.0))
            }
        }
        _ => 0.5,
    }
}

/// Spawn the engine's serialization-domain task. Mirrors the storage
/// layer's `spawn_writer`: returns a cheap-to-clone handle, the closed-over
/// state lives only inside the task, and a sweeper fires on its own timer
/// by sending itself `Command::Sweep` through the same channel.
pub fn spawn_engine(
    config: EngineConfig,
    seed_relationships: Vec<RelationshipConfig>,
    events_out: Arc<EvictingQueue<CorrelationEvent>>,
) -> (EngineHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let sweep_interval = std::time::Duration::from_millis(config.sweep_interval_ms.max(1));
    let sweeper_tx = tx.clone();
    let stop_sweeper = Arc::new(Notify::new());
    let stop_sweeper_for_task = stop_sweeper.clone();
    let (violation_tx, violation_rx) = watch::channel(None);

    let handle = tokio::spawn(async move {
        let mut state = EngineState::new(config, seed_relationships);
        info!("Correlation engine started");

        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if sweeper_tx.send(Command::Sweep).await.is_err() {
                            return;
                        }
                    }
                    _ = stop_sweeper_for_task.notified() => return,
                }
            }
        });

        engine_loop(&mut state, rx, &events_out, &violation_tx).await;
        stop_sweeper.notify_waiters();
        sweeper.abort();
        info!("Correlation engine stopped");
    });

    (
        EngineHandle {
            tx,
            invariant_violation: violation_rx,
        },
        handle,
    )
}

async fn engine_loop(
    state: &mut EngineState,
    mut rx: mpsc::Receiver<Command>,
    events_out: &Arc<EvictingQueue<CorrelationEvent>>,
    violation_tx: &watch::Sender<Option<String>>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Analyze(observation, reply) => {
                let result = state.analyze(observation);
                if let Ok(Some(outcome)) = &result {
                    let kind = if outcome.correlation.join_count <= 1 {
                        CorrelationEventKind::Opened
                    } else {
                        CorrelationEventKind::Extended
                    };
                    events_out.push(CorrelationEvent {
                        kind,
                        correlation_id: outcome.correlation.correlation_id,
                        observation_ids: outcome.correlation.observation_ids.clone(),
                        confidence_score: outcome.correlation.confidence_score,
                        factors: Some(outcome.breakdown),
                    });
                }
                if let Err(SentryError::EngineInvariantViolation(msg)) = &result {
                    error!(error = %msg, "Engine invariant violated, notifying supervisor");
                    let _ = violation_tx.send(Some(msg.clone()));
                    let _ = reply.send(result);
                    return;
                }
                if let Err(e) = &result {
                    error!(error = %e, "Analyze failed");
                }
                let _ = reply.send(result);
            }
            Command::RegisterRelationship(rel, reply) => {
                let _ = reply.send(state.register_relationship(rel));
            }
            Command::Stats(reply) => {
                let _ = reply.send(state.stats.clone());
            }
            Command::Sweep => {
                let now = Utc::now();
                for event in state.sweep(now) {
                    events_out.push(event);
                }
            }
            Command::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, MovementVector, ObservationClass};

    fn obs(camera_id: &str, x: f64, y: f64, ts: DateTime<Utc>) -> Observation {
        Observation {
            observation_id: Uuid::new_v4(),
            camera_id: camera_id.to_string(),
            zone_id: "z".into(),
            class: ObservationClass::Person,
            confidence: 0.9,
            bbox: BBox { x, y, w: 0.1, h: 0.1 },
            movement_vector: Some(MovementVector { dx: 1.0, dy: 0.0 }),
            features: None,
            timestamp: ts,
        }
    }

    fn rel(a: &str, b: &str, mult: f64) -> RelationshipConfig {
        RelationshipConfig {
            monitor_a: a.into(),
            monitor_b: b.into(),
            kind: RelationshipKind::Adjacent,
            confidence_multiplier: mult,
        }
    }

    #[tokio::test]
    async fn joins_close_observations_into_a_correlation() {
        let config = EngineConfig::default();
        let events = Arc::new(EvictingQueue::new(64));
        let (handle, _join) = spawn_engine(config, vec![rel("cam0", "cam1", 1.3)], events);

        let t0 = Utc::now();
        let a = obs("cam0", 0.5, 0.5, t0);
        let outcome_a = handle.analyze(a.clone()).await.unwrap();
        assert!(outcome_a.is_none());

        let b = obs("cam1", 0.52, 0.5, t0 + chrono::Duration::milliseconds(500));
        let outcome_b = handle.analyze(b).await.unwrap();
        assert!(outcome_b.is_some());
        let outcome_b = outcome_b.unwrap();
        assert_eq!(outcome_b.correlation.observation_ids.len(), 2);
        assert!(outcome_b.correlation.confidence_score >= config_min());
    }

    fn config_min() -> f64 {
        EngineConfig::default().min_correlation_confidence
    }

    #[tokio::test]
    async fn unrelated_cameras_never_join() {
        let config = EngineConfig::default();
        let events = Arc::new(EvictingQueue::new(64));
        let (handle, _join) = spawn_engine(config, vec![], events);

        let t0 = Utc::now();
        handle.analyze(obs("cam0", 0.5, 0.5, t0)).await.unwrap();
        let outcome = handle
            .analyze(obs("cam1", 0.5, 0.5, t0 + chrono::Duration::milliseconds(100)))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
