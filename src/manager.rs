// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Top-level manager: orchestrates Stream Workers, the Detector, the
//! Correlation Engine and the Publisher into one running system.
//!
//! One background task per camera pulls frames off its `StreamWorker`,
//! hands them to the shared `Detector`, derives threat events, and feeds
//! observations into the Correlation Engine — mirroring the recording
//! manager's one-worker-per-camera-plus-shared-sink shape.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{CameraConfig, Config};
use crate::correlation::{self, EngineHandle};
use crate::detector::{self, Detector};
use crate::error::{Result, SentryError};
use crate::publisher::Publisher;
use crate::stream::StreamWorker;
use crate::types::{CorrelationEvent, EventEnvelope, MonitorRelationship};
use crate::util::EvictingQueue;

struct CameraEntry {
    config: CameraConfig,
    worker: StreamWorker,
    pump: JoinHandle<()>,
}

/// Owns every running camera, the shared detector, the correlation engine
/// and the publisher. Topology changes (add/remove camera) require `&mut
/// self`; everything else reaches shared state only through the engine's
/// own serialization domain or the publisher's queues.
pub struct SentryManager {
    cameras: HashMap<String, CameraEntry>,
    detector: Arc<dyn Detector>,
    engine: EngineHandle,
    engine_task: JoinHandle<()>,
    publisher: Publisher,
    events_task: JoinHandle<()>,
}

impl SentryManager {
    pub fn new(config: Config, detector: Arc<dyn Detector>) -> Result<Self> {
        let publisher = Publisher::new();
        let events_out: Arc<EvictingQueue<CorrelationEvent>> = Arc::new(EvictingQueue::new(1024));

        let (engine, engine_task) = correlation::spawn_engine(
            config.engine.clone(),
            config.relationships.clone(),
            events_out.clone(),
        );

        let publisher_for_events = publisher.clone();
        let events_task = tokio::spawn(async move {
            loop {
                match events_out.pop().await {
                    Some(event) => {
                        publisher_for_events.publish(correlation_event_to_envelope(event));
                    }
                    None => return,
                }
            }
        });

        let mut manager = SentryManager {
            cameras: HashMap::new(),
            detector,
            engine,
            engine_task,
            publisher,
            events_task,
        };

        for cam_cfg in config.cameras {
            manager.add_camera(cam_cfg)?;
        }

        Ok(manager)
    }

    /// Add a new camera at runtime. Returns `CameraExists` if the id is
    /// already registered.
    pub fn add_camera(&mut self, cam_cfg: CameraConfig) -> Result<()> {
        if self.cameras.contains_key(&cam_cfg.camera_id) {
            return Err(SentryError::CameraExists {
                id: cam_cfg.camera_id,
            });
        }

        let worker = StreamWorker::start(cam_cfg.clone())?;
        let pump = spawn_pump(
            cam_cfg.clone(),
            worker.frame_queue(),
            self.detector.clone(),
            self.engine.clone(),
            self.publisher.clone(),
        );

        info!(camera = cam_cfg.camera_id, "Camera registered");
        self.cameras.insert(
            cam_cfg.camera_id.clone(),
            CameraEntry {
                config: cam_cfg,
                worker,
                pump,
            },
        );
        Ok(())
    }

    /// Remove a camera at runtime: stops its worker and pump task.
    pub async fn remove_camera(&mut self, camera_id: &str) -> Result<()> {
        let Some(mut entry) = self.cameras.remove(camera_id) else {
            return Err(SentryError::CameraNotFound {
                id: camera_id.to_string(),
            });
        };
        entry.pump.abort();
        entry.worker.stop().await;
        info!(camera = camera_id, "Camera removed");
        Ok(())
    }

    pub async fn register_relationship(&self, rel: MonitorRelationship) -> Result<()> {
        self.engine.register_relationship(rel).await
    }

    pub fn list_cameras(&self) -> Vec<&CameraConfig> {
        self.cameras.values().map(|e| &e.config).collect()
    }

    pub async fn stats(&self) -> ManagerStats {
        let mut workers = HashMap::new();
        for (id, entry) in &self.cameras {
            workers.insert(id.clone(), (entry.worker.state(), entry.worker.stats()));
        }
        ManagerStats {
            workers,
            engine: self.engine.stats().await,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Watch channel the supervisor observes for a fatal engine invariant
    /// violation (exit code 3).
    pub fn engine_invariant_violations(&self) -> tokio::sync::watch::Receiver<Option<String>> {
        self.engine.invariant_violations()
    }

    /// Graceful shutdown: stops every worker, then the engine and the
    /// event-forwarding task.
    pub async fn shutdown(mut self) {
        info!("SentryManager shutting down");
        let ids: Vec<String> = self.cameras.keys().cloned().collect();
        for id in ids {
            if let Some(mut entry) = self.cameras.remove(&id) {
                entry.pump.abort();
                entry.worker.stop().await;
            }
        }
        self.engine.shutdown().await;
        self.engine_task.abort();
        self.events_task.abort();
        info!("SentryManager stopped");
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStats {
    pub workers: HashMap<String, (crate::types::WorkerState, crate::types::WorkerStats)>,
    pub engine: correlation::EngineStats,
}

fn spawn_pump(
    config: CameraConfig,
    frames: Arc<EvictingQueue<crate::types::Frame>>,
    detector: Arc<dyn Detector>,
    engine: EngineHandle,
    publisher: Publisher,
) -> JoinHandle<()> {
    let camera_id = config.camera_id.clone();
    let detection_enabled = config.detection_enabled;

    tokio::spawn(async move {
        loop {
            let Some(frame) = frames.pop().await else {
                return;
            };

            if !detection_enabled {
                continue;
            }

            let observations = match detector.detect(&frame) {
                Ok(obs) => obs,
                Err(e) => {
                    warn!(camera = camera_id, error = %e, "Detector error for frame");
                    continue;
                }
            };

            for observation in observations {
                let threat_event = detector::to_threat_event(observation.clone());
                publisher.publish(EventEnvelope::Observation {
                    timestamp: Utc::now(),
                    payload: observation.clone(),
                });
                publisher.publish(EventEnvelope::ThreatEvent {
                    timestamp: Utc::now(),
                    payload: threat_event,
                });

                if let Err(e) = engine.analyze(observation).await {
                    warn!(camera = camera_id, error = %e, "Correlation engine error");
                }
            }
        }
    })
}

fn correlation_event_to_envelope(event: CorrelationEvent) -> EventEnvelope {
    let timestamp = Utc::now();
    match event.kind {
        crate::types::CorrelationEventKind::Opened => EventEnvelope::CorrelationOpened {
            timestamp,
            payload: event,
        },
        crate::types::CorrelationEventKind::Extended => EventEnvelope::CorrelationExtended {
            timestamp,
            payload: event,
        },
        crate::types::CorrelationEventKind::Closed => EventEnvelope::CorrelationClosed {
            timestamp,
            payload: event,
        },
    }
}
