// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Stream Worker — owns one camera's RTSP connection, decodes frames, and
//! emits a rate-limited, bounded stream of [`Frame`] values.
//!
//! Pipeline: `rtspsrc -> decodebin -> videoconvert -> appsink (RGB)`. The
//! `appsink` callback uses the same non-blocking push idiom throughout:
//! decoded frames land in a small raw queue that always keeps the newest
//! sample. The capture loop drains that raw queue, applies FPS pacing, and
//! republishes accepted frames into a second, caller-facing queue of
//! capacity `buffer_depth` — this is the "outbound frame buffer" of spec
//! §4.1, which evicts its oldest entry (not the raw queue's) on overflow
//! and counts that eviction as a dropped frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::CameraConfig;
use crate::error::{Result, SentryError};
use crate::types::{Frame, WorkerState, WorkerStats};
use crate::util::{jittered_backoff, EvictingQueue};

const RECONNECT_BASE: Duration = Duration::from_secs(2);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(5);
/// The raw appsink queue only ever needs to hold the latest sample; pacing
/// and buffering happen downstream in the outbound queue.
const RAW_QUEUE_DEPTH: usize = 2;

/// Handle to a running GStreamer pipeline for one RTSP camera.
struct ActiveSession {
    pipeline: gst::Pipeline,
}

impl ActiveSession {
    fn open(config: &CameraConfig, raw: Arc<EvictingQueue<Frame>>, frame_id: Arc<AtomicU64>) -> Result<Self> {
        gst::init().map_err(|e| SentryError::GStreamer(format!("gst::init: {e}")))?;

        let pipeline_str = format!(
            "rtspsrc location={url} latency=200 protocols=tcp buffer-mode=0 ! \
             decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink emit-signals=true max-buffers=1 drop=true sync=false",
            url = config.source_url
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| SentryError::GStreamer(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SentryError::GStreamer("not a pipeline".into()))?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| SentryError::GStreamer("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| SentryError::GStreamer("cast to AppSink failed".into()))?;

        let camera_id = config.camera_id.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let (width, height) = sample
                        .caps()
                        .and_then(|caps| caps.structure(0).map(|s| s.to_owned()))
                        .and_then(|s| {
                            let w: i32 = s.get("width").ok()?;
                            let h: i32 = s.get("height").ok()?;
                            Some((w as u32, h as u32))
                        })
                        .unwrap_or((0, 0));

                    let id = frame_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let frame = Frame {
                        camera_id: camera_id.clone(),
                        frame_id: id,
                        timestamp: Utc::now(),
                        pixels: map.as_slice().to_vec(),
                        width,
                        height,
                    };
                    raw.push(frame);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SentryError::GStreamer(format!("set_state Playing: {e}")))?;

        Ok(ActiveSession { pipeline })
    }

    fn stop(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns one camera's capture loop: connects, paces to `target_fps`,
/// reconnects with jittered backoff, and exits on cancellation. One
/// `tokio::spawn`ed task per camera (§5).
pub struct StreamWorker {
    config: CameraConfig,
    state: Arc<RwLock<WorkerState>>,
    stats: Arc<RwLock<WorkerStats>>,
    /// The outbound, caller-facing buffer (capacity `buffer_depth`).
    ready: Arc<EvictingQueue<Frame>>,
    stop: Arc<Notify>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl StreamWorker {
    /// `Start(config)`: spawns the capture task and returns immediately.
    /// The only `Start`-time failure is a configuration error; connection
    /// failures are handled entirely by the reconnect loop.
    pub fn start(config: CameraConfig) -> Result<Self> {
        if config.source_url.trim().is_empty() {
            return Err(SentryError::Config(format!(
                "camera '{}': source_url must not be empty",
                config.camera_id
            )));
        }

        let state = Arc::new(RwLock::new(WorkerState::Idle));
        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        let ready = Arc::new(EvictingQueue::new(config.buffer_depth));
        let stop = Arc::new(Notify::new());

        let task_config = config.clone();
        let task_state = state.clone();
        let task_stats = stats.clone();
        let task_ready = ready.clone();
        let task_stop = stop.clone();

        let handle = tokio::spawn(async move {
            run_capture_loop(task_config, task_state, task_stats, task_ready, task_stop).await;
        });

        Ok(StreamWorker {
            config,
            state,
            stats,
            ready,
            stop,
            handle: Some(handle),
        })
    }

    /// `Stop()`: idempotent. Signals the loop, waits up to 5s for graceful
    /// exit, then forcibly aborts.
    pub async fn stop(&mut self) {
        *self.state.write() = WorkerState::Stopping;
        self.stop.notify_waiters();
        self.ready.close();

        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!(camera = self.config.camera_id, "Stop timed out, forcing release");
            }
        }
        *self.state.write() = WorkerState::Terminated;
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.read().clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Pull the next paced, buffered frame. Returns `None` once `stop()`
    /// has drained and closed the outbound buffer.
    pub async fn next_frame(&self) -> Option<Frame> {
        self.ready.pop().await
    }

    /// Shared handle to the outbound frame queue, for callers (e.g. a
    /// detection pump task) that need to keep consuming frames without
    /// borrowing the worker itself across an `.await`.
    pub fn frame_queue(&self) -> Arc<EvictingQueue<Frame>> {
        self.ready.clone()
    }

    pub fn camera_id(&self) -> &str {
        &self.config.camera_id
    }
}

async fn run_capture_loop(
    config: CameraConfig,
    state: Arc<RwLock<WorkerState>>,
    stats: Arc<RwLock<WorkerStats>>,
    ready: Arc<EvictingQueue<Frame>>,
    stop: Arc<Notify>,
) {
    let max_attempts = if config.max_initial_attempts == 0 {
        u32::MAX
    } else {
        config.max_initial_attempts
    };
    let min_frame_interval = Duration::from_secs_f64(1.0 / config.target_fps as f64);

    *state.write() = WorkerState::Connecting;
    let mut attempt = 0u32;

    'reconnect: loop {
        if attempt >= max_attempts {
            let permanent = SentryError::PermanentSource {
                camera_id: config.camera_id.clone(),
                reason: format!("{attempt} consecutive connection failures"),
            };
            stats.write().last_error = Some(permanent.to_string());
            *state.write() = WorkerState::Terminated;
            error!(camera = config.camera_id, error = %permanent, "Giving up on stream source");
            return;
        }

        let frame_id = Arc::new(AtomicU64::new(0));
        let raw: Arc<EvictingQueue<Frame>> = Arc::new(EvictingQueue::new(RAW_QUEUE_DEPTH));

        match ActiveSession::open(&config, raw.clone(), frame_id.clone()) {
            Ok(session) => {
                attempt = 0;
                {
                    let mut s = stats.write();
                    s.connected = true;
                }
                *state.write() = WorkerState::Running;
                info!(camera = config.camera_id, "Stream connected");

                let mut last_emitted = Instant::now() - min_frame_interval;
                let mut fps_window_start = Instant::now();
                let mut fps_window_count = 0u64;

                loop {
                    let stop_fut = stop.notified();
                    tokio::pin!(stop_fut);
                    tokio::select! {
                        biased;
                        _ = &mut stop_fut => {
                            drop(session);
                            *state.write() = WorkerState::Terminated;
                            return;
                        }
                        maybe_frame = raw.pop() => {
                            let Some(frame) = maybe_frame else {
                                // Pipeline session dropped without a fresh frame.
                                break;
                            };

                            let now = Instant::now();
                            if now.duration_since(last_emitted) < min_frame_interval {
                                // Paced out: not counted as a drop (spec §4.1).
                                continue;
                            }
                            last_emitted = now;
                            fps_window_count += 1;
                            if now.duration_since(fps_window_start) >= Duration::from_secs(1) {
                                let fps = fps_window_count as f64
                                    / now.duration_since(fps_window_start).as_secs_f64();
                                stats.write().fps_actual = fps;
                                fps_window_count = 0;
                                fps_window_start = now;
                            }

                            let evicted = ready.push(frame);
                            let mut s = stats.write();
                            s.frames_processed += 1;
                            if evicted {
                                s.frames_dropped += 1;
                            }
                        }
                    }
                }

                warn!(camera = config.camera_id, "Stream ended, will reconnect");
                stats.write().connected = false;
                *state.write() = WorkerState::Reconnecting;
                if !config.auto_reconnect {
                    *state.write() = WorkerState::Terminated;
                    return;
                }
                continue 'reconnect;
            }
            Err(e) => {
                attempt += 1;
                let backoff = jittered_backoff(attempt, RECONNECT_BASE, RECONNECT_CAP);
                let transient = SentryError::TransientSource {
                    camera_id: config.camera_id.clone(),
                    reason: e.to_string(),
                };
                stats.write().last_error = Some(transient.to_string());
                *state.write() = WorkerState::Reconnecting;
                warn!(camera = config.camera_id, attempt, ?backoff, error = %transient, "Connect failed, retrying");

                if !config.auto_reconnect {
                    *state.write() = WorkerState::Terminated;
                    error!(camera = config.camera_id, "auto_reconnect disabled, stopping after failure");
                    return;
                }

                let stop_fut = stop.notified();
                tokio::pin!(stop_fut);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = &mut stop_fut => {
                        *state.write() = WorkerState::Terminated;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CameraConfig {
        CameraConfig {
            camera_id: "cam0".into(),
            source_url: "rtsp://example.invalid/stream".into(),
            target_fps: 15,
            resolution: (640, 480),
            buffer_depth: 5,
            auto_reconnect: true,
            detection_enabled: true,
            max_initial_attempts: 5,
        }
    }

    #[test]
    fn rejects_empty_source_url() {
        let mut cfg = test_config();
        cfg.source_url = "  ".into();
        let err = StreamWorker::start(cfg).unwrap_err();
        assert!(matches!(err, SentryError::Config(_)));
    }
}
