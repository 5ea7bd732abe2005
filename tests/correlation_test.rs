// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Integration tests for configuration loading and the management surface.
//!
//! Run with: `cargo test`

use std::io::Write;
use std::sync::Arc;

use sentry_mesh::config::Config;
use sentry_mesh::detector::StubDetector;
use sentry_mesh::manager::SentryManager;
use sentry_mesh::types::RelationshipKind;

fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&path).expect("create config file");
    file.write_all(contents.as_bytes()).expect("write config file");
    (dir, path)
}

const MINIMAL_CONFIG: &str = r#"
[[cameras]]
camera_id = "cam0"
source_url = "rtsp://example.invalid/stream"

[[cameras]]
camera_id = "cam1"
source_url = "rtsp://example.invalid/stream"
"#;

#[test]
fn loads_minimal_config_with_defaults() {
    let (_dir, path) = write_config(MINIMAL_CONFIG);
    let cfg = Config::from_file(&path).expect("config should load");
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.engine.min_correlation_confidence, 0.65);
    assert!(cfg.api.enabled);
}

#[test]
fn rejects_config_with_no_cameras() {
    let (_dir, path) = write_config("cameras = []\n");
    let err = Config::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("No cameras"));
}

#[test]
fn rejects_config_with_duplicate_camera_ids() {
    let (_dir, path) = write_config(
        r#"
[[cameras]]
camera_id = "cam0"
source_url = "rtsp://a.invalid/x"

[[cameras]]
camera_id = "cam0"
source_url = "rtsp://b.invalid/y"
"#,
    );
    let err = Config::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("Duplicate camera_id"));
}

#[test]
fn rejects_weights_that_do_not_sum_to_one() {
    let (_dir, path) = write_config(
        r#"
[[cameras]]
camera_id = "cam0"
source_url = "rtsp://example.invalid/stream"

[engine.weights]
spatial = 0.5
temporal = 0.5
class = 0.5
features = 0.0
movement = 0.0
"#,
    );
    let err = Config::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("must sum to 1.0"));
}

#[tokio::test]
async fn manager_tracks_camera_topology_and_stats() {
    let (_dir, path) = write_config(MINIMAL_CONFIG);
    let cfg = Config::from_file(&path).expect("config should load");
    let detector = Arc::new(StubDetector::new(cfg.detector.clone(), Vec::new()));

    let mut manager = SentryManager::new(cfg, detector).expect("manager should start");
    assert_eq!(manager.list_cameras().len(), 2);

    manager
        .register_relationship(sentry_mesh::types::MonitorRelationship {
            monitor_a: "cam0".into(),
            monitor_b: "cam1".into(),
            kind: RelationshipKind::Adjacent,
            confidence_multiplier: 1.0,
        })
        .await
        .expect("relationship should register");

    let stats = manager.stats().await;
    assert_eq!(stats.workers.len(), 2);

    manager.remove_camera("cam0").await.expect("camera should be removed");
    assert_eq!(manager.list_cameras().len(), 1);
    assert!(manager.remove_camera("cam0").await.is_err());

    manager.shutdown().await;
}
