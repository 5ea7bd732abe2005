// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Camera '{camera_id}' transient source error: {reason}")]
    TransientSource { camera_id: String, reason: String },

    #[error("Camera '{camera_id}' permanent source error: {reason}")]
    PermanentSource { camera_id: String, reason: String },

    #[error("GStreamer error: {0}")]
    GStreamer(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Correlation engine invariant violation: {0}")]
    EngineInvariantViolation(String),

    #[error("Camera '{id}' already exists")]
    CameraExists { id: String },

    #[error("Camera '{id}' not found")]
    CameraNotFound { id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SentryError>;
