// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! sentry-mesh — multi-stream ingestion, detection and cross-camera threat
//! correlation.
//!
//! Usage:
//!   sentry-mesh run      --config config.toml
//!   sentry-mesh validate --config config.toml

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sentry_mesh::api::{self, AppState};
use sentry_mesh::config::Config;
use sentry_mesh::detector::{Detector, StubDetector};
use sentry_mesh::manager::SentryManager;

#[derive(Parser)]
#[command(name = "sentry-mesh", about = "Multi-stream threat correlation engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start ingesting all configured cameras and run until CTRL+C.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Load and validate a config file without starting anything.
    Validate {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

/// Exit codes (§6): 0 clean shutdown, 2 invalid configuration, 3 fatal
/// engine invariant violation, 4 unrecoverable Detector init failure.
const EXIT_INVALID_CONFIG: i32 = 2;
const EXIT_ENGINE_INVARIANT_VIOLATION: i32 = 3;
const EXIT_DETECTOR_INIT_FAILURE: i32 = 4;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Validate { config } => validate(config),
    }
}

fn validate(config_path: PathBuf) {
    match Config::from_file(&config_path) {
        Ok(cfg) => {
            println!("OK: {} camera(s), {} relationship(s)", cfg.cameras.len(), cfg.relationships.len());
        }
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    }
}

async fn run(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };

    info!(
        cameras = cfg.cameras.len(),
        relationships = cfg.relationships.len(),
        api_enabled = cfg.api.enabled,
        "Starting sentry-mesh"
    );

    // The concrete inference backend is an external collaborator (out of
    // scope, per the core's Detect(frame) -> []Observation boundary); a
    // stub stands in until one is wired up. A real deployment would load
    // model weights here and exit 4 on failure.
    let detector: Arc<dyn Detector> = Arc::new(StubDetector::new(cfg.detector.clone(), Vec::new()));

    let manager = match SentryManager::new(cfg.clone(), detector) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "Failed to start manager");
            std::process::exit(EXIT_DETECTOR_INIT_FAILURE);
        }
    };
    let invariant_violations = manager.engine_invariant_violations();
    let manager = Arc::new(Mutex::new(manager));

    if cfg.api.enabled {
        let state = Arc::new(AppState {
            manager: manager.clone(),
        });
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    let mut violations = invariant_violations;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received CTRL+C, shutting down…"),
                Err(e) => error!(error = %e, "Signal error"),
            }
        }
        _ = violations.changed() => {
            let reason = violations.borrow().clone().unwrap_or_default();
            error!(reason, "Correlation engine invariant violated, shutting down");
            match Arc::try_unwrap(manager) {
                Ok(mutex) => mutex.into_inner().shutdown().await,
                Err(_arc) => warn!("Forcing shutdown while API still holds references"),
            }
            std::process::exit(EXIT_ENGINE_INVARIANT_VIOLATION);
        }
    }

    match Arc::try_unwrap(manager) {
        Ok(mutex) => mutex.into_inner().shutdown().await,
        Err(_arc) => {
            warn!("Forcing shutdown while API still holds references");
        }
    }
}
