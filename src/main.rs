use std::env;
use std::sync::Arc;

use ccsidecar::cli::Cli;
use ccsidecar::config::{build_config, AppConfig};
use ccsidecar::liveness::ProcessTableOracle;
use ccsidecar::publisher::Publisher;
use ccsidecar::registry::DirRegistry;
use ccsidecar::tracker::Tracker;
use ccsidecar::watcher::{start_watching, Toucher};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEBUG_LOG_ENV: &str = "CC_SIDECAR_DEBUG_LOG";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Invalid configuration");
            std::process::exit(2);
        }
    };

    let publisher = match open_publisher(&config) {
        Ok(publisher) => Arc::new(publisher),
        Err(err) => {
            error!(error = %err, "Failed to open event output");
            std::process::exit(1);
        }
    };

    let tracker = Arc::new(Tracker::with_oracle(
        config.tracker,
        ProcessTableOracle::new(config.liveness.binary.clone()),
        move |session| {
            if let Err(err) = publisher.publish(&session) {
                error!(error = %err, session_id = %session.session_id, "Failed to publish completion");
            }
        },
    ));
    let sweeper = tracker.start();

    let toucher: Arc<dyn Toucher> = tracker.clone();
    let watcher = match start_watching(config.watch_dir.clone(), toucher) {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "Failed to start transcript watcher");
            sweeper.shutdown().await;
            std::process::exit(1);
        }
    };

    info!(
        watch_dir = %config.watch_dir.display(),
        idle_threshold = ?config.tracker.idle_threshold,
        poll_interval = ?config.tracker.poll_interval,
        "cc-sidecar started"
    );

    wait_for_shutdown().await;
    info!("Shutting down");

    watcher.shutdown().await;
    sweeper.shutdown().await;
    info!(tracked = tracker.tracked_count(), "cc-sidecar stopped");
}

fn init_logging(verbose: bool) {
    let debug_enabled = verbose
        || env::var(DEBUG_LOG_ENV)
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
            .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // stdout may carry the event stream.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_publisher(config: &AppConfig) -> Result<Publisher, ccsidecar::publisher::PublishError> {
    let publish = &config.publish;
    let publisher = match publish.output {
        Some(ref path) => Publisher::append_to(path, publish.source.clone())?,
        None => Publisher::stdout(publish.source.clone()),
    };

    Ok(match publish.registry_dir {
        Some(ref dir) => {
            if !dir.is_dir() {
                warn!(dir = %dir.display(), "Registry directory does not exist yet");
            }
            publisher.with_registry(DirRegistry::new(dir))
        }
        None => publisher,
    })
}

/// Resolve on Ctrl-C, or on SIGTERM where supported.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            warn!(error = %err, "Failed to listen for Ctrl-C");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for Ctrl-C");
    }
}
