//! `pg-muster` binary entry point.
//!
//! Parses a single required positional argument (the path to the JSON
//! configuration document, §6), initializes structured logging, builds the
//! collection engine, and runs it alongside the HTTP exposer until a Ctrl-C
//! or SIGTERM is received.

use std::path::PathBuf;
use std::process::ExitCode;

use pg_muster::config::Config;
use pg_muster::engine::Engine;
use pg_muster::registry::MetricRegistry;
use pg_muster::{exposer, logging};
use tracing::{error, info};

fn parse_args() -> Result<PathBuf, String> {
    let mut args = std::env::args().skip(1);
    match args.next() {
        Some(path) => Ok(PathBuf::from(path)),
        None => Err(format!(
            "usage: {} <config.json>",
            std::env::args().next().unwrap_or_else(|| "pg-muster".to_string())
        )),
    }
}

/// Resolves once a Ctrl-C or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config_path = match parse_args() {
        Ok(path) => path,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let fixed_labels: Vec<(String, String)> = config
        .target
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let registry = MetricRegistry::new(fixed_labels);
    let engine = Engine::new(config.clone(), registry.clone());

    let exposer_target = config.target.clone();
    let exposer_task = tokio::spawn(async move {
        if let Err(e) = exposer::serve(&exposer_target, registry, shutdown_signal()).await {
            error!(error = %e, "metric exposer exited with error");
        }
    });

    let engine_for_shutdown = engine.clone();
    let shutdown_task = tokio::spawn(async move {
        shutdown_signal().await;
        engine_for_shutdown.stop();
    });

    info!("pg-muster starting");
    if let Err(e) = engine.start().await {
        error!(error = %e, "collection engine exited with error");
        return ExitCode::FAILURE;
    }

    shutdown_task.abort();
    let _ = exposer_task.await;
    info!("pg-muster stopped");
    ExitCode::SUCCESS
}
