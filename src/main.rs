// src/main.rs
//! Arena Engine
//!
//! Runs a demo battle of the built-in sample agents against the sample
//! world. Ctrl-C aborts the battle at the next scheduling step.

use anyhow::{Context, Result};
use arena_engine::battle::{Battle, BattleResults, LoggingListener};
use arena_engine::observability::{init_metrics, init_tracing};
use arena_engine::samples::{roster, SampleWorld};
use arena_engine::utils::config::EngineConfig;
use arena_engine::{BuildInfo, SandboxHost};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load().context("loading configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    let build = BuildInfo::current();
    info!(
        "Starting Arena Engine v{} ({}, {})",
        build.version, build.git_hash, build.rustc_version
    );

    let results = run_demo(config).await?;
    println!("{}", results.to_json()?);
    Ok(())
}

fn default_data_root() -> PathBuf {
    std::env::temp_dir().join("arena-engine")
}

/// Admit the samples and play the battle on a blocking thread
async fn run_demo(config: EngineConfig) -> Result<BattleResults> {
    let data_root = config
        .sandbox
        .data_root
        .clone()
        .unwrap_or_else(default_data_root);
    let seed = config.scheduler.seed;

    let host = Arc::new(SandboxHost::new(config));
    for package in roster(Some(&data_root)) {
        if let Err(e) = host.admit(Arc::new(package)) {
            warn!("Sample rejected: {}", e);
        }
    }
    info!("Agent data under {}", data_root.display());

    let mut battle = Battle::new(Arc::clone(&host), Box::new(SampleWorld::new(seed)))
        .with_listener(Arc::new(LoggingListener));

    // Graceful shutdown handler
    let abort = battle.abort_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, aborting battle...");
            abort.cancel();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || battle.run())
        .await
        .context("battle thread failed")?;
    watcher.abort();

    match outcome {
        Ok(results) => {
            info!(aborted = results.aborted, "Battle finished");
            Ok(results)
        }
        Err(e) => {
            error!("Battle error: {}", e);
            Err(e.into())
        }
    }
}
