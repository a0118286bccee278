//! MR Dashboard - personal GitLab merge request overview.
//!
//! This is the main library for the dashboard backend. It aggregates open
//! merge requests of the configured projects, derives their review state and
//! serves the grouped result as JSON.

pub mod config;
pub mod error;
pub mod models;
pub mod services;

use clap::Parser;
use config::{spawn_reload_task, AppConfig};
use error::AppError;
use services::http_server;
use services::{AggregationService, GitLabApi, GitLabClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "mr-dashboard", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:8080 (overrides server.listen).
    #[arg(short, long)]
    pub listen: Option<String>,
}

/// Load the configuration, start the service and serve until Ctrl-C.
pub async fn run(cli: Cli) -> Result<(), AppError> {
    let (config, config_path) = AppConfig::load(cli.config.as_deref())?;
    log::info!("[config] Loaded {}", config_path.display());

    let addr = config.listen_addr(cli.listen.as_deref())?;

    let client_config = config.client_config();
    log::info!("[gitlab] Using {}", client_config.base_url);
    let api: Arc<dyn GitLabApi> = Arc::new(GitLabClient::new(client_config)?);

    let service = Arc::new(AggregationService::new(api, config.fetch.workers));
    log::info!("[aggregation] Using {} fetch worker(s)", service.workers());
    service.update_settings(config.to_settings()).await;

    let shutdown = CancellationToken::new();
    let reload_task = spawn_reload_task(
        config_path,
        &config,
        Arc::clone(&service),
        shutdown.clone(),
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("[server] Failed to listen for Ctrl-C: {}", e);
            return;
        }
        log::info!("[server] Shutting down");
        signal.cancel();
    });

    let result = http_server::serve(addr, http_server::router(service), shutdown.clone()).await;

    shutdown.cancel();
    if let Some(task) = reload_task {
        let _ = task.await;
    }

    result
}
