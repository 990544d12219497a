//! msfailab runtime core
//!
//! Orchestrates Metasploit lab containers, their RPC consoles, and the
//! LLM-driven research tracks on top of them.

mod bus;
mod config;
mod console;
mod controller;
mod db;
mod docker;
mod engine;
mod llm;
mod markdown;
mod ports;
mod rpc;
mod supervisor;
mod tools;
mod track;
mod workspace;

use config::Config;
use controller::ContainerRecord;
use db::Database;
use docker::CliDockerAdapter;
use llm::ModelRegistry;
use rpc::HttpRpcClient;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace::Orchestrator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "msfailab=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());

    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path, "opening database");
    let database = Database::open(&config.db_path)?;

    let llm_registry = Arc::new(ModelRegistry::new(
        &config.credentials,
        config.default_model.clone(),
    ));
    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.list_models().iter().map(|m| m.name.clone()).collect::<Vec<_>>(),
            default = ?llm_registry.default_model(),
            "llm registry initialized"
        );
    } else {
        tracing::warn!("no LLM credentials configured, AI turns will be unavailable");
    }

    let docker = Arc::new(CliDockerAdapter::new(
        std::env::var("MSFAILAB_DOCKER_IMAGE")
            .unwrap_or_else(|_| "msfailab/metasploit:latest".to_string()),
        config.credentials.rpc_password.clone(),
    ));
    let rpc = Arc::new(HttpRpcClient::new(
        config.credentials.rpc_user.clone(),
        config.credentials.rpc_password.clone(),
    )?);

    let bus = bus::EventBus::new();
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        database,
        bus,
        docker,
        rpc,
        llm_registry,
    ));

    // Container records come from the surrounding application; the daemon
    // form boots one workspace described by the environment.
    let records = records_from_env();
    orchestrator.adopt_running_containers(&records).await;
    for record in &records {
        orchestrator.ensure_controller(record).await;
        for track_id in tracks_from_env() {
            if let Err(e) = orchestrator.start_track(record, track_id).await {
                tracing::warn!(track_id, error = %e, "track start failed");
            }
        }
    }

    if let Some(record) = records.first() {
        let mut events = orchestrator.bus().subscribe(record.workspace_id);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                tracing::debug!(?event, "bus event");
            }
        });
    }

    tracing::info!("msfailab core running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    Ok(())
}

fn records_from_env() -> Vec<ContainerRecord> {
    let workspace_id = env_i64("MSFAILAB_WORKSPACE_ID").unwrap_or(1);
    let container_id = env_i64("MSFAILAB_CONTAINER_ID").unwrap_or(1);
    let workspace_slug =
        std::env::var("MSFAILAB_WORKSPACE_SLUG").unwrap_or_else(|_| "default".to_string());
    let slug = std::env::var("MSFAILAB_CONTAINER_SLUG").unwrap_or_else(|_| "msf".to_string());
    let image = std::env::var("MSFAILAB_DOCKER_IMAGE")
        .unwrap_or_else(|_| "msfailab/metasploit:latest".to_string());

    vec![ContainerRecord {
        id: container_id,
        workspace_id,
        workspace_slug,
        name: slug.clone(),
        slug,
        docker_image: image,
    }]
}

fn tracks_from_env() -> Vec<i64> {
    std::env::var("MSFAILAB_TRACK_IDS")
        .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_else(|_| vec![1])
}

fn env_i64(var: &str) -> Option<i64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}
