//! Orra plan engine entry point

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use orra::adapters::llm::{OpenAiEmbeddings, OpenAiLlmConfig, OpenAiReasoning};
use orra::adapters::pddl::ValBinaryValidator;
use orra::adapters::sqlite::SqliteStorage;
use orra::domain::ports::plan_validator::{AcceptAllValidator, PlanValidator};
use orra::domain::ports::transport::ServiceTransport;
use orra::infrastructure::config::ConfigLoader;
use orra::infrastructure::logging::init_logging;
use orra::infrastructure::transport::{SessionAuthorizer, WebSocketHub};
use orra::PlanEngine;

/// Plan engine: LLM-planned, log-driven orchestration across remote
/// services.
#[derive(Debug, Parser)]
#[command(name = "orra", version, about)]
struct Cli {
    /// Path to a configuration file (defaults to ./orra.yaml merged with
    /// ORRA_* environment variables).
    #[arg(long)]
    config: Option<String>,

    /// Override the transport port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the storage path.
    #[arg(long)]
    storage_path: Option<String>,

    /// Override the log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.storage_path {
        config.storage_path = path;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    ConfigLoader::validate(&config)?;

    init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "orra plan engine starting");

    if let Some(parent) = Path::new(&config.storage_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create storage directory")?;
        }
    }
    let storage = Arc::new(
        SqliteStorage::open(&config.storage_path)
            .await
            .context("failed to open storage")?,
    );

    let reasoning = Arc::new(OpenAiReasoning::new(OpenAiLlmConfig::for_reasoning(
        &config.reasoning,
    )));
    let embedding = Arc::new(OpenAiEmbeddings::new(OpenAiLlmConfig::for_embeddings(
        &config.embeddings,
    )));
    let validator: Arc<dyn PlanValidator> = match &config.pddl_validator_path {
        Some(path) => Arc::new(ValBinaryValidator::new(
            path,
            Duration::from_millis(config.pddl_validation_timeout_ms),
        )),
        None => Arc::new(AcceptAllValidator),
    };

    let (hub, mut inbound) = WebSocketHub::new();
    let engine = PlanEngine::new(
        storage,
        Arc::clone(&hub) as Arc<dyn ServiceTransport>,
        reasoning,
        embedding,
        validator,
    );

    engine.recover().await.context("recovery failed")?;

    // Route inbound service results into the idempotency stores.
    let router = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(result) = inbound.recv().await {
                engine.apply_task_result(result).await;
            }
        })
    };

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, "service transport listening");

    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(Arc::clone(&hub).serve(
        listener,
        Arc::clone(&engine) as Arc<dyn SessionAuthorizer>,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    shutdown.cancel();
    engine.shutdown().await;
    router.abort();
    let _ = serve.await;
    info!("orra plan engine stopped");
    Ok(())
}
