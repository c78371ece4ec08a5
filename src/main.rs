use clap::Parser;
use r2d2::Pool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use nl_campaign::config::{AppConfig, CliArgs};
use nl_campaign::exec::pool::DuckDBConnectionManager;
use nl_campaign::exec::ExecutionEngine;
use nl_campaign::llm::LlmManager;
use nl_campaign::pipeline::QueryPipeline;
use nl_campaign::schema::SchemaProvider;
use nl_campaign::track::QueryTracker;
use nl_campaign::util::logging::init_tracing;
use nl_campaign::web::state::AppState;
use nl_campaign::web;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Ensure data directory exists
    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    info!("Initializing DuckDB connection pool");
    let db_manager = DuckDBConnectionManager::new(config.database.connection_string.clone());
    let pool = Pool::builder()
        .max_size(config.database.pool_size as u32)
        .build(db_manager)?;

    // Initialize LLM manager
    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = Arc::new(LlmManager::new(&config.llm, &config.pipeline)?);

    let engine = Arc::new(ExecutionEngine::new(
        pool,
        Duration::from_secs(config.pipeline.query_timeout_secs),
        config.pipeline.max_rows,
    ));
    let schema_provider = Arc::new(SchemaProvider::new());
    let tracker = Arc::new(QueryTracker::new());

    let pipeline = Arc::new(QueryPipeline::new(
        config.pipeline.clone(),
        llm_manager,
        schema_provider.clone(),
        engine,
        tracker,
    ));

    // Publish the initial schema snapshot
    info!("Publishing initial schema snapshot");
    if let Err(e) = schema_provider
        .refresh_from_store(&config.database.connection_string)
        .await
    {
        error!("Failed to load initial schema: {}", e);
        // Continue anyway, it can be refreshed later
    }

    let app_state = Arc::new(AppState::new(config.clone(), pipeline));

    // Start the web server
    info!(
        "Starting NL-Campaign server on {}:{}",
        config.web.host, config.web.port
    );
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(std::io::Error::other(e.to_string()).into());
        }
    }

    Ok(())
}
