use crate::config::AppConfig;
use crate::pipeline::QueryPipeline;
use std::sync::Arc;

/// Shared application state for the web server.
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<QueryPipeline>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<QueryPipeline>) -> Self {
        Self {
            config,
            pipeline,
            startup_time: chrono::Utc::now(),
        }
    }
}
