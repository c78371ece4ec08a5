pub mod providers;
pub mod rate_limit;

use crate::config::{LlmConfig, PipelineConfig};
use async_trait::async_trait;
use rate_limit::SlidingWindowLimiter;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
    RateLimited,
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
            LlmError::RateLimited => write!(f, "LLM rate limit exceeded"),
        }
    }
}

impl Error for LlmError {}

/// The text-generation boundary. Given a prompt, eventually returns text or
/// fails; the pipeline assumes nothing else about the backing service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Fronts the configured provider with a per-caller sliding-window rate
/// limiter. Both the interpretation generator and the SQL synthesizer go
/// through here; retries live with the callers, not the manager.
pub struct LlmManager {
    generator: Box<dyn TextGenerator>,
    limiter: SlidingWindowLimiter,
}

impl LlmManager {
    pub fn new(config: &LlmConfig, pipeline: &PipelineConfig) -> Result<Self, LlmError> {
        let generator: Box<dyn TextGenerator> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self {
            generator,
            limiter: SlidingWindowLimiter::new(
                pipeline.rate_limit_max,
                std::time::Duration::from_secs(pipeline.rate_limit_window_secs),
            ),
        })
    }

    /// Builds a manager around an arbitrary generator. Used by tests to
    /// script responses without a live service.
    pub fn with_generator(generator: Box<dyn TextGenerator>, pipeline: &PipelineConfig) -> Self {
        Self {
            generator,
            limiter: SlidingWindowLimiter::new(
                pipeline.rate_limit_max,
                std::time::Duration::from_secs(pipeline.rate_limit_window_secs),
            ),
        }
    }

    /// Fails fast with `RateLimited` when the caller is over its window;
    /// nothing is queued.
    pub async fn generate(&self, caller: &str, prompt: &str) -> Result<String, LlmError> {
        if !self.limiter.try_acquire(caller) {
            return Err(LlmError::RateLimited);
        }
        self.generator.generate(prompt).await
    }
}
