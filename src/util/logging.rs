use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when RUST_LOG is unset: crate at info, request traces at
/// info, everything else quiet.
const DEFAULT_FILTER: &str = "warn,nl_campaign=info,tower_http=info";

/// Initializes tracing/logging based on environment variables.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt().with_env_filter(env_filter).with_target(true).init();
}
