use tracing_subscriber::{EnvFilter, fmt};

use crate::config::EngineConfig;
use crate::error::EngineError;

pub fn init_tracing(config: &EngineConfig) -> Result<(), EngineError> {
    let filter =
        EnvFilter::try_new(config.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.is_production() {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };

    result.map_err(|e| EngineError::Config(format!("tracing subscriber: {e}")))
}
