use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;
use crate::vault::RetryPolicy;

pub const ENV_PREFIX: &str = "W3SYNC";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub app_env: String,
    pub log_level: String,
    pub platform: String,
    pub registry_url: String,
    pub schemas_path: PathBuf,
    pub db_path: PathBuf,
    pub lock_ttl_ms: u64,
    pub debounce_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub request_timeout_ms: u64,
    pub update_workers: usize,
    pub update_queue_capacity: usize,
    pub tombstone_retention_ms: u64,
}

impl EngineConfig {
    /// Reads `.env`, then `W3SYNC_*` environment variables over the defaults.
    pub fn load() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();
        Self::load_from(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
    }

    pub fn load_from(environment: config::Environment) -> Result<Self, EngineError> {
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("db_path", "mappings.db")?
            .set_default("lock_ttl_ms", 15_000)?
            .set_default("debounce_ms", 3_000)?
            .set_default("retry_max_attempts", 10)?
            .set_default("retry_backoff_base_ms", 1_000)?
            .set_default("retry_backoff_max_ms", 15_000)?
            .set_default("request_timeout_ms", 10_000)?
            .set_default("update_workers", 4)?
            .set_default("update_queue_capacity", 1_024)?
            .set_default("tombstone_retention_ms", 604_800_000_i64)?
            .add_source(environment)
            .build()?;
        let config: Self = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let required = [
            ("platform", self.platform.as_str()),
            ("registry_url", self.registry_url.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(EngineError::Config(format!("{name} must be set")));
            }
        }
        if self.schemas_path.as_os_str().is_empty() {
            return Err(EngineError::Config("schemas_path must be set".into()));
        }
        if self.update_workers == 0 {
            return Err(EngineError::Config("update_workers must be at least 1".into()));
        }
        if self.update_queue_capacity < self.update_workers {
            return Err(EngineError::Config(
                "update_queue_capacity must be at least update_workers".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(EngineError::Config(
                "retry_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_backoff_base_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> config::Environment {
        let source: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .source(Some(source))
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let config = EngineConfig::load_from(env(&[
            ("W3SYNC_PLATFORM", "chat"),
            ("W3SYNC_REGISTRY_URL", "http://registry.local"),
            ("W3SYNC_SCHEMAS_PATH", "./mappings"),
        ]))
        .unwrap();

        assert_eq!(config.platform, "chat");
        assert_eq!(config.lock_ttl(), Duration::from_secs(15));
        assert_eq!(config.debounce(), Duration::from_secs(3));
        assert_eq!(config.retry_max_attempts, 10);
        assert_eq!(config.update_workers, 4);
        assert_eq!(config.db_path, PathBuf::from("mappings.db"));
        assert!(!config.is_production());
    }

    #[test]
    fn overrides_and_missing_required_fields() {
        let config = EngineConfig::load_from(env(&[
            ("W3SYNC_PLATFORM", "voting"),
            ("W3SYNC_REGISTRY_URL", "http://registry.local"),
            ("W3SYNC_SCHEMAS_PATH", "./mappings"),
            ("W3SYNC_APP_ENV", "production"),
            ("W3SYNC_LOCK_TTL_MS", "500"),
        ]))
        .unwrap();
        assert!(config.is_production());
        assert_eq!(config.lock_ttl_ms, 500);

        let missing = EngineConfig::load_from(env(&[("W3SYNC_PLATFORM", "chat")]));
        assert!(matches!(missing, Err(EngineError::ConfigSource(_))));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result = EngineConfig::load_from(env(&[
            ("W3SYNC_PLATFORM", "chat"),
            ("W3SYNC_REGISTRY_URL", "http://registry.local"),
            ("W3SYNC_SCHEMAS_PATH", "./mappings"),
            ("W3SYNC_UPDATE_WORKERS", "0"),
        ]));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
