//! Configuration Loader
//!
//! Layers built-in defaults, an optional configuration file and `TURBO_*`
//! environment variables (`TURBO_HYDRATION__MAX_BATCH_SIZE=50`), then
//! validates the merged result.

use super::error::{ConfigResult, ConfigurationError};
use super::TurboConfig;
use config::{Config, Environment, File};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "TURBO";
const ENV_SEPARATOR: &str = "__";
const CONFIG_PATH_VAR: &str = "TURBO_CONFIG_PATH";
const DEFAULT_CONFIG_BASENAME: &str = "config/turbo";

pub struct ConfigManager {
    config: TurboConfig,
    environment: String,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection.
    ///
    /// Reads `.env` if present, then `TURBO_CONFIG_PATH` or `config/turbo.*`.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        dotenvy::dotenv().ok();
        let config_path = env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref(), None)
    }

    /// Load from an explicit file and, for tests, an explicit environment map
    /// used instead of the process environment.
    pub fn load_from(
        config_path: Option<&Path>,
        env_overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();

        let defaults = Config::try_from(&TurboConfig::default())
            .map_err(|e| ConfigurationError::load_error("defaults", e))?;
        let mut builder = Config::builder().add_source(defaults);

        builder = match config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigurationError::FileNotFound(path.display().to_string()));
                }
                builder.add_source(File::from(path).required(true))
            }
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env_overrides),
        );

        let config: TurboConfig = builder
            .build()
            .map_err(|e| ConfigurationError::load_error("merged sources", e))?
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_error("deserialization", e))?;

        config.validate()?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string_pretty(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );
        info!(
            environment = %environment,
            config_file = ?config_path.map(|p| p.display().to_string()),
            shard_modulo = config.shard.modulo,
            shard = config.shard.shard,
            "⚙️ CONFIG: Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_path: config_path.map(Path::to_path_buf),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &TurboConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Configuration as JSON with credential-bearing fields masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    fn sanitize_config_for_logging(config: &TurboConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        let sensitive_patterns = ["password", "secret", "key", "token", "credential", "url"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive {
                        match val {
                            serde_json::Value::Null => {}
                            serde_json::Value::String(s) if s.is_empty() => {
                                *val = serde_json::Value::String("[EMPTY]".to_string());
                            }
                            _ => {
                                *val = serde_json::Value::String("[MASKED]".to_string());
                            }
                        }
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(arr) => {
                for item in arr.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }

    fn detect_environment() -> String {
        env::var("TURBO_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}
