use crate::error::{AppError, Result};
use crate::search::SearchConfig;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Search cluster and indexing configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the embedded defaults, `CONFIG_PATH` and the environment
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());
        Self::load_from(&config_path)
    }

    /// Load configuration, overriding the defaults with the file at `config_path` if present
    pub fn load_from(config_path: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(config_path).required(false))
            // Override with environment variables (WIKI_SEARCH__SEARCH__URI, ...)
            .add_source(
                config::Environment::with_prefix("WIKI_SEARCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and that the cluster URI parses
    pub fn validate(&self) -> Result<()> {
        self.search.check().map_err(AppError::from)?;
        self.search.connection_info().map_err(AppError::from)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults() {
        let config = Config::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.search.protocol_version, 8);
        assert_eq!(config.search.bulk_size, 100);
        assert_eq!(config.search.max_body_length, 100_000);
        assert_eq!(config.observability.log_level, "info");
        assert!(!config.observability.json_logs);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[search]\nprotocol_version = 7\nuri = \"http://es:9200/wiki\"\nbulk_size = 25\n\n[observability]\njson_logs = true"
        )
        .unwrap();

        let config = Config::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.search.protocol_version, 7);
        assert_eq!(config.search.bulk_size, 25);
        assert_eq!(config.search.connection_info().unwrap().index_name, "wiki");
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[search]\nbulk_size = 0").unwrap();

        let err = Config::load_from(file.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_unsupported_protocol_version_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[search]\nprotocol_version = 9").unwrap();

        let err = Config::load_from(file.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(err.is_fatal());
    }
}
