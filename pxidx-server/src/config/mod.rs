//! Configuration module for pxidx-server.
//!
//! Handles loading configuration from TOML files, CLI arguments,
//! and environment variables.

pub mod file;
pub mod runtime;

use crate::config::file::{FileConfig, SourceConfig};
use crate::config::runtime::{
    IngestSettings, LoadedConfig, NotifierSettings, SourceKind, SourceSettings,
};
use pxidx_core::utils::backoff::RetryPolicy;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI overrides
    /// 3. Validate the configuration
    /// 4. Build the loaded configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let mut file_config: FileConfig = toml::from_str(&config_content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        validate(&file_config)?;
        Ok(build_loaded_config(file_config))
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.ingest.start_height == 0 {
        return Err(ConfigError::ValidationError(
            "ingest.start_height must be at least 1".to_string(),
        ));
    }
    if config.ingest.retry_base_delay_ms > config.ingest.retry_max_delay_ms {
        return Err(ConfigError::ValidationError(format!(
            "ingest.retry_base_delay_ms ({}) exceeds ingest.retry_max_delay_ms ({})",
            config.ingest.retry_base_delay_ms, config.ingest.retry_max_delay_ms
        )));
    }
    if config.notifier.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "notifier.max_attempts must be at least 1".to_string(),
        ));
    }
    if config.notifier.secret.is_some() && config.notifier.webhook_url.is_none() {
        return Err(ConfigError::ValidationError(
            "notifier.secret is set but notifier.webhook_url is not".to_string(),
        ));
    }
    if config
        .notifier
        .secret
        .as_deref()
        .is_some_and(|secret| secret.is_empty())
    {
        return Err(ConfigError::ValidationError(
            "notifier.secret must not be empty".to_string(),
        ));
    }
    if config.database.max_connections == 0 {
        return Err(ConfigError::ValidationError(
            "database.max_connections must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn build_loaded_config(file_config: FileConfig) -> LoadedConfig {
    let source = match file_config.source {
        SourceConfig::Http {
            url,
            poll_interval_ms,
        } => SourceSettings {
            kind: SourceKind::Http(url),
            poll_interval: Duration::from_millis(poll_interval_ms),
        },
        SourceConfig::Stdin => SourceSettings {
            kind: SourceKind::Stdin,
            poll_interval: Duration::ZERO,
        },
    };

    LoadedConfig {
        listen: file_config.server.listen,
        max_connections: file_config.database.max_connections,
        source,
        ingest: IngestSettings {
            start_height: file_config.ingest.start_height,
            retry: RetryPolicy {
                max_retries: file_config.ingest.max_block_retries,
                base_delay: Duration::from_millis(file_config.ingest.retry_base_delay_ms),
                max_delay: Duration::from_millis(file_config.ingest.retry_max_delay_ms),
            },
        },
        notifier: NotifierSettings {
            webhook_url: file_config.notifier.webhook_url,
            secret: file_config.notifier.secret.map(String::into_bytes),
            max_attempts: file_config.notifier.max_attempts,
        },
    }
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
