//! TOML file configuration structures.
//!
//! These structs directly map to the `pxidx-config.toml` file format.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port the status endpoints listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Database pool section. The URL itself comes from `DATABASE_URL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

/// Where blocks come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Poll `GET {url}/blocks/{height}`.
    Http {
        url: Url,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
    /// One JSON block per line on stdin.
    Stdin,
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// Block application section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// First height to ask for when the store holds no block yet.
    #[serde(default = "default_start_height")]
    pub start_height: u32,
    /// Retries of a block after a transient failure before ingestion halts.
    #[serde(default = "default_max_block_retries")]
    pub max_block_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            start_height: default_start_height(),
            max_block_retries: default_max_block_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_start_height() -> u32 {
    1
}

fn default_max_block_retries() -> u32 {
    8
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

/// Downstream notification section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Webhook receiving notification batches. Batches are only logged when unset.
    pub webhook_url: Option<Url>,
    /// HMAC key for the `Pxidx-Signature` header.
    pub secret: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}
