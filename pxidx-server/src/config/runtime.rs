//! Validated configuration handed to the rest of the server.

use pxidx_core::utils::backoff::RetryPolicy;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub listen: SocketAddr,
    pub max_connections: u32,
    pub source: SourceSettings,
    pub ingest: IngestSettings,
    pub notifier: NotifierSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Http(Url),
    Stdin,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub start_height: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub webhook_url: Option<Url>,
    pub secret: Option<Vec<u8>>,
    pub max_attempts: u32,
}
