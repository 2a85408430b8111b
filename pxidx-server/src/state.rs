//! Application state shared across all request handlers.

use pxidx_core::caches::CacheReader;
use pxidx_core::processors::IngestionStatus;
use tokio::sync::watch;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around.
#[derive(Clone)]
pub struct AppState {
    /// Progress published by the ingestion runner.
    pub ingestion: watch::Receiver<IngestionStatus>,
    /// Read-only view of the derived-state caches.
    pub caches: CacheReader,
}

impl AppState {
    pub fn new(ingestion: watch::Receiver<IngestionStatus>, caches: CacheReader) -> Self {
        Self { ingestion, caches }
    }

    /// Latest ingestion status.
    pub fn status(&self) -> IngestionStatus {
        self.ingestion.borrow().clone()
    }
}
