//! The store schema is owned by an external migration component; the engine
//! only checks that the deployed contract version is the one it was built for.

use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;

/// Schema contract version this engine reads and writes.
pub const REQUIRED_SCHEMA_VERSION: i32 = 2;

/// Highest schema version recorded in `schema_version`, `None` if the table
/// is empty.
#[derive(Debug, Clone, Copy)]
pub struct GetSchemaVersion;

impl Processor<GetSchemaVersion> for DatabaseProcessor {
    type Output = Option<i32>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetSchemaVersion")]
    async fn process(&self, _query: GetSchemaVersion) -> Result<Option<i32>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<i32>>("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await
    }
}
