use sqlx::PgPool;

/// Pool-backed executor for the read-only [`kanau::processor::Processor`]
/// queries outside a block's unit of work.
#[derive(Debug, Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}
