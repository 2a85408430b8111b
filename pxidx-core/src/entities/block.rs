use super::EventId;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

/// Primary key of `blocks`; a violation means the height is already committed.
pub const BLOCKS_PKEY: &str = "blocks_pkey";
/// Primary key of `tendermint_events`, the per-event idempotency guard.
pub const TENDERMINT_EVENTS_PKEY: &str = "tendermint_events_pkey";
pub const TRANSACTIONS_HEIGHT_INDEX_KEY: &str = "transactions_block_height_transaction_index_key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BlockRow {
    pub block_height: i64,
    pub time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TendermintEventRow {
    pub id: EventId,
    pub block_height: i64,
    /// `None` for begin-block and end-block events.
    pub transaction_index: Option<i64>,
    pub event_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRow {
    pub id: Uuid,
    pub block_height: i64,
    pub transaction_index: i64,
    pub transaction_hash: String,
}

impl BlockRow {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &BlockRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO blocks (block_height, time) VALUES ($1, $2)")
            .bind(row.block_height)
            .bind(row.time)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

impl TendermintEventRow {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &TendermintEventRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tendermint_events (id, block_height, transaction_index, event_index)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(row.id)
        .bind(row.block_height)
        .bind(row.transaction_index)
        .bind(row.event_index)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

impl TransactionRow {
    /// Insert all transactions of a block in a single query.
    pub async fn insert_many_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        rows: &[TransactionRow],
    ) -> Result<u64, sqlx::Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO transactions (id, block_height, transaction_index, transaction_hash) ",
        );
        query_builder.push_values(rows, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.block_height)
                .push_bind(row.transaction_index)
                .push_bind(row.transaction_hash.clone());
        });

        let result = query_builder.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Copy)]
/// Highest committed block height, `None` on an empty store.
pub struct GetLastCommittedHeight;

impl Processor<GetLastCommittedHeight> for DatabaseProcessor {
    type Output = Option<i64>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLastCommittedHeight")]
    async fn process(&self, _query: GetLastCommittedHeight) -> Result<Option<i64>, sqlx::Error> {
        let height = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(block_height) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(height)
    }
}
