use super::EventId;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

/// Movement of an asset between subaccounts, or between a subaccount and a
/// bare wallet for deposits and withdrawals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TransferRow {
    pub id: Uuid,
    pub sender_subaccount_id: Option<Uuid>,
    pub recipient_subaccount_id: Option<Uuid>,
    pub sender_wallet_address: Option<String>,
    pub recipient_wallet_address: Option<String>,
    pub asset_id: i64,
    pub size: Decimal,
    pub event_id: EventId,
    pub transaction_hash: Option<String>,
    pub created_at: OffsetDateTime,
    pub created_at_height: i64,
}

impl TransferRow {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &TransferRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, sender_subaccount_id, recipient_subaccount_id,
                sender_wallet_address, recipient_wallet_address,
                asset_id, size, event_id, transaction_hash, created_at, created_at_height
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(row.id)
        .bind(row.sender_subaccount_id)
        .bind(row.recipient_subaccount_id)
        .bind(&row.sender_wallet_address)
        .bind(&row.recipient_wallet_address)
        .bind(row.asset_id)
        .bind(row.size)
        .bind(row.event_id)
        .bind(&row.transaction_hash)
        .bind(row.created_at)
        .bind(row.created_at_height)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
