use super::{EventId, FillType, Liquidity, OrderSide, PositionSide};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

pub const FILLS_PKEY: &str = "fills_pkey";
pub const FILLS_EVENT_ID_FKEY: &str = "fills_event_id_fkey";

/// One side of a match. Each fill event yields one row per participating
/// subaccount.
///
/// The `*_before` columns snapshot the open position prior to this fill so
/// point-in-time position state can be rebuilt from fills alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FillRow {
    pub id: Uuid,
    pub subaccount_id: Uuid,
    pub side: OrderSide,
    pub liquidity: Liquidity,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub fill_type: FillType,
    pub clob_pair_id: i64,
    pub order_id: Option<Uuid>,
    pub size: Decimal,
    pub price: Decimal,
    pub quote_amount: Decimal,
    pub fee: Decimal,
    pub event_id: EventId,
    pub transaction_hash: Option<String>,
    pub created_at: OffsetDateTime,
    pub created_at_height: i64,
    pub position_size_before: Option<Decimal>,
    pub entry_price_before: Option<Decimal>,
    pub position_side_before: Option<PositionSide>,
}

impl FillRow {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &FillRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO fills (
                id, subaccount_id, side, liquidity, type, clob_pair_id, order_id,
                size, price, quote_amount, fee, event_id, transaction_hash,
                created_at, created_at_height,
                position_size_before, entry_price_before, position_side_before
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(row.id)
        .bind(row.subaccount_id)
        .bind(row.side)
        .bind(row.liquidity)
        .bind(row.fill_type)
        .bind(row.clob_pair_id)
        .bind(row.order_id)
        .bind(row.size)
        .bind(row.price)
        .bind(row.quote_amount)
        .bind(row.fee)
        .bind(row.event_id)
        .bind(&row.transaction_hash)
        .bind(row.created_at)
        .bind(row.created_at_height)
        .bind(row.position_size_before)
        .bind(row.entry_price_before)
        .bind(row.position_side_before)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
