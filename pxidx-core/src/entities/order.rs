use super::{EventId, OrderSide, OrderStatus, OrderType, TimeInForce};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

pub const ORDERS_PKEY: &str = "orders_pkey";
/// `CHECK ((good_til_block IS NULL) <> (good_til_block_time IS NULL))`
pub const ORDERS_GOOD_TIL_CHECK: &str = "orders_good_til_check";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderRow {
    pub id: Uuid,
    pub subaccount_id: Uuid,
    pub client_id: i64,
    pub clob_pair_id: i64,
    pub order_flags: i64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: Decimal,
    pub total_filled: Decimal,
    pub price: Decimal,
    pub trigger_price: Option<Decimal>,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub client_metadata: i64,
    pub good_til_block: Option<i64>,
    pub good_til_block_time: Option<OffsetDateTime>,
    pub is_vault_order: bool,
    pub created_at_height: i64,
    pub updated_at: OffsetDateTime,
    pub updated_at_height: i64,
    pub last_event_id: EventId,
}

impl OrderRow {
    const COLUMNS: &str = "id, subaccount_id, client_id, clob_pair_id, order_flags, side, \
        order_type, size, total_filled, price, trigger_price, status, time_in_force, reduce_only, \
        client_metadata, good_til_block, good_til_block_time, is_vault_order, created_at_height, \
        updated_at, updated_at_height, last_event_id";

    /// Exactly one expiry must be set.
    pub fn has_valid_good_til(&self) -> bool {
        self.good_til_block.is_some() != self.good_til_block_time.is_some()
    }

    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<OrderRow>, sqlx::Error> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            Self::COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Insert or fully replace an order row.
    ///
    /// Replacement keeps `created_at_height` of the original placement.
    pub async fn upsert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &OrderRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            INSERT INTO orders ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (id) DO UPDATE SET
                side = EXCLUDED.side,
                order_type = EXCLUDED.order_type,
                size = EXCLUDED.size,
                total_filled = EXCLUDED.total_filled,
                price = EXCLUDED.price,
                trigger_price = EXCLUDED.trigger_price,
                status = EXCLUDED.status,
                time_in_force = EXCLUDED.time_in_force,
                reduce_only = EXCLUDED.reduce_only,
                client_metadata = EXCLUDED.client_metadata,
                good_til_block = EXCLUDED.good_til_block,
                good_til_block_time = EXCLUDED.good_til_block_time,
                is_vault_order = EXCLUDED.is_vault_order,
                updated_at = EXCLUDED.updated_at,
                updated_at_height = EXCLUDED.updated_at_height,
                last_event_id = EXCLUDED.last_event_id
            "#,
            Self::COLUMNS
        ))
        .bind(row.id)
        .bind(row.subaccount_id)
        .bind(row.client_id)
        .bind(row.clob_pair_id)
        .bind(row.order_flags)
        .bind(row.side)
        .bind(row.order_type)
        .bind(row.size)
        .bind(row.total_filled)
        .bind(row.price)
        .bind(row.trigger_price)
        .bind(row.status)
        .bind(row.time_in_force)
        .bind(row.reduce_only)
        .bind(row.client_metadata)
        .bind(row.good_til_block)
        .bind(row.good_til_block_time)
        .bind(row.is_vault_order)
        .bind(row.created_at_height)
        .bind(row.updated_at)
        .bind(row.updated_at_height)
        .bind(row.last_event_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Update the fill progress and lifecycle columns of an existing order.
    pub async fn update_state_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &OrderRow,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET total_filled = $2,
                status = $3,
                updated_at = $4,
                updated_at_height = $5,
                last_event_id = $6
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.total_filled)
        .bind(row.status)
        .bind(row.updated_at)
        .bind(row.updated_at_height)
        .bind(row.last_event_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}
