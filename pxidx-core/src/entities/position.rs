use super::{EventId, PositionSide, PositionStatus};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

pub const PERPETUAL_POSITIONS_PKEY: &str = "perpetual_positions_pkey";

/// A perpetual position from the fill that opened it until the fill that
/// brought its size back to zero.
///
/// `size` is signed: positive for long, negative for short, zero once closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PerpetualPositionRow {
    pub id: Uuid,
    pub subaccount_id: Uuid,
    pub perpetual_id: i64,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub size: Decimal,
    pub max_size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub sum_open: Decimal,
    pub sum_close: Decimal,
    pub realized_pnl: Decimal,
    pub settled_funding: Decimal,
    pub open_event_id: EventId,
    pub close_event_id: Option<EventId>,
    pub last_event_id: EventId,
    pub created_at: OffsetDateTime,
    pub created_at_height: i64,
    pub closed_at: Option<OffsetDateTime>,
    pub closed_at_height: Option<i64>,
}

impl PerpetualPositionRow {
    const COLUMNS: &str = "id, subaccount_id, perpetual_id, side, status, size, max_size, \
        entry_price, exit_price, sum_open, sum_close, realized_pnl, settled_funding, \
        open_event_id, close_event_id, last_event_id, created_at, created_at_height, \
        closed_at, closed_at_height";

    pub async fn find_open_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        subaccount_id: Uuid,
        perpetual_id: i64,
    ) -> Result<Option<PerpetualPositionRow>, sqlx::Error> {
        sqlx::query_as::<_, PerpetualPositionRow>(&format!(
            r#"
            SELECT {}
            FROM perpetual_positions
            WHERE subaccount_id = $1 AND perpetual_id = $2 AND status = 'OPEN'
            "#,
            Self::COLUMNS
        ))
        .bind(subaccount_id)
        .bind(perpetual_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &PerpetualPositionRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            INSERT INTO perpetual_positions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
            Self::COLUMNS
        ))
        .bind(row.id)
        .bind(row.subaccount_id)
        .bind(row.perpetual_id)
        .bind(row.side)
        .bind(row.status)
        .bind(row.size)
        .bind(row.max_size)
        .bind(row.entry_price)
        .bind(row.exit_price)
        .bind(row.sum_open)
        .bind(row.sum_close)
        .bind(row.realized_pnl)
        .bind(row.settled_funding)
        .bind(row.open_event_id)
        .bind(row.close_event_id)
        .bind(row.last_event_id)
        .bind(row.created_at)
        .bind(row.created_at_height)
        .bind(row.closed_at)
        .bind(row.closed_at_height)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &PerpetualPositionRow,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE perpetual_positions
            SET status = $2,
                size = $3,
                max_size = $4,
                entry_price = $5,
                exit_price = $6,
                sum_open = $7,
                sum_close = $8,
                realized_pnl = $9,
                settled_funding = $10,
                close_event_id = $11,
                last_event_id = $12,
                closed_at = $13,
                closed_at_height = $14
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.status)
        .bind(row.size)
        .bind(row.max_size)
        .bind(row.entry_price)
        .bind(row.exit_price)
        .bind(row.sum_open)
        .bind(row.sum_close)
        .bind(row.realized_pnl)
        .bind(row.settled_funding)
        .bind(row.close_event_id)
        .bind(row.last_event_id)
        .bind(row.closed_at)
        .bind(row.closed_at_height)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}
