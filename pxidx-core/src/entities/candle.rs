use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

pub const CANDLES_PKEY: &str = "candles_pkey";

/// Width of a candle period.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, sqlx::Type,
)]
#[sqlx(type_name = "candle_resolution")]
pub enum CandleResolution {
    #[sqlx(rename = "1MIN")]
    #[serde(rename = "1MIN")]
    OneMinute,
    #[sqlx(rename = "5MINS")]
    #[serde(rename = "5MINS")]
    FiveMinutes,
    #[sqlx(rename = "15MINS")]
    #[serde(rename = "15MINS")]
    FifteenMinutes,
    #[sqlx(rename = "30MINS")]
    #[serde(rename = "30MINS")]
    ThirtyMinutes,
    #[sqlx(rename = "1HOUR")]
    #[serde(rename = "1HOUR")]
    OneHour,
    #[sqlx(rename = "4HOURS")]
    #[serde(rename = "4HOURS")]
    FourHours,
    #[sqlx(rename = "1DAY")]
    #[serde(rename = "1DAY")]
    OneDay,
}

impl CandleResolution {
    pub const ALL: [CandleResolution; 7] = [
        CandleResolution::OneMinute,
        CandleResolution::FiveMinutes,
        CandleResolution::FifteenMinutes,
        CandleResolution::ThirtyMinutes,
        CandleResolution::OneHour,
        CandleResolution::FourHours,
        CandleResolution::OneDay,
    ];

    pub fn seconds(self) -> i64 {
        match self {
            CandleResolution::OneMinute => 60,
            CandleResolution::FiveMinutes => 5 * 60,
            CandleResolution::FifteenMinutes => 15 * 60,
            CandleResolution::ThirtyMinutes => 30 * 60,
            CandleResolution::OneHour => 60 * 60,
            CandleResolution::FourHours => 4 * 60 * 60,
            CandleResolution::OneDay => 24 * 60 * 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CandleResolution::OneMinute => "1MIN",
            CandleResolution::FiveMinutes => "5MINS",
            CandleResolution::FifteenMinutes => "15MINS",
            CandleResolution::ThirtyMinutes => "30MINS",
            CandleResolution::OneHour => "1HOUR",
            CandleResolution::FourHours => "4HOURS",
            CandleResolution::OneDay => "1DAY",
        }
    }

    /// Start of the period containing `time`, aligned to the unix epoch.
    ///
    /// `None` only when the aligned instant is outside the representable
    /// date range.
    pub fn period_start(self, time: OffsetDateTime) -> Option<OffsetDateTime> {
        let into_period = time::Duration::seconds(time.unix_timestamp().rem_euclid(self.seconds()))
            + time::Duration::nanoseconds(i64::from(time.nanosecond()));
        time.checked_sub(into_period)
    }
}

impl std::fmt::Display for CandleResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV of one ticker over one resolution period.
///
/// A period in which the market did not trade is carried as a flat candle at
/// the previous close with zero volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CandleRow {
    pub id: Uuid,
    pub ticker: String,
    pub resolution: CandleResolution,
    pub started_at: OffsetDateTime,
    pub low: Decimal,
    pub high: Decimal,
    pub open: Decimal,
    pub close: Decimal,
    pub base_token_volume: Decimal,
    pub usd_volume: Decimal,
    pub trades: i64,
    pub updated_at_height: i64,
}

impl CandleRow {
    const COLUMNS: &str = "id, ticker, resolution, started_at, low, high, open, close, \
                           base_token_volume, usd_volume, trades, updated_at_height";

    /// Most recent candle of every ticker and resolution.
    pub async fn list_latest_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
    ) -> Result<Vec<CandleRow>, sqlx::Error> {
        sqlx::query_as::<_, CandleRow>(&format!(
            r#"
            SELECT DISTINCT ON (ticker, resolution) {}
            FROM candles
            ORDER BY ticker, resolution, started_at DESC
            "#,
            Self::COLUMNS
        ))
        .fetch_all(&mut **tx)
        .await
    }

    pub async fn upsert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &CandleRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO candles (
                id, ticker, resolution, started_at, low, high, open, close,
                base_token_volume, usd_volume, trades, updated_at_height
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                low = EXCLUDED.low,
                high = EXCLUDED.high,
                open = EXCLUDED.open,
                close = EXCLUDED.close,
                base_token_volume = EXCLUDED.base_token_volume,
                usd_volume = EXCLUDED.usd_volume,
                trades = EXCLUDED.trades,
                updated_at_height = EXCLUDED.updated_at_height
            "#,
        )
        .bind(row.id)
        .bind(&row.ticker)
        .bind(row.resolution)
        .bind(row.started_at)
        .bind(row.low)
        .bind(row.high)
        .bind(row.open)
        .bind(row.close)
        .bind(row.base_token_volume)
        .bind(row.usd_volume)
        .bind(row.trades)
        .bind(row.updated_at_height)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
