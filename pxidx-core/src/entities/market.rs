use super::{EventId, PerpetualMarketStatus};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MarketRow {
    pub id: i64,
    pub pair: String,
    pub exponent: i32,
    pub min_price_change_ppm: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityTierRow {
    pub id: i64,
    pub name: String,
    pub initial_margin_ppm: i64,
    pub maintenance_fraction_ppm: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PerpetualMarketRow {
    pub id: i64,
    pub clob_pair_id: i64,
    pub ticker: String,
    pub market_id: i64,
    pub liquidity_tier_id: i64,
    pub status: PerpetualMarketStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AssetRow {
    pub id: i64,
    pub symbol: String,
    pub atomic_resolution: i32,
}

/// One point of the append-only oracle price series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OraclePriceRow {
    pub id: Uuid,
    pub market_id: i64,
    pub price: Decimal,
    pub effective_at: OffsetDateTime,
    pub effective_at_height: i64,
    pub event_id: EventId,
}

/// Latest price of a market joined with its pair, used to warm the cache.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LatestOraclePrice {
    pub market_id: i64,
    pub pair: String,
    pub price: Decimal,
    pub effective_at_height: i64,
}

impl MarketRow {
    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<Option<MarketRow>, sqlx::Error> {
        sqlx::query_as::<_, MarketRow>(
            "SELECT id, pair, exponent, min_price_change_ppm FROM markets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &MarketRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO markets (id, pair, exponent, min_price_change_ppm) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.id)
        .bind(&row.pair)
        .bind(row.exponent)
        .bind(row.min_price_change_ppm)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &MarketRow,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE markets SET pair = $2, exponent = $3, min_price_change_ppm = $4 WHERE id = $1",
        )
        .bind(row.id)
        .bind(&row.pair)
        .bind(row.exponent)
        .bind(row.min_price_change_ppm)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}

impl LiquidityTierRow {
    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<Option<LiquidityTierRow>, sqlx::Error> {
        sqlx::query_as::<_, LiquidityTierRow>(
            r#"
            SELECT id, name, initial_margin_ppm, maintenance_fraction_ppm
            FROM liquidity_tiers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn upsert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &LiquidityTierRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO liquidity_tiers (id, name, initial_margin_ppm, maintenance_fraction_ppm)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                initial_margin_ppm = EXCLUDED.initial_margin_ppm,
                maintenance_fraction_ppm = EXCLUDED.maintenance_fraction_ppm
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.initial_margin_ppm)
        .bind(row.maintenance_fraction_ppm)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

impl PerpetualMarketRow {
    const COLUMNS: &str = "id, clob_pair_id, ticker, market_id, liquidity_tier_id, status";

    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<Option<PerpetualMarketRow>, sqlx::Error> {
        sqlx::query_as::<_, PerpetualMarketRow>(&format!(
            "SELECT {} FROM perpetual_markets WHERE id = $1",
            Self::COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn find_by_clob_pair_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        clob_pair_id: i64,
    ) -> Result<Option<PerpetualMarketRow>, sqlx::Error> {
        sqlx::query_as::<_, PerpetualMarketRow>(&format!(
            "SELECT {} FROM perpetual_markets WHERE clob_pair_id = $1",
            Self::COLUMNS
        ))
        .bind(clob_pair_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &PerpetualMarketRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO perpetual_markets
                (id, clob_pair_id, ticker, market_id, liquidity_tier_id, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(row.clob_pair_id)
        .bind(&row.ticker)
        .bind(row.market_id)
        .bind(row.liquidity_tier_id)
        .bind(row.status)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update_status_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: i64,
        status: PerpetualMarketStatus,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE perpetual_markets SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}

impl AssetRow {
    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<Option<AssetRow>, sqlx::Error> {
        sqlx::query_as::<_, AssetRow>("SELECT id, symbol, atomic_resolution FROM assets WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &AssetRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO assets (id, symbol, atomic_resolution) VALUES ($1, $2, $3)")
            .bind(row.id)
            .bind(&row.symbol)
            .bind(row.atomic_resolution)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

impl OraclePriceRow {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &OraclePriceRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO oracle_prices
                (id, market_id, price, effective_at, effective_at_height, event_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(row.market_id)
        .bind(row.price)
        .bind(row.effective_at)
        .bind(row.effective_at_height)
        .bind(row.event_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
/// Latest oracle price of every market that has one.
pub struct ListLatestOraclePrices;

impl Processor<ListLatestOraclePrices> for DatabaseProcessor {
    type Output = Vec<LatestOraclePrice>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListLatestOraclePrices")]
    async fn process(
        &self,
        _query: ListLatestOraclePrices,
    ) -> Result<Vec<LatestOraclePrice>, sqlx::Error> {
        sqlx::query_as::<_, LatestOraclePrice>(
            r#"
            SELECT DISTINCT ON (p.market_id)
                p.market_id, m.pair, p.price, p.effective_at_height
            FROM oracle_prices p
            JOIN markets m ON m.id = p.market_id
            ORDER BY p.market_id, p.event_id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }
}
