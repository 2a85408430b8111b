use super::EventId;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

pub const AFFILIATE_REFERRED_USERS_PKEY: &str = "affiliate_referred_users_pkey";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TradingRewardRow {
    pub id: Uuid,
    pub address: String,
    pub amount: Decimal,
    pub block_height: i64,
    pub block_time: OffsetDateTime,
    pub event_id: EventId,
}

impl TradingRewardRow {
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &TradingRewardRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO trading_rewards (id, address, amount, block_height, block_time, event_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(&row.address)
        .bind(row.amount)
        .bind(row.block_height)
        .bind(row.block_time)
        .bind(row.event_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

/// Referral link from a referee to the affiliate that referred them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateReferralRow {
    pub referee_address: String,
    pub affiliate_address: String,
    pub referred_at_block: i64,
}

impl AffiliateReferralRow {
    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        referee_address: &str,
    ) -> Result<Option<AffiliateReferralRow>, sqlx::Error> {
        sqlx::query_as::<_, AffiliateReferralRow>(
            r#"
            SELECT referee_address, affiliate_address, referred_at_block
            FROM affiliate_referred_users
            WHERE referee_address = $1
            "#,
        )
        .bind(referee_address)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &AffiliateReferralRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO affiliate_referred_users (referee_address, affiliate_address, referred_at_block)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&row.referee_address)
        .bind(&row.affiliate_address)
        .bind(row.referred_at_block)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
