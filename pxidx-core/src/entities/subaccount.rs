use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;
use uuid::Uuid;

pub const WALLETS_PKEY: &str = "wallets_pkey";
pub const SUBACCOUNTS_PKEY: &str = "subaccounts_pkey";
pub const SUBACCOUNTS_ADDRESS_NUMBER_KEY: &str = "subaccounts_address_subaccount_number_key";
pub const ASSET_POSITIONS_SIZE_CHECK: &str = "asset_positions_size_check";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WalletRow {
    pub address: String,
    pub total_trading_rewards: Decimal,
    pub total_volume: Decimal,
}

impl WalletRow {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            total_trading_rewards: Decimal::ZERO,
            total_volume: Decimal::ZERO,
        }
    }

    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        address: &str,
    ) -> Result<Option<WalletRow>, sqlx::Error> {
        sqlx::query_as::<_, WalletRow>(
            "SELECT address, total_trading_rewards, total_volume FROM wallets WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &WalletRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO wallets (address, total_trading_rewards, total_volume) VALUES ($1, $2, $3)",
        )
        .bind(&row.address)
        .bind(row.total_trading_rewards)
        .bind(row.total_volume)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Returns the number of rows updated; zero means the wallet is missing.
    pub async fn add_volume_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        address: &str,
        amount: Decimal,
    ) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("UPDATE wallets SET total_volume = total_volume + $2 WHERE address = $1")
                .bind(address)
                .bind(amount)
                .execute(&mut **tx)
                .await?;
        Ok(result.rows_affected())
    }

    /// Returns the number of rows updated; zero means the wallet is missing.
    pub async fn add_rewards_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        address: &str,
        amount: Decimal,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE wallets SET total_trading_rewards = total_trading_rewards + $2 WHERE address = $1",
        )
        .bind(address)
        .bind(amount)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubaccountRow {
    pub id: Uuid,
    pub address: String,
    pub subaccount_number: i64,
    pub updated_at: OffsetDateTime,
    pub updated_at_height: i64,
}

impl SubaccountRow {
    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<SubaccountRow>, sqlx::Error> {
        sqlx::query_as::<_, SubaccountRow>(
            r#"
            SELECT id, address, subaccount_number, updated_at, updated_at_height
            FROM subaccounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &SubaccountRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO subaccounts (id, address, subaccount_number, updated_at, updated_at_height)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.id)
        .bind(&row.address)
        .bind(row.subaccount_number)
        .bind(row.updated_at)
        .bind(row.updated_at_height)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn touch_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
        updated_at: OffsetDateTime,
        updated_at_height: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE subaccounts SET updated_at = $2, updated_at_height = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(updated_at)
        .bind(updated_at_height)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Balance of one asset held by a subaccount. Never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AssetPositionRow {
    pub id: Uuid,
    pub subaccount_id: Uuid,
    pub asset_id: i64,
    pub size: Decimal,
}

impl AssetPositionRow {
    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        subaccount_id: Uuid,
        asset_id: i64,
    ) -> Result<Option<AssetPositionRow>, sqlx::Error> {
        sqlx::query_as::<_, AssetPositionRow>(
            r#"
            SELECT id, subaccount_id, asset_id, size
            FROM asset_positions
            WHERE subaccount_id = $1 AND asset_id = $2
            "#,
        )
        .bind(subaccount_id)
        .bind(asset_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn upsert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &AssetPositionRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO asset_positions (id, subaccount_id, asset_id, size)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET size = EXCLUDED.size
            "#,
        )
        .bind(row.id)
        .bind(row.subaccount_id)
        .bind(row.asset_id)
        .bind(row.size)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
