use super::VaultStatus;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use serde::Serialize;
use sqlx::Postgres;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct VaultRow {
    pub address: String,
    pub clob_pair_id: i64,
    pub status: VaultStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl VaultRow {
    /// Whether the vault's owner address counts as a vault account.
    pub fn is_member(&self) -> bool {
        self.status != VaultStatus::Deactivated
    }

    pub async fn find_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        address: &str,
    ) -> Result<Option<VaultRow>, sqlx::Error> {
        sqlx::query_as::<_, VaultRow>(
            "SELECT address, clob_pair_id, status, created_at, updated_at FROM vaults WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn upsert_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &VaultRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO vaults (address, clob_pair_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (address) DO UPDATE SET
                clob_pair_id = EXCLUDED.clob_pair_id,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&row.address)
        .bind(row.clob_pair_id)
        .bind(row.status)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
/// Owner addresses of every vault that is not deactivated.
pub struct ListVaultMemberAddresses;

impl Processor<ListVaultMemberAddresses> for DatabaseProcessor {
    type Output = Vec<String>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListVaultMemberAddresses")]
    async fn process(&self, _query: ListVaultMemberAddresses) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT address FROM vaults WHERE status <> 'DEACTIVATED' ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await
    }
}
