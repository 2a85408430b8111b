use pxidx_sdk::objects::events::VaultUpsertEvent;

use super::{HandlerError, ReadContext};
use crate::entities::vault::VaultRow;
use crate::mutation::Mutation;

pub async fn handle_vault_upsert(
    event: &VaultUpsertEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let block_time = ctx.event.block_time;
    let created_at = ctx
        .store
        .find_vault(&event.address)
        .await?
        .map_or(block_time, |existing| existing.created_at);
    Ok(vec![Mutation::UpsertVault(VaultRow {
        address: event.address.clone(),
        clob_pair_id: i64::from(event.clob_pair_id),
        status: event.status.into(),
        created_at,
        updated_at: block_time,
    })])
}
