use std::collections::HashMap;

use pxidx_sdk::objects::events::{TransferEvent, TransferParty};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{HandlerError, MutationSet, ReadContext, amount};
use crate::entities::ids;
use crate::entities::subaccount::AssetPositionRow;
use crate::entities::transfer::TransferRow;
use crate::mutation::Mutation;

const SUBTYPE: &str = "transfer";

/// Resolved side of a transfer.
struct Party {
    subaccount_id: Option<Uuid>,
    wallet_address: Option<String>,
}

async fn resolve(
    party: &TransferParty,
    role: &str,
    is_sender: bool,
    out: &mut MutationSet,
    ctx: &mut ReadContext<'_>,
) -> Result<Party, HandlerError> {
    let subaccount_id = match &party.subaccount_id {
        Some(subaccount) if is_sender => Some(ctx.require_subaccount(subaccount).await?.id),
        Some(subaccount) => Some(out.ensure_subaccount(ctx, subaccount).await?),
        None => None,
    };
    if let Some(address) = &party.address {
        out.ensure_wallet(ctx, address).await?;
    }
    if subaccount_id.is_none() && party.address.is_none() {
        return Err(HandlerError::invalid(
            SUBTYPE,
            format!("{role} has neither a subaccount nor an address"),
        ));
    }
    Ok(Party {
        subaccount_id,
        wallet_address: party.address.clone(),
    })
}

/// Asset balances read once per subaccount and then tracked locally, so a
/// transfer between two positions of one subaccount nets out.
#[derive(Default)]
struct Balances {
    sizes: HashMap<Uuid, Decimal>,
}

impl Balances {
    async fn adjust(
        &mut self,
        ctx: &mut ReadContext<'_>,
        subaccount_id: Uuid,
        asset_id: i64,
        delta: Decimal,
    ) -> Result<Decimal, HandlerError> {
        let current = match self.sizes.get(&subaccount_id) {
            Some(size) => *size,
            None => ctx
                .store
                .find_asset_position(subaccount_id, asset_id)
                .await?
                .map_or(Decimal::ZERO, |position| position.size),
        };
        let balance = amount::add(current, delta, "asset balance")?;
        if balance < Decimal::ZERO {
            return Err(HandlerError::NegativeBalance {
                subaccount_id,
                asset_id,
                balance,
            });
        }
        self.sizes.insert(subaccount_id, balance);
        Ok(balance)
    }
}

/// Moves an asset between subaccounts, or in and out of bare wallets for
/// deposits and withdrawals.
pub async fn handle_transfer(
    event: &TransferEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    if event.amount <= Decimal::ZERO {
        return Err(HandlerError::invalid(SUBTYPE, "amount must be positive"));
    }
    let asset_id = i64::from(event.asset_id);
    if ctx.store.find_asset(asset_id).await?.is_none() {
        return Err(HandlerError::missing("asset", asset_id));
    }

    let mut out = MutationSet::default();
    let sender = resolve(&event.sender, "sender", true, &mut out, ctx).await?;
    let recipient = resolve(&event.recipient, "recipient", false, &mut out, ctx).await?;

    let mut balances = Balances::default();
    let legs = [
        (sender.subaccount_id, -event.amount),
        (recipient.subaccount_id, event.amount),
    ];
    let mut updated = Vec::new();
    for (subaccount_id, delta) in legs {
        let Some(subaccount_id) = subaccount_id else {
            continue;
        };
        balances.adjust(ctx, subaccount_id, asset_id, delta).await?;
        if !updated.contains(&subaccount_id) {
            updated.push(subaccount_id);
        }
    }
    for subaccount_id in updated {
        let size = balances.sizes.get(&subaccount_id).copied().unwrap_or_default();
        out.push(Mutation::UpsertAssetPosition(AssetPositionRow {
            id: ids::asset_position_id(subaccount_id, asset_id),
            subaccount_id,
            asset_id,
            size,
        }));
        out.touch_subaccount(ctx.event, subaccount_id);
    }

    let event_ctx = ctx.event;
    out.push(Mutation::CreateTransfer(TransferRow {
        id: ids::transfer_id(&event_ctx.event_id),
        sender_subaccount_id: sender.subaccount_id,
        recipient_subaccount_id: recipient.subaccount_id,
        sender_wallet_address: sender.wallet_address,
        recipient_wallet_address: recipient.wallet_address,
        asset_id,
        size: event.amount,
        event_id: event_ctx.event_id,
        transaction_hash: event_ctx.tx_hash.clone(),
        created_at: event_ctx.block_time,
        created_at_height: event_ctx.block_height(),
    }));
    Ok(out.into_vec())
}
