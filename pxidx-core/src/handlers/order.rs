use pxidx_sdk::objects::events::{IndexerOrder, OrderId, RemovalReason, StatefulOrderEvent};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{HandlerError, MutationSet, ReadContext};
use crate::entities::order::OrderRow;
use crate::entities::{OrderStatus, ids};
use crate::mutation::Mutation;

/// Deterministic row id of an order.
pub fn order_uuid(order_id: &OrderId) -> Uuid {
    ids::order_id(
        ids::subaccount_id(&order_id.subaccount_id.owner, order_id.subaccount_id.number),
        order_id.client_id,
        order_id.clob_pair_id,
        order_id.order_flags,
    )
}

pub async fn handle_stateful_order(
    event: &StatefulOrderEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    match event {
        StatefulOrderEvent::Placement { order } => place(order, None, ctx).await,
        StatefulOrderEvent::ConditionalPlacement {
            order,
            trigger_price,
        } => place(order, Some(*trigger_price), ctx).await,
        StatefulOrderEvent::ConditionalTriggered { order_id } => trigger(order_id, ctx).await,
        StatefulOrderEvent::Removal { order_id, reason } => remove(order_id, *reason, ctx).await,
    }
}

fn validate(order: &IndexerOrder, id: Uuid, trigger_price: Option<Decimal>) -> Result<(), HandlerError> {
    let invalid = |reason: &str| HandlerError::InvalidOrder {
        order_id: id,
        reason: reason.to_string(),
    };
    if order.good_til_block.is_some() == order.good_til_block_time.is_some() {
        return Err(invalid(
            "exactly one of goodTilBlock and goodTilBlockTime must be set",
        ));
    }
    if order.size <= Decimal::ZERO {
        return Err(invalid("size must be positive"));
    }
    if order.price <= Decimal::ZERO {
        return Err(invalid("price must be positive"));
    }
    if trigger_price.is_some_and(|price| price <= Decimal::ZERO) {
        return Err(invalid("trigger price must be positive"));
    }
    Ok(())
}

async fn place(
    order: &IndexerOrder,
    trigger_price: Option<Decimal>,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let id = order_uuid(&order.order_id);
    validate(order, id, trigger_price)?;

    let clob_pair_id = i64::from(order.order_id.clob_pair_id);
    if ctx
        .store
        .find_perpetual_market_by_clob_pair(clob_pair_id)
        .await?
        .is_none()
    {
        return Err(HandlerError::missing(
            "perpetual market for clob pair",
            clob_pair_id,
        ));
    }

    let mut out = MutationSet::default();
    let subaccount_id = out
        .ensure_subaccount(ctx, &order.order_id.subaccount_id)
        .await?;
    let created_at_height = ctx
        .store
        .find_order(id)
        .await?
        .map_or(ctx.event.block_height(), |existing| existing.created_at_height);
    let is_vault_order = ctx
        .caches
        .is_vault(&order.order_id.subaccount_id.owner)
        .await;

    out.push(Mutation::PlaceOrder(OrderRow {
        id,
        subaccount_id,
        client_id: i64::from(order.order_id.client_id),
        clob_pair_id,
        order_flags: i64::from(order.order_id.order_flags),
        side: order.side.into(),
        order_type: order.order_type.into(),
        size: order.size,
        total_filled: Decimal::ZERO,
        price: order.price,
        trigger_price,
        status: if trigger_price.is_some() {
            OrderStatus::Untriggered
        } else {
            OrderStatus::Open
        },
        time_in_force: order.time_in_force.into(),
        reduce_only: order.reduce_only,
        client_metadata: i64::from(order.client_metadata),
        good_til_block: order.good_til_block.map(i64::from),
        good_til_block_time: order.good_til_block_time,
        is_vault_order,
        created_at_height,
        updated_at: ctx.event.block_time,
        updated_at_height: ctx.event.block_height(),
        last_event_id: ctx.event.event_id,
    }));
    out.touch_subaccount(ctx.event, subaccount_id);
    Ok(out.into_vec())
}

async fn require_order(ctx: &mut ReadContext<'_>, order_id: &OrderId) -> Result<OrderRow, HandlerError> {
    let id = order_uuid(order_id);
    ctx.store
        .find_order(id)
        .await?
        .ok_or_else(|| HandlerError::missing("order", id))
}

async fn trigger(
    order_id: &OrderId,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let order = require_order(ctx, order_id).await?;
    if order.status != OrderStatus::Untriggered {
        return Err(HandlerError::InvalidOrder {
            order_id: order.id,
            reason: format!("cannot trigger an order in status {:?}", order.status),
        });
    }
    Ok(vec![Mutation::UpdateOrderState(OrderRow {
        status: OrderStatus::Open,
        updated_at: ctx.event.block_time,
        updated_at_height: ctx.event.block_height(),
        last_event_id: ctx.event.event_id,
        ..order
    })])
}

async fn remove(
    order_id: &OrderId,
    reason: RemovalReason,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let order = require_order(ctx, order_id).await?;
    let status = match (order.status, reason) {
        (OrderStatus::Filled, _) => OrderStatus::Filled,
        (_, RemovalReason::BestEffortCanceled) => OrderStatus::BestEffortCanceled,
        _ => OrderStatus::Canceled,
    };
    if status == OrderStatus::Filled {
        tracing::debug!(order_id = %order.id, ?reason, "Removal of a filled order keeps FILLED");
    }
    let subaccount_id = order.subaccount_id;
    let mut out = MutationSet::default();
    out.push(Mutation::UpdateOrderState(OrderRow {
        status,
        updated_at: ctx.event.block_time,
        updated_at_height: ctx.event.block_height(),
        last_event_id: ctx.event.event_id,
        ..order
    }));
    out.touch_subaccount(ctx.event, subaccount_id);
    Ok(out.into_vec())
}
