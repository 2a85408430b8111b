use pxidx_sdk::objects::events::{DeleveragingEvent, FillTaker, OrderFillEvent};
use rust_decimal::Decimal;

use super::order::order_uuid;
use super::position::{FillLeg, PositionBook, record_fill};
use super::{HandlerError, MutationSet, ReadContext, amount};
use crate::entities::order::OrderRow;
use crate::entities::{FillType, Liquidity, OrderSide, OrderStatus, OrderType};
use crate::mutation::{Mutation, WalletDelta};

const ORDER_FILL: &str = "order_fill";
const DELEVERAGING: &str = "deleveraging";

async fn require_fillable(
    ctx: &mut ReadContext<'_>,
    order_id: uuid::Uuid,
) -> Result<OrderRow, HandlerError> {
    let order = ctx
        .store
        .find_order(order_id)
        .await?
        .ok_or_else(|| HandlerError::missing("order", order_id))?;
    if !order.status.is_fillable() {
        return Err(HandlerError::NotFillable {
            order_id,
            status: order.status,
        });
    }
    Ok(order)
}

/// New fill progress of an order, taken from the event's running total.
fn advance(order: &OrderRow, total_filled: Decimal, ctx: &ReadContext<'_>) -> Result<OrderRow, HandlerError> {
    if total_filled > order.size {
        return Err(HandlerError::invalid(
            ORDER_FILL,
            format!(
                "order {} filled {total_filled} exceeds its size {}",
                order.id, order.size
            ),
        ));
    }
    if total_filled < order.total_filled {
        return Err(HandlerError::invalid(
            ORDER_FILL,
            format!(
                "order {} filled {total_filled} is below the recorded {}",
                order.id, order.total_filled
            ),
        ));
    }
    let status = if total_filled >= order.size {
        OrderStatus::Filled
    } else {
        order.status
    };
    Ok(OrderRow {
        total_filled,
        status,
        updated_at: ctx.event.block_time,
        updated_at_height: ctx.event.block_height(),
        last_event_id: ctx.event.event_id,
        ..order.clone()
    })
}

fn add_volume(out: &mut MutationSet, address: &str, amount: Decimal) {
    out.push(Mutation::AddWalletVolume(WalletDelta {
        address: address.to_string(),
        amount,
    }));
}

/// A match between a resting maker order and a taker order or liquidation.
///
/// Both legs fill at the maker's price.
pub async fn handle_order_fill(
    event: &OrderFillEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    if event.fill_amount <= Decimal::ZERO {
        return Err(HandlerError::invalid(ORDER_FILL, "fill amount must be positive"));
    }
    let maker = require_fillable(ctx, order_uuid(&event.maker_order_id)).await?;
    let perpetual = ctx
        .store
        .find_perpetual_market_by_clob_pair(maker.clob_pair_id)
        .await?
        .ok_or_else(|| HandlerError::missing("perpetual market for clob pair", maker.clob_pair_id))?;
    let price = maker.price;
    let quote = amount::mul(event.fill_amount, price, "quote amount")?;

    let mut out = MutationSet::default();
    let mut book = PositionBook::default();

    let (taker_leg, taker_order, taker_address) = match &event.taker {
        FillTaker::Order { order_id } => {
            let taker = require_fillable(ctx, order_uuid(order_id)).await?;
            if taker.clob_pair_id != maker.clob_pair_id {
                return Err(HandlerError::invalid(
                    ORDER_FILL,
                    "maker and taker orders are on different clob pairs",
                ));
            }
            if taker.side == maker.side {
                return Err(HandlerError::invalid(
                    ORDER_FILL,
                    "maker and taker orders are on the same side",
                ));
            }
            let fill_type = match taker.order_type {
                OrderType::Market => FillType::Market,
                OrderType::Limit => FillType::Limit,
            };
            let leg = FillLeg {
                subaccount_id: taker.subaccount_id,
                side: taker.side,
                liquidity: Liquidity::Taker,
                fill_type,
                clob_pair_id: taker.clob_pair_id,
                perpetual_id: perpetual.id,
                order_id: Some(taker.id),
                size: event.fill_amount,
                price,
                fee: event.taker_fee,
            };
            let updated = advance(&taker, event.total_filled_taker, ctx)?;
            (leg, Some(updated), order_id.subaccount_id.owner.clone())
        }
        FillTaker::Liquidation { order } => {
            if i64::from(order.clob_pair_id) != maker.clob_pair_id
                || i64::from(order.perpetual_id) != perpetual.id
            {
                return Err(HandlerError::invalid(
                    ORDER_FILL,
                    "liquidation order does not match the maker's market",
                ));
            }
            let side = if order.is_buy {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            if side == maker.side {
                return Err(HandlerError::invalid(
                    ORDER_FILL,
                    "liquidation order is on the maker's side",
                ));
            }
            let liquidated = ctx.require_subaccount(&order.liquidated).await?;
            let leg = FillLeg {
                subaccount_id: liquidated.id,
                side,
                liquidity: Liquidity::Taker,
                fill_type: FillType::Liquidated,
                clob_pair_id: maker.clob_pair_id,
                perpetual_id: perpetual.id,
                order_id: None,
                size: event.fill_amount,
                price,
                fee: event.taker_fee,
            };
            (leg, None, liquidated.address)
        }
    };

    let maker_fill_type = match event.taker {
        FillTaker::Order { .. } => FillType::Limit,
        FillTaker::Liquidation { .. } => FillType::Liquidation,
    };
    out.push(Mutation::UpdateOrderState(advance(
        &maker,
        event.total_filled_maker,
        ctx,
    )?));
    record_fill(
        &mut out,
        &mut book,
        ctx,
        FillLeg {
            subaccount_id: maker.subaccount_id,
            side: maker.side,
            liquidity: Liquidity::Maker,
            fill_type: maker_fill_type,
            clob_pair_id: maker.clob_pair_id,
            perpetual_id: perpetual.id,
            order_id: Some(maker.id),
            size: event.fill_amount,
            price,
            fee: event.maker_fee,
        },
    )
    .await?;

    if let Some(taker_order) = taker_order {
        out.push(Mutation::UpdateOrderState(taker_order));
    }
    record_fill(&mut out, &mut book, ctx, taker_leg).await?;

    add_volume(&mut out, &event.maker_order_id.subaccount_id.owner, quote);
    add_volume(&mut out, &taker_address, quote);
    Ok(out.into_vec())
}

/// Forced match of a liquidated subaccount against an offsetting one.
pub async fn handle_deleveraging(
    event: &DeleveragingEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    if event.fill_amount <= Decimal::ZERO {
        return Err(HandlerError::invalid(DELEVERAGING, "fill amount must be positive"));
    }
    let perpetual_id = i64::from(event.perpetual_id);
    let perpetual = ctx
        .store
        .find_perpetual_market(perpetual_id)
        .await?
        .ok_or_else(|| HandlerError::missing("perpetual market", perpetual_id))?;
    let price = match event.price {
        Some(price) => price,
        None if event.is_final_settlement => {
            ctx.caches
                .oracle_price_by_market(perpetual.market_id)
                .await
                .ok_or(HandlerError::CacheMiss {
                    market_id: perpetual.market_id,
                })?
                .price
        }
        None => {
            return Err(HandlerError::invalid(
                DELEVERAGING,
                "price is required unless settling a final market",
            ));
        }
    };
    if price <= Decimal::ZERO {
        return Err(HandlerError::invalid(DELEVERAGING, "price must be positive"));
    }

    let liquidated = ctx.require_subaccount(&event.liquidated).await?;
    let offsetting = ctx.require_subaccount(&event.offsetting).await?;
    let liquidated_side = if event.is_buy {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    };

    let mut out = MutationSet::default();
    let mut book = PositionBook::default();
    let legs = [
        (&liquidated, liquidated_side, Liquidity::Taker, FillType::Deleveraged),
        (&offsetting, liquidated_side.opposite(), Liquidity::Maker, FillType::Offsetting),
    ];
    for (subaccount, side, liquidity, fill_type) in legs {
        record_fill(
            &mut out,
            &mut book,
            ctx,
            FillLeg {
                subaccount_id: subaccount.id,
                side,
                liquidity,
                fill_type,
                clob_pair_id: perpetual.clob_pair_id,
                perpetual_id,
                order_id: None,
                size: event.fill_amount,
                price,
                fee: Decimal::ZERO,
            },
        )
        .await?;
    }
    let quote = amount::mul(event.fill_amount, price, "quote amount")?;
    add_volume(&mut out, &liquidated.address, quote);
    add_volume(&mut out, &offsetting.address, quote);
    Ok(out.into_vec())
}
