//! Perpetual position arithmetic shared by fill and deleveraging handlers.

use std::collections::HashMap;

use rust_decimal::Decimal;
use uuid::Uuid;

use super::{EventContext, HandlerError, MutationSet, ReadContext, amount};
use crate::entities::fill::FillRow;
use crate::entities::position::PerpetualPositionRow;
use crate::entities::{FillType, Liquidity, OrderSide, PositionSide, PositionStatus, ids};
use crate::mutation::Mutation;

/// Realized PnL of closing part of a position.
pub trait RealizedPnl: Send + Sync {
    fn realized(
        &self,
        side: PositionSide,
        entry_price: Decimal,
        exit_price: Decimal,
        closed_size: Decimal,
    ) -> Result<Decimal, HandlerError>;
}

/// Average-cost PnL: `(exit - entry) * size`, negated for shorts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageCostPnl;

impl RealizedPnl for AverageCostPnl {
    fn realized(
        &self,
        side: PositionSide,
        entry_price: Decimal,
        exit_price: Decimal,
        closed_size: Decimal,
    ) -> Result<Decimal, HandlerError> {
        let per_unit = amount::sub(exit_price, entry_price, "realized pnl")?;
        let pnl = amount::mul(per_unit, closed_size, "realized pnl")?;
        Ok(match side {
            PositionSide::Long => pnl,
            PositionSide::Short => -pnl,
        })
    }
}

/// A fill as seen by one subaccount's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionFill {
    pub subaccount_id: Uuid,
    pub perpetual_id: i64,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
}

/// Rows a fill writes: the existing position it changed, and a position it
/// opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionTransition {
    pub updated: Option<PerpetualPositionRow>,
    pub opened: Option<PerpetualPositionRow>,
}

impl PositionTransition {
    /// The open position after the fill, if any.
    pub fn open_after(&self) -> Option<&PerpetualPositionRow> {
        self.opened.as_ref().or(self
            .updated
            .as_ref()
            .filter(|position| position.status == PositionStatus::Open))
    }
}

fn open_position(fill: &PositionFill, signed_size: Decimal, event: &EventContext) -> PerpetualPositionRow {
    let side = if signed_size > Decimal::ZERO {
        PositionSide::Long
    } else {
        PositionSide::Short
    };
    let size = signed_size.abs();
    PerpetualPositionRow {
        id: ids::perpetual_position_id(fill.subaccount_id, fill.perpetual_id, &event.event_id, side),
        subaccount_id: fill.subaccount_id,
        perpetual_id: fill.perpetual_id,
        side,
        status: PositionStatus::Open,
        size: signed_size,
        max_size: size,
        entry_price: fill.price,
        exit_price: None,
        sum_open: size,
        sum_close: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        settled_funding: Decimal::ZERO,
        open_event_id: event.event_id,
        close_event_id: None,
        last_event_id: event.event_id,
        created_at: event.block_time,
        created_at_height: event.block_height(),
        closed_at: None,
        closed_at_height: None,
    }
}

/// Apply one fill to the subaccount's open position.
///
/// Increasing a position moves the entry price to the size-weighted average.
/// Reducing it realizes PnL on the closed size and averages the exit price.
/// A reduction past zero closes the position and opens a new one on the
/// other side with the remainder at the fill price.
pub fn apply_fill(
    current: Option<&PerpetualPositionRow>,
    fill: &PositionFill,
    event: &EventContext,
    pnl: &dyn RealizedPnl,
) -> Result<PositionTransition, HandlerError> {
    let signed = match fill.side {
        OrderSide::Buy => fill.size,
        OrderSide::Sell => -fill.size,
    };
    let Some(position) = current else {
        return Ok(PositionTransition {
            updated: None,
            opened: Some(open_position(fill, signed, event)),
        });
    };

    let held = position.size.abs();
    let same_direction = (position.size > Decimal::ZERO) == (signed > Decimal::ZERO);
    if same_direction {
        let size = amount::add(held, fill.size, "position size")?;
        let cost = amount::add(
            amount::mul(position.entry_price, held, "position cost")?,
            amount::mul(fill.price, fill.size, "position cost")?,
            "position cost",
        )?;
        return Ok(PositionTransition {
            updated: Some(PerpetualPositionRow {
                size: amount::add(position.size, signed, "position size")?,
                max_size: position.max_size.max(size),
                entry_price: amount::div(cost, size, "entry price")?,
                sum_open: amount::add(position.sum_open, fill.size, "position sum open")?,
                last_event_id: event.event_id,
                ..position.clone()
            }),
            opened: None,
        });
    }

    let closed = fill.size.min(held);
    let sum_close = amount::add(position.sum_close, closed, "position sum close")?;
    let exit_price = match position.exit_price {
        Some(exit) => {
            let proceeds = amount::add(
                amount::mul(exit, position.sum_close, "exit proceeds")?,
                amount::mul(fill.price, closed, "exit proceeds")?,
                "exit proceeds",
            )?;
            amount::div(proceeds, sum_close, "exit price")?
        }
        None => fill.price,
    };
    // closed <= min(held, fill size), so these differences cannot overflow.
    let remaining = if position.size > Decimal::ZERO {
        position.size - closed
    } else {
        position.size + closed
    };
    let realized = pnl.realized(position.side, position.entry_price, fill.price, closed)?;
    let mut updated = PerpetualPositionRow {
        size: remaining,
        exit_price: Some(exit_price),
        sum_close,
        realized_pnl: amount::add(position.realized_pnl, realized, "realized pnl")?,
        last_event_id: event.event_id,
        ..position.clone()
    };
    if remaining.is_zero() {
        updated.status = PositionStatus::Closed;
        updated.close_event_id = Some(event.event_id);
        updated.closed_at = Some(event.block_time);
        updated.closed_at_height = Some(event.block_height());
    }

    let flipped = fill.size - closed;
    let opened = (flipped > Decimal::ZERO).then(|| {
        let signed_remainder = if signed > Decimal::ZERO { flipped } else { -flipped };
        open_position(fill, signed_remainder, event)
    });
    Ok(PositionTransition {
        updated: Some(updated),
        opened,
    })
}

/// Open positions touched by the event being handled.
///
/// Reads do not see this handler's own pending writes, so a self-trade
/// would otherwise apply its second leg to a stale position.
#[derive(Debug, Default)]
pub(crate) struct PositionBook {
    positions: HashMap<(Uuid, i64), Option<PerpetualPositionRow>>,
}

impl PositionBook {
    pub async fn open_position(
        &mut self,
        ctx: &mut ReadContext<'_>,
        subaccount_id: Uuid,
        perpetual_id: i64,
    ) -> Result<Option<PerpetualPositionRow>, HandlerError> {
        if let Some(position) = self.positions.get(&(subaccount_id, perpetual_id)) {
            return Ok(position.clone());
        }
        let position = ctx
            .store
            .find_open_position(subaccount_id, perpetual_id)
            .await?;
        self.positions
            .insert((subaccount_id, perpetual_id), position.clone());
        Ok(position)
    }

    fn record(&mut self, subaccount_id: Uuid, perpetual_id: i64, position: Option<PerpetualPositionRow>) {
        self.positions.insert((subaccount_id, perpetual_id), position);
    }
}

/// One subaccount's side of a match.
#[derive(Debug, Clone)]
pub(crate) struct FillLeg {
    pub subaccount_id: Uuid,
    pub side: OrderSide,
    pub liquidity: Liquidity,
    pub fill_type: FillType,
    pub clob_pair_id: i64,
    pub perpetual_id: i64,
    pub order_id: Option<Uuid>,
    pub size: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
}

/// Emit the fill row of one leg and the position rows it changes.
pub(crate) async fn record_fill(
    out: &mut MutationSet,
    book: &mut PositionBook,
    ctx: &mut ReadContext<'_>,
    leg: FillLeg,
) -> Result<(), HandlerError> {
    let before = book
        .open_position(ctx, leg.subaccount_id, leg.perpetual_id)
        .await?;
    let event = ctx.event;
    out.push(Mutation::CreateFill(FillRow {
        id: ids::fill_id(&event.event_id, leg.liquidity),
        subaccount_id: leg.subaccount_id,
        side: leg.side,
        liquidity: leg.liquidity,
        fill_type: leg.fill_type,
        clob_pair_id: leg.clob_pair_id,
        order_id: leg.order_id,
        size: leg.size,
        price: leg.price,
        quote_amount: amount::mul(leg.size, leg.price, "quote amount")?,
        fee: leg.fee,
        event_id: event.event_id,
        transaction_hash: event.tx_hash.clone(),
        created_at: event.block_time,
        created_at_height: event.block_height(),
        position_size_before: before.as_ref().map(|position| position.size.abs()),
        entry_price_before: before.as_ref().map(|position| position.entry_price),
        position_side_before: before.as_ref().map(|position| position.side),
    }));

    let transition = apply_fill(
        before.as_ref(),
        &PositionFill {
            subaccount_id: leg.subaccount_id,
            perpetual_id: leg.perpetual_id,
            side: leg.side,
            size: leg.size,
            price: leg.price,
        },
        event,
        ctx.pnl,
    )?;
    book.record(
        leg.subaccount_id,
        leg.perpetual_id,
        transition.open_after().cloned(),
    );
    if let Some(updated) = transition.updated {
        out.push(Mutation::UpdatePerpetualPosition(updated));
    }
    if let Some(opened) = transition.opened {
        out.push(Mutation::CreatePerpetualPosition(opened));
    }
    out.touch_subaccount(event, leg.subaccount_id);
    Ok(())
}
