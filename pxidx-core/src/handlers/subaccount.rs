use std::collections::BTreeMap;

use pxidx_sdk::objects::events::SubaccountUpdateEvent;
use rust_decimal::Decimal;

use super::{HandlerError, MutationSet, ReadContext, amount};
use crate::entities::ids;
use crate::entities::position::PerpetualPositionRow;
use crate::entities::subaccount::AssetPositionRow;
use crate::mutation::Mutation;

/// Absolute asset balances and funding settlements reported for one
/// subaccount.
pub async fn handle_subaccount_update(
    event: &SubaccountUpdateEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let mut out = MutationSet::default();
    let subaccount_id = out.ensure_subaccount(ctx, &event.subaccount_id).await?;

    for balance in &event.updated_asset_positions {
        let asset_id = i64::from(balance.asset_id);
        if ctx.store.find_asset(asset_id).await?.is_none() {
            return Err(HandlerError::missing("asset", asset_id));
        }
        if balance.size < Decimal::ZERO {
            return Err(HandlerError::NegativeBalance {
                subaccount_id,
                asset_id,
                balance: balance.size,
            });
        }
        out.push(Mutation::UpsertAssetPosition(AssetPositionRow {
            id: ids::asset_position_id(subaccount_id, asset_id),
            subaccount_id,
            asset_id,
            size: balance.size,
        }));
    }

    let mut settled: BTreeMap<i64, PerpetualPositionRow> = BTreeMap::new();
    for settlement in &event.updated_perpetual_positions {
        let perpetual_id = i64::from(settlement.perpetual_id);
        let mut position = match settled.remove(&perpetual_id) {
            Some(position) => position,
            None => ctx
                .store
                .find_open_position(subaccount_id, perpetual_id)
                .await?
                .ok_or_else(|| {
                    HandlerError::missing(
                        "open perpetual position",
                        format!("{subaccount_id}/{perpetual_id}"),
                    )
                })?,
        };
        position.settled_funding = amount::add(
            position.settled_funding,
            settlement.settled_funding,
            "settled funding",
        )?;
        position.last_event_id = ctx.event.event_id;
        settled.insert(perpetual_id, position);
    }
    for position in settled.into_values() {
        out.push(Mutation::UpdatePerpetualPosition(position));
    }

    out.touch_subaccount(ctx.event, subaccount_id);
    Ok(out.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{Harness, event_context, limit_order, subaccount};
    use pxidx_sdk::objects::events::{
        AssetBalance, FillTaker, FundingSettlement, OrderFillEvent, StatefulOrderEvent,
    };
    use pxidx_sdk::objects::{EventPayload, OrderSide};

    fn update(owner: &str, size: i64, funding: Option<i64>) -> EventPayload {
        EventPayload::SubaccountUpdate(SubaccountUpdateEvent {
            subaccount_id: subaccount(owner),
            updated_asset_positions: vec![AssetBalance {
                asset_id: 0,
                size: Decimal::from(size),
            }],
            updated_perpetual_positions: funding
                .map(|amount| FundingSettlement {
                    perpetual_id: 0,
                    settled_funding: Decimal::from(amount),
                })
                .into_iter()
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_update_creates_subaccount_and_sets_absolute_balance() {
        let mut harness = Harness::new().await.with_btc_market().await;
        harness
            .run(&event_context(10, 0, 0), &update("dydx1carol", 700, None))
            .await
            .unwrap();
        harness
            .run(&event_context(11, 0, 0), &update("dydx1carol", 650, None))
            .await
            .unwrap();
        let id = ids::subaccount_id("dydx1carol", 0);
        let subaccount = harness.uow.find_subaccount(id).await.unwrap().unwrap();
        assert_eq!(subaccount.updated_at_height, 11);
        let position = harness
            .uow
            .find_asset_position(id, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.size, Decimal::from(650));
    }

    #[tokio::test]
    async fn test_negative_balance_is_rejected() {
        let mut harness = Harness::new().await.with_btc_market().await;
        let error = harness
            .run(&event_context(10, 0, 0), &update("dydx1carol", -1, None))
            .await
            .unwrap_err();
        assert!(matches!(error, HandlerError::NegativeBalance { .. }));
    }

    #[tokio::test]
    async fn test_funding_requires_open_position() {
        let mut harness = Harness::new().await.with_btc_market().await;
        let error = harness
            .run(&event_context(10, 0, 0), &update("dydx1carol", 10, Some(3)))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            HandlerError::MissingEntity {
                kind: "open perpetual position",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_funding_accumulates_on_open_position() {
        let mut harness = Harness::new().await.with_btc_market().await;
        for (index, (owner, client_id, side)) in [
            ("dydx1maker", 1, OrderSide::Sell),
            ("dydx1taker", 2, OrderSide::Buy),
        ]
        .into_iter()
        .enumerate()
        {
            harness
                .run(
                    &event_context(10, 0, index as u32),
                    &EventPayload::StatefulOrder(StatefulOrderEvent::Placement {
                        order: limit_order(owner, client_id, side),
                    }),
                )
                .await
                .unwrap();
        }
        harness
            .run(
                &event_context(10, 1, 0),
                &EventPayload::OrderFill(OrderFillEvent {
                    maker_order_id: crate::handlers::testing::order_id("dydx1maker", 1),
                    taker: FillTaker::Order {
                        order_id: crate::handlers::testing::order_id("dydx1taker", 2),
                    },
                    fill_amount: Decimal::from(2),
                    maker_fee: Decimal::ZERO,
                    taker_fee: Decimal::ZERO,
                    total_filled_maker: Decimal::from(2),
                    total_filled_taker: Decimal::from(2),
                }),
            )
            .await
            .unwrap();
        harness
            .run(&event_context(11, 0, 0), &update("dydx1taker", 0, Some(-4)))
            .await
            .unwrap();
        harness
            .run(&event_context(12, 0, 0), &update("dydx1taker", 0, Some(1)))
            .await
            .unwrap();
        let position = harness
            .uow
            .find_open_position(ids::subaccount_id("dydx1taker", 0), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.settled_funding, Decimal::from(-3));
        assert_eq!(position.size, Decimal::from(2));
    }
}
