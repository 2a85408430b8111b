use pxidx_sdk::objects::events::{RegisterAffiliateEvent, TradingRewardEvent};
use rust_decimal::Decimal;

use super::{HandlerError, MutationSet, ReadContext};
use crate::entities::ids;
use crate::entities::reward::{AffiliateReferralRow, TradingRewardRow};
use crate::mutation::{Mutation, WalletDelta};

pub async fn handle_trading_reward(
    event: &TradingRewardEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let mut out = MutationSet::default();
    for (position, reward) in event.rewards.iter().enumerate() {
        if reward.amount <= Decimal::ZERO {
            return Err(HandlerError::invalid(
                "trading_reward",
                format!("reward for {} must be positive", reward.owner),
            ));
        }
        out.ensure_wallet(ctx, &reward.owner).await?;
        let event_ctx = ctx.event;
        out.push(Mutation::CreateTradingReward(TradingRewardRow {
            id: ids::trading_reward_id(&event_ctx.event_id, position),
            address: reward.owner.clone(),
            amount: reward.amount,
            block_height: event_ctx.block_height(),
            block_time: event_ctx.block_time,
            event_id: event_ctx.event_id,
        }));
        out.push(Mutation::AddWalletRewards(WalletDelta {
            address: reward.owner.clone(),
            amount: reward.amount,
        }));
    }
    Ok(out.into_vec())
}

pub async fn handle_register_affiliate(
    event: &RegisterAffiliateEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    if event.referee == event.affiliate {
        return Err(HandlerError::invalid(
            "register_affiliate",
            "an address cannot refer itself",
        ));
    }
    if ctx
        .store
        .find_affiliate_referral(&event.referee)
        .await?
        .is_some()
    {
        return Err(HandlerError::duplicate("affiliate referral", &event.referee));
    }
    Ok(vec![Mutation::CreateAffiliateReferral(AffiliateReferralRow {
        referee_address: event.referee.clone(),
        affiliate_address: event.affiliate.clone(),
        referred_at_block: ctx.event.block_height(),
    })])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{Harness, event_context};
    use pxidx_sdk::objects::EventPayload;
    use pxidx_sdk::objects::events::AddressAmount;

    fn rewards(entries: &[(&str, i64)]) -> EventPayload {
        EventPayload::TradingReward(TradingRewardEvent {
            rewards: entries
                .iter()
                .map(|(owner, amount)| AddressAmount {
                    owner: owner.to_string(),
                    amount: Decimal::from(*amount),
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_rewards_accumulate_on_wallet() {
        let mut harness = Harness::new().await;
        let event = event_context(20, 0, 0);
        let mutations = harness
            .run(&event, &rewards(&[("dydx1alice", 5), ("dydx1bob", 2)]))
            .await
            .unwrap();
        let reward_ids: Vec<_> = mutations
            .iter()
            .filter_map(|mutation| match mutation {
                Mutation::CreateTradingReward(row) => Some(row.id),
                _ => None,
            })
            .collect();
        assert_eq!(
            reward_ids,
            vec![
                ids::trading_reward_id(&event.event_id, 0),
                ids::trading_reward_id(&event.event_id, 1),
            ]
        );

        harness
            .run(&event_context(21, 0, 0), &rewards(&[("dydx1alice", 3)]))
            .await
            .unwrap();
        let wallet = harness.uow.find_wallet("dydx1alice").await.unwrap().unwrap();
        assert_eq!(wallet.total_trading_rewards, Decimal::from(8));
    }

    #[tokio::test]
    async fn test_zero_reward_is_invalid() {
        let mut harness = Harness::new().await;
        let error = harness
            .run(&event_context(20, 0, 0), &rewards(&[("dydx1alice", 0)]))
            .await
            .unwrap_err();
        assert!(matches!(error, HandlerError::InvalidEvent { .. }));
    }

    #[tokio::test]
    async fn test_referee_registers_once() {
        let mut harness = Harness::new().await;
        let register = |affiliate: &str| {
            EventPayload::RegisterAffiliate(RegisterAffiliateEvent {
                referee: "dydx1referee".to_string(),
                affiliate: affiliate.to_string(),
            })
        };
        harness
            .run(&event_context(30, 0, 0), &register("dydx1affiliate"))
            .await
            .unwrap();
        let error = harness
            .run(&event_context(31, 0, 0), &register("dydx1other"))
            .await
            .unwrap_err();
        assert!(matches!(error, HandlerError::DuplicateEntity { .. }));

        let error = harness
            .run(&event_context(31, 0, 1), &register("dydx1referee"))
            .await
            .unwrap_err();
        assert!(matches!(error, HandlerError::InvalidEvent { .. }));
    }
}
