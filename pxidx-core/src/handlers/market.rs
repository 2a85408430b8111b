use pxidx_sdk::objects::events::{
    AssetCreateEvent, LiquidityTierUpsertEvent, MarketEvent, PerpetualMarketCreateEvent,
    UpdateClobPairEvent,
};
use rust_decimal::Decimal;

use super::{HandlerError, ReadContext};
use crate::entities::ids;
use crate::entities::market::{
    AssetRow, LiquidityTierRow, MarketRow, OraclePriceRow, PerpetualMarketRow,
};
use crate::mutation::{Mutation, OraclePriceAppend, PerpetualMarketStatusChange};

pub async fn handle_market(
    event: &MarketEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    match event {
        MarketEvent::Create {
            market_id,
            pair,
            exponent,
            min_price_change_ppm,
        } => {
            let id = i64::from(*market_id);
            if ctx.store.find_market(id).await?.is_some() {
                return Err(HandlerError::duplicate("market", id));
            }
            Ok(vec![Mutation::CreateMarket(MarketRow {
                id,
                pair: pair.clone(),
                exponent: *exponent,
                min_price_change_ppm: i64::from(*min_price_change_ppm),
            })])
        }
        MarketEvent::Modify {
            market_id,
            pair,
            min_price_change_ppm,
        } => {
            let id = i64::from(*market_id);
            let market = ctx
                .store
                .find_market(id)
                .await?
                .ok_or_else(|| HandlerError::missing("market", id))?;
            Ok(vec![Mutation::UpdateMarket(MarketRow {
                pair: pair.clone(),
                min_price_change_ppm: i64::from(*min_price_change_ppm),
                ..market
            })])
        }
        MarketEvent::PriceUpdate { market_id, price } => {
            let id = i64::from(*market_id);
            if *price <= Decimal::ZERO {
                return Err(HandlerError::invalid("market", "oracle price must be positive"));
            }
            let market = ctx
                .store
                .find_market(id)
                .await?
                .ok_or_else(|| HandlerError::missing("market", id))?;
            let event = ctx.event;
            Ok(vec![Mutation::AppendOraclePrice(OraclePriceAppend {
                price: OraclePriceRow {
                    id: ids::oracle_price_id(&event.event_id),
                    market_id: id,
                    price: *price,
                    effective_at: event.block_time,
                    effective_at_height: event.block_height(),
                    event_id: event.event_id,
                },
                pair: market.pair,
            })])
        }
    }
}

pub async fn handle_asset_create(
    event: &AssetCreateEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let id = i64::from(event.id);
    if ctx.store.find_asset(id).await?.is_some() {
        return Err(HandlerError::duplicate("asset", id));
    }
    Ok(vec![Mutation::CreateAsset(AssetRow {
        id,
        symbol: event.symbol.clone(),
        atomic_resolution: event.atomic_resolution,
    })])
}

pub async fn handle_liquidity_tier(
    event: &LiquidityTierUpsertEvent,
    _ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    Ok(vec![Mutation::UpsertLiquidityTier(LiquidityTierRow {
        id: i64::from(event.id),
        name: event.name.clone(),
        initial_margin_ppm: i64::from(event.initial_margin_ppm),
        maintenance_fraction_ppm: i64::from(event.maintenance_fraction_ppm),
    })])
}

pub async fn handle_perpetual_market_create(
    event: &PerpetualMarketCreateEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let id = i64::from(event.id);
    let clob_pair_id = i64::from(event.clob_pair_id);
    if ctx.store.find_perpetual_market(id).await?.is_some() {
        return Err(HandlerError::duplicate("perpetual market", id));
    }
    if ctx
        .store
        .find_perpetual_market_by_clob_pair(clob_pair_id)
        .await?
        .is_some()
    {
        return Err(HandlerError::duplicate(
            "perpetual market for clob pair",
            clob_pair_id,
        ));
    }
    let market_id = i64::from(event.market_id);
    if ctx.store.find_market(market_id).await?.is_none() {
        return Err(HandlerError::missing("market", market_id));
    }
    let liquidity_tier_id = i64::from(event.liquidity_tier_id);
    if ctx
        .store
        .find_liquidity_tier(liquidity_tier_id)
        .await?
        .is_none()
    {
        return Err(HandlerError::missing("liquidity tier", liquidity_tier_id));
    }
    Ok(vec![Mutation::CreatePerpetualMarket(PerpetualMarketRow {
        id,
        clob_pair_id,
        ticker: event.ticker.clone(),
        market_id,
        liquidity_tier_id,
        status: event.status.into(),
    })])
}

pub async fn handle_update_clob_pair(
    event: &UpdateClobPairEvent,
    ctx: &mut ReadContext<'_>,
) -> Result<Vec<Mutation>, HandlerError> {
    let clob_pair_id = i64::from(event.clob_pair_id);
    let perpetual = ctx
        .store
        .find_perpetual_market_by_clob_pair(clob_pair_id)
        .await?
        .ok_or_else(|| HandlerError::missing("perpetual market for clob pair", clob_pair_id))?;
    Ok(vec![Mutation::UpdatePerpetualMarketStatus(
        PerpetualMarketStatusChange {
            id: perpetual.id,
            status: event.status.into(),
        },
    )])
}
