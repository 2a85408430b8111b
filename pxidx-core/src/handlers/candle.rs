//! Candle aggregation.
//!
//! Runs once per block after every event has been applied. The taker side of
//! each fill is one trade; a block's trades are folded per ticker and merged
//! into the current candle of every resolution. A ticker that traded before
//! gets a flat candle at its previous close when a period starts without
//! trades.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use rust_decimal::Decimal;
use time::OffsetDateTime;

use super::{HandlerError, amount};
use crate::entities::Liquidity;
use crate::entities::candle::{CandleResolution, CandleRow};
use crate::entities::fill::FillRow;
use crate::entities::ids;
use crate::store::StoreReader;

/// OHLCV of one ticker's trades within one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleUpdate {
    pub low: Decimal,
    pub high: Decimal,
    pub open: Decimal,
    pub close: Decimal,
    pub base_token_volume: Decimal,
    pub usd_volume: Decimal,
    pub trades: i64,
}

impl CandleUpdate {
    fn first_trade(price: Decimal, size: Decimal) -> Result<Self, HandlerError> {
        Ok(Self {
            low: price,
            high: price,
            open: price,
            close: price,
            base_token_volume: size,
            usd_volume: amount::mul(price, size, "candle usd volume")?,
            trades: 1,
        })
    }

    /// No trades, every price at `close`.
    fn flat(close: Decimal) -> Self {
        Self {
            low: close,
            high: close,
            open: close,
            close,
            base_token_volume: Decimal::ZERO,
            usd_volume: Decimal::ZERO,
            trades: 0,
        }
    }

    fn push_trade(&mut self, price: Decimal, size: Decimal) -> Result<(), HandlerError> {
        self.low = self.low.min(price);
        self.high = self.high.max(price);
        self.close = price;
        self.base_token_volume = amount::add(self.base_token_volume, size, "candle base volume")?;
        let notional = amount::mul(price, size, "candle usd volume")?;
        self.usd_volume = amount::add(self.usd_volume, notional, "candle usd volume")?;
        self.trades = self.trades.saturating_add(1);
        Ok(())
    }
}

/// Fold the taker fills of a block, in application order, into one update
/// per ticker.
pub async fn block_updates(
    store: &mut dyn StoreReader,
    fills: &[&FillRow],
) -> Result<BTreeMap<String, CandleUpdate>, HandlerError> {
    let mut tickers: HashMap<i64, String> = HashMap::new();
    let mut updates: BTreeMap<String, CandleUpdate> = BTreeMap::new();
    for fill in fills.iter().filter(|fill| fill.liquidity == Liquidity::Taker) {
        let ticker = match tickers.get(&fill.clob_pair_id) {
            Some(ticker) => ticker.clone(),
            None => {
                let market = store
                    .find_perpetual_market_by_clob_pair(fill.clob_pair_id)
                    .await?
                    .ok_or_else(|| HandlerError::missing("clob pair", fill.clob_pair_id))?;
                tickers.insert(fill.clob_pair_id, market.ticker.clone());
                market.ticker
            }
        };
        match updates.entry(ticker) {
            Entry::Vacant(entry) => {
                entry.insert(CandleUpdate::first_trade(fill.price, fill.size)?);
            }
            Entry::Occupied(mut entry) => entry.get_mut().push_trade(fill.price, fill.size)?,
        }
    }
    Ok(updates)
}

/// Candle rows to write for a block at `block_time` with the given trades.
pub async fn block_candles(
    store: &mut dyn StoreReader,
    height: u32,
    block_time: OffsetDateTime,
    fills: &[&FillRow],
) -> Result<Vec<CandleRow>, HandlerError> {
    let updates = block_updates(store, fills).await?;
    let latest: BTreeMap<(String, CandleResolution), CandleRow> = store
        .latest_candles()
        .await?
        .into_iter()
        .map(|candle| ((candle.ticker.clone(), candle.resolution), candle))
        .collect();
    let tickers: BTreeSet<&str> = updates
        .keys()
        .map(String::as_str)
        .chain(latest.keys().map(|(ticker, _)| ticker.as_str()))
        .collect();

    let mut candles = Vec::new();
    for resolution in CandleResolution::ALL {
        let started_at = resolution
            .period_start(block_time)
            .ok_or(HandlerError::Overflow {
                what: "candle start",
            })?;
        let period = Period {
            resolution,
            started_at,
            height: i64::from(height),
        };
        for ticker in &tickers {
            let current = latest.get(&(ticker.to_string(), resolution));
            if let Some(candle) = period.next_candle(ticker, current, updates.get(*ticker))? {
                candles.push(candle);
            }
        }
    }
    Ok(candles)
}

/// The period of one resolution the block falls into.
struct Period {
    resolution: CandleResolution,
    started_at: OffsetDateTime,
    height: i64,
}

impl Period {
    fn open(&self, ticker: &str, update: &CandleUpdate) -> CandleRow {
        CandleRow {
            id: ids::candle_id(ticker, self.resolution, self.started_at.unix_timestamp()),
            ticker: ticker.to_string(),
            resolution: self.resolution,
            started_at: self.started_at,
            low: update.low,
            high: update.high,
            open: update.open,
            close: update.close,
            base_token_volume: update.base_token_volume,
            usd_volume: update.usd_volume,
            trades: update.trades,
            updated_at_height: self.height,
        }
    }

    /// `current` is the ticker's latest candle of this resolution. A block
    /// timestamped before it is merged into it.
    fn next_candle(
        &self,
        ticker: &str,
        current: Option<&CandleRow>,
        update: Option<&CandleUpdate>,
    ) -> Result<Option<CandleRow>, HandlerError> {
        let Some(current) = current else {
            return Ok(update.map(|update| self.open(ticker, update)));
        };
        if current.started_at < self.started_at {
            let candle = match update {
                Some(update) => self.open(ticker, update),
                None => self.open(ticker, &CandleUpdate::flat(current.close)),
            };
            return Ok(Some(candle));
        }
        let Some(update) = update else {
            return Ok(None);
        };
        if current.trades == 0 {
            // A flat candle only carries the previous close.
            return Ok(Some(CandleRow {
                low: update.low,
                high: update.high,
                open: update.open,
                close: update.close,
                base_token_volume: update.base_token_volume,
                usd_volume: update.usd_volume,
                trades: update.trades,
                updated_at_height: self.height,
                ..current.clone()
            }));
        }
        Ok(Some(CandleRow {
            low: current.low.min(update.low),
            high: current.high.max(update.high),
            close: update.close,
            base_token_volume: amount::add(
                current.base_token_volume,
                update.base_token_volume,
                "candle base volume",
            )?,
            usd_volume: amount::add(current.usd_volume, update.usd_volume, "candle usd volume")?,
            trades: current.trades.saturating_add(update.trades),
            updated_at_height: self.height,
            ..current.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn trades_of(prices: &[(i64, i64)]) -> CandleUpdate {
        let mut iter = prices.iter();
        let (price, size) = iter.next().unwrap();
        let mut update = CandleUpdate::first_trade(Decimal::from(*price), Decimal::from(*size)).unwrap();
        for (price, size) in iter {
            update
                .push_trade(Decimal::from(*price), Decimal::from(*size))
                .unwrap();
        }
        update
    }

    fn period(resolution: CandleResolution, at: OffsetDateTime, height: i64) -> Period {
        Period {
            resolution,
            started_at: resolution.period_start(at).unwrap(),
            height,
        }
    }

    #[test]
    fn test_block_update_ohlcv() {
        let update = trades_of(&[(100, 2), (120, 1), (90, 3), (105, 1)]);
        assert_eq!(update.open, Decimal::from(100));
        assert_eq!(update.high, Decimal::from(120));
        assert_eq!(update.low, Decimal::from(90));
        assert_eq!(update.close, Decimal::from(105));
        assert_eq!(update.base_token_volume, Decimal::from(7));
        assert_eq!(update.usd_volume, Decimal::from(200 + 120 + 270 + 105));
        assert_eq!(update.trades, 4);
    }

    #[test]
    fn test_same_period_merges() {
        let minute = period(CandleResolution::OneMinute, datetime!(2024-01-01 10:00:05 UTC), 1);
        let first = minute
            .next_candle("BTC-USD", None, Some(&trades_of(&[(100, 1), (110, 1)])))
            .unwrap()
            .unwrap();

        let later = period(CandleResolution::OneMinute, datetime!(2024-01-01 10:00:50 UTC), 2);
        let merged = later
            .next_candle("BTC-USD", Some(&first), Some(&trades_of(&[(95, 2), (102, 1)])))
            .unwrap()
            .unwrap();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.open, Decimal::from(100));
        assert_eq!(merged.high, Decimal::from(110));
        assert_eq!(merged.low, Decimal::from(95));
        assert_eq!(merged.close, Decimal::from(102));
        assert_eq!(merged.base_token_volume, Decimal::from(5));
        assert_eq!(merged.usd_volume, Decimal::from(100 + 110 + 190 + 102));
        assert_eq!(merged.trades, 4);
        assert_eq!(merged.updated_at_height, 2);

        assert_eq!(later.next_candle("BTC-USD", Some(&merged), None).unwrap(), None);
    }

    #[test]
    fn test_new_period_without_trades_is_flat_at_previous_close() {
        let minute = period(CandleResolution::OneMinute, datetime!(2024-01-01 10:00:05 UTC), 1);
        let first = minute
            .next_candle("BTC-USD", None, Some(&trades_of(&[(100, 1), (110, 1)])))
            .unwrap()
            .unwrap();

        let next = period(CandleResolution::OneMinute, datetime!(2024-01-01 10:01:02 UTC), 2);
        let flat = next.next_candle("BTC-USD", Some(&first), None).unwrap().unwrap();
        assert_ne!(flat.id, first.id);
        assert_eq!(flat.started_at, datetime!(2024-01-01 10:01 UTC));
        for price in [flat.open, flat.high, flat.low, flat.close] {
            assert_eq!(price, Decimal::from(110));
        }
        assert_eq!(flat.base_token_volume, Decimal::ZERO);
        assert_eq!(flat.trades, 0);

        // The first trades of the period replace the flat prices.
        let traded = next
            .next_candle("BTC-USD", Some(&flat), Some(&trades_of(&[(130, 1)])))
            .unwrap()
            .unwrap();
        assert_eq!(traded.id, flat.id);
        assert_eq!(traded.open, Decimal::from(130));
        assert_eq!(traded.low, Decimal::from(130));
        assert_eq!(traded.trades, 1);
    }

    #[test]
    fn test_untraded_ticker_without_history_has_no_candle() {
        let minute = period(CandleResolution::OneMinute, datetime!(2024-01-01 10:00:05 UTC), 1);
        assert_eq!(minute.next_candle("ETH-USD", None, None).unwrap(), None);
    }

    #[test]
    fn test_block_before_open_candle_merges_into_it() {
        let minute = period(CandleResolution::OneMinute, datetime!(2024-01-01 10:01:05 UTC), 1);
        let open = minute
            .next_candle("BTC-USD", None, Some(&trades_of(&[(100, 1)])))
            .unwrap()
            .unwrap();
        let earlier = period(CandleResolution::OneMinute, datetime!(2024-01-01 10:00:59 UTC), 2);
        let merged = earlier
            .next_candle("BTC-USD", Some(&open), Some(&trades_of(&[(90, 1)])))
            .unwrap()
            .unwrap();
        assert_eq!(merged.id, open.id);
        assert_eq!(merged.trades, 2);
    }
}
