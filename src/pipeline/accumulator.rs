//! Candle accumulator: folds one market's trade stream into a slot → candle
//! map for a single timeframe. Liquidations contribute to the liquidation
//! totals only; everything else follows OHLCV + per-side flow semantics with
//! file order deciding ties inside a slot.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::codec::{price_ticks, quote_volume};
use crate::models::{Timeframe, Trade};
use crate::store::Candle;

pub struct CandleAccumulator {
    timeframe: Timeframe,
    buckets: BTreeMap<i64, Candle>,
    min_slot: Option<i64>,
    max_slot: Option<i64>,
}

impl CandleAccumulator {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            buckets: BTreeMap::new(),
            min_slot: None,
            max_slot: None,
        }
    }

    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    /// Fold one trade. Quote-volume overflow is the only error.
    pub fn push(&mut self, trade: &Trade) -> Result<()> {
        let slot = self.timeframe.slot(trade.ts);
        let vol = quote_volume(trade.price, trade.size)?;
        let candle = self.buckets.entry(slot).or_default();
        if trade.liquidation {
            candle.apply_liquidation(vol, trade.side);
        } else {
            candle.apply_trade(price_ticks(trade.price), vol, trade.side);
        }
        self.min_slot = Some(self.min_slot.map_or(slot, |m| m.min(slot)));
        self.max_slot = Some(self.max_slot.map_or(slot, |m| m.max(slot)));
        Ok(())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn min_slot(&self) -> Option<i64> {
        self.min_slot
    }

    pub fn max_slot(&self) -> Option<i64> {
        self.max_slot
    }

    pub fn get(&self, slot: i64) -> Option<&Candle> {
        self.buckets.get(&slot)
    }

    /// Dense candle sequence covering `[start_ts, end_ts)`; slots without a
    /// bucket come out as gap candles.
    pub fn dense_range(&self, start_ts: i64, end_ts: i64) -> impl Iterator<Item = Candle> + '_ {
        let tf_ms = self.timeframe.ms;
        (start_ts..end_ts)
            .step_by(tf_ms as usize)
            .map(move |slot| self.buckets.get(&slot).copied().unwrap_or_default())
    }

    /// Consume the accumulator, returning the bucket map.
    pub fn into_buckets(self) -> BTreeMap<i64, Candle> {
        self.buckets
    }
}
