//! On-disk candle storage: dense fixed-stride binaries plus companion
//! descriptors. One `<timeframe>.bin`/`.json` pair per market-timeframe under
//! `<outputRoot>/<COLLECTOR>/<EXCHANGE>/<symbol>/`.

pub mod binary;
pub mod companion;

pub use binary::{CandleBinReader, CandleBinWriter};
pub use companion::Companion;

use crate::models::Side;

/// Record stride of the dense binary.
pub const CANDLE_SIZE: usize = 56;

/// One aggregated slot. Prices are ticks of 1e-4, volumes quote micro-units
/// of 1e-6. A slot with all-zero OHLC is a gap (no trades folded in).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Candle {
    pub open: i32,
    pub high: i32,
    pub low: i32,
    pub close: i32,
    pub buy_vol: i64,
    pub sell_vol: i64,
    pub buy_count: u32,
    pub sell_count: u32,
    pub liq_buy: i64,
    pub liq_sell: i64,
}

impl Candle {
    /// Fold one non-liquidation trade into the slot. The first trade seeds
    /// open/high/low; later trades extend them and take over close.
    pub fn apply_trade(&mut self, price_ticks: i32, quote_vol: i64, side: Side) {
        if self.is_gap() {
            self.open = price_ticks;
            self.high = price_ticks;
            self.low = price_ticks;
        } else {
            self.high = self.high.max(price_ticks);
            self.low = self.low.min(price_ticks);
        }
        self.close = price_ticks;
        match side {
            Side::Buy => {
                self.buy_vol += quote_vol;
                self.buy_count += 1;
            }
            Side::Sell => {
                self.sell_vol += quote_vol;
                self.sell_count += 1;
            }
        }
    }

    /// Fold one liquidation trade: volume only, OHLC untouched.
    pub fn apply_liquidation(&mut self, quote_vol: i64, side: Side) {
        match side {
            Side::Buy => self.liq_buy += quote_vol,
            Side::Sell => self.liq_sell += quote_vol,
        }
    }

    /// True when no trade ever contributed OHLC.
    pub fn is_gap(&self) -> bool {
        self.open == 0 && self.high == 0 && self.low == 0 && self.close == 0
    }

    pub fn to_bytes(&self) -> [u8; CANDLE_SIZE] {
        let mut buf = [0u8; CANDLE_SIZE];
        buf[0..4].copy_from_slice(&self.open.to_le_bytes());
        buf[4..8].copy_from_slice(&self.high.to_le_bytes());
        buf[8..12].copy_from_slice(&self.low.to_le_bytes());
        buf[12..16].copy_from_slice(&self.close.to_le_bytes());
        buf[16..24].copy_from_slice(&self.buy_vol.to_le_bytes());
        buf[24..32].copy_from_slice(&self.sell_vol.to_le_bytes());
        buf[32..36].copy_from_slice(&self.buy_count.to_le_bytes());
        buf[36..40].copy_from_slice(&self.sell_count.to_le_bytes());
        buf[40..48].copy_from_slice(&self.liq_buy.to_le_bytes());
        buf[48..56].copy_from_slice(&self.liq_sell.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; CANDLE_SIZE]) -> Self {
        let i32_at = |o: usize| i32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let i64_at = |o: usize| i64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        Self {
            open: i32_at(0),
            high: i32_at(4),
            low: i32_at(8),
            close: i32_at(12),
            buy_vol: i64_at(16),
            sell_vol: i64_at(24),
            buy_count: u32_at(32),
            sell_count: u32_at(36),
            liq_buy: i64_at(40),
            liq_sell: i64_at(48),
        }
    }
}
