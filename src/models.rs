use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Wire encoding used by the archive: `0` = buy, `1` = sell.
    pub fn bit(&self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }

    pub fn from_bit(bit: u8) -> Side {
        if bit == 0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }
}

/// Identity of one market inside the archive.
///
/// Collector and exchange are case-folded to upper; the symbol keeps whatever
/// normalisation the indexer applied (exchange-specific).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketKey {
    pub collector: String,
    pub exchange: String,
    pub symbol: String,
}

impl MarketKey {
    pub fn new(collector: &str, exchange: &str, symbol: &str) -> Self {
        Self {
            collector: collector.to_uppercase(),
            exchange: exchange.to_uppercase(),
            symbol: symbol.to_string(),
        }
    }
}

impl std::fmt::Display for MarketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.collector, self.exchange, self.symbol)
    }
}

/// One trade as stored in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Milliseconds since epoch.
    pub ts: i64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub liquidation: bool,
}

impl Trade {
    pub fn key(&self) -> TradeKey {
        TradeKey {
            ts: self.ts,
            price_bits: self.price.to_bits(),
            size_bits: self.size.to_bits(),
            side: self.side,
        }
    }
}

/// A trade recovered from an upstream venue, with the original text fields
/// preserved so write-back keeps the venue's formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTrade {
    pub ts: i64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub liquidation: bool,
    pub price_text: String,
    pub size_text: String,
}

impl RecoveredTrade {
    pub fn new(ts: i64, price: f64, size: f64, side: Side) -> Self {
        Self {
            ts,
            price,
            size,
            side,
            liquidation: false,
            price_text: format!("{price}"),
            size_text: format!("{size}"),
        }
    }

    pub fn with_text(ts: i64, side: Side, price_text: &str, size_text: &str) -> Result<Self> {
        let price: f64 = price_text.parse()?;
        let size: f64 = size_text.parse()?;
        Ok(Self {
            ts,
            price,
            size,
            side,
            liquidation: false,
            price_text: price_text.to_string(),
            size_text: size_text.to_string(),
        })
    }

    /// Canonical archive line for this trade.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.ts,
            self.price_text,
            self.size_text,
            self.side.bit(),
            u8::from(self.liquidation)
        )
    }

    pub fn key(&self) -> TradeKey {
        TradeKey {
            ts: self.ts,
            price_bits: self.price.to_bits(),
            size_bits: self.size.to_bits(),
            side: self.side,
        }
    }
}

/// Exact-match dedup key for trades. Prices and sizes compare by bit pattern
/// so the same decimal text always collides while distinct floats never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TradeKey {
    pub ts: i64,
    pub price_bits: u64,
    pub size_bits: u64,
    pub side: Side,
}

/// Anomaly kinds recorded against source files while processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PartsShort,
    NonFinite,
    InvalidTsRange,
    NotionalTooLarge,
    Gap,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PartsShort => "parts_short",
            EventKind::NonFinite => "non_finite",
            EventKind::InvalidTsRange => "invalid_ts_range",
            EventKind::NotionalTooLarge => "notional_too_large",
            EventKind::Gap => "gap",
        }
    }

    pub fn from_str(s: &str) -> Option<EventKind> {
        match s {
            "parts_short" => Some(EventKind::PartsShort),
            "non_finite" => Some(EventKind::NonFinite),
            "invalid_ts_range" => Some(EventKind::InvalidTsRange),
            "notional_too_large" => Some(EventKind::NotionalTooLarge),
            "gap" => Some(EventKind::Gap),
            _ => None,
        }
    }
}

/// Lifecycle status of a gap event in the fix pipeline. `None` in the catalog
/// means the event has not been visited yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapFixStatus {
    MissingAdapter,
    AdapterError,
    Fixed,
}

impl GapFixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapFixStatus::MissingAdapter => "missing_adapter",
            GapFixStatus::AdapterError => "adapter_error",
            GapFixStatus::Fixed => "fixed",
        }
    }

    pub fn from_str(s: &str) -> Option<GapFixStatus> {
        match s {
            "missing_adapter" => Some(GapFixStatus::MissingAdapter),
            "adapter_error" => Some(GapFixStatus::AdapterError),
            "fixed" => Some(GapFixStatus::Fixed),
            _ => None,
        }
    }
}

/// A candle timeframe: label (`1m`, `15m`, `4h`, ...) plus its width in ms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    pub label: String,
    pub ms: i64,
}

impl Timeframe {
    pub fn parse(label: &str) -> Result<Self> {
        let label = label.trim();
        if label.len() < 2 || !label.is_ascii() {
            bail!("bad timeframe '{label}'");
        }
        let (num, unit) = label.split_at(label.len() - 1);
        let n: i64 = num
            .parse()
            .map_err(|_| anyhow::anyhow!("bad timeframe '{label}'"))?;
        if n <= 0 {
            bail!("bad timeframe '{label}'");
        }
        let unit_ms = match unit {
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => bail!("bad timeframe unit '{label}'"),
        };
        Ok(Self {
            label: label.to_string(),
            ms: n * unit_ms,
        })
    }

    pub fn from_ms(ms: i64) -> Result<Self> {
        if ms <= 0 {
            bail!("bad timeframe width {ms}");
        }
        let label = if ms % 86_400_000 == 0 {
            format!("{}d", ms / 86_400_000)
        } else if ms % 3_600_000 == 0 {
            format!("{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 {
            format!("{}m", ms / 60_000)
        } else if ms % 1_000 == 0 {
            format!("{}s", ms / 1_000)
        } else {
            bail!("timeframe width {ms} is not a whole second");
        };
        Ok(Self { label, ms })
    }

    /// Slot start containing `ts`.
    pub fn slot(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.ms)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label)
    }
}

/// Verbose-logging switches, read once from the environment and passed by
/// value instead of consulted globally.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFlags {
    pub fixgaps: bool,
    pub http: bool,
    pub adapters: bool,
    pub progress: bool,
}

impl DebugFlags {
    pub fn from_env() -> Self {
        let on = |k: &str| {
            std::env::var(k)
                .map(|v| v != "0" && !v.is_empty())
                .unwrap_or(false)
        };
        Self {
            fixgaps: on("AGGR_FIXGAPS_DEBUG"),
            http: on("AGGR_FIXGAPS_DEBUG_HTTP"),
            adapters: on("AGGR_FIXGAPS_DEBUG_ADAPTERS"),
            progress: std::env::var("AGGR_FIXGAPS_PROGRESS")
                .map(|v| v != "0")
                .unwrap_or(true),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for candle binaries and companions.
    pub output_root: std::path::PathBuf,
    /// Catalog database path.
    pub db_path: std::path::PathBuf,
    /// Scratch directory for adapter caches.
    pub work_dir: std::path::PathBuf,
    pub debug: DebugFlags,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let output_root = std::env::var("OUTPUT_ROOT").unwrap_or_else(|_| "./candles".to_string());
        let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "./catalog.db".to_string());
        let work_dir = std::env::var("WORK_DIR").unwrap_or_else(|_| ".".to_string());

        Self {
            output_root: output_root.into(),
            db_path: db_path.into(),
            work_dir: work_dir.into(),
            debug: DebugFlags::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parse() {
        assert_eq!(Timeframe::parse("1m").unwrap().ms, 60_000);
        assert_eq!(Timeframe::parse("15m").unwrap().ms, 900_000);
        assert_eq!(Timeframe::parse("4h").unwrap().ms, 14_400_000);
        assert_eq!(Timeframe::parse("1d").unwrap().ms, 86_400_000);
        assert!(Timeframe::parse("0m").is_err());
        assert!(Timeframe::parse("abc").is_err());
    }

    #[test]
    fn test_timeframe_roundtrip() {
        for label in ["30s", "1m", "5m", "1h", "1d"] {
            let tf = Timeframe::parse(label).unwrap();
            assert_eq!(Timeframe::from_ms(tf.ms).unwrap().label, label);
        }
    }

    #[test]
    fn test_slot_alignment() {
        let tf = Timeframe::parse("1m").unwrap();
        assert_eq!(tf.slot(1_704_067_230_000), 1_704_067_200_000);
        assert_eq!(tf.slot(1_704_067_200_000), 1_704_067_200_000);
    }

    #[test]
    fn test_market_key_case_folds() {
        let key = MarketKey::new("ram", "binance", "BTCUSDT");
        assert_eq!(key.collector, "RAM");
        assert_eq!(key.exchange, "BINANCE");
        assert_eq!(key.symbol, "BTCUSDT");
    }

    #[test]
    fn test_recovered_trade_line() {
        let t = RecoveredTrade::with_text(1_704_067_200_000, Side::Sell, "50000.5", "0.25").unwrap();
        assert_eq!(t.to_line(), "1704067200000 50000.5 0.25 1 0");
        assert_eq!(Side::from_bit(Side::Buy.bit()), Side::Buy);
    }

    #[test]
    fn test_trade_key_collides_on_equal_values() {
        let a = RecoveredTrade::with_text(1, Side::Buy, "0.1", "2").unwrap();
        let b = Trade {
            ts: 1,
            price: 0.1,
            size: 2.0,
            side: Side::Buy,
            liquidation: false,
        };
        assert_eq!(a.key(), b.key());
    }
}
