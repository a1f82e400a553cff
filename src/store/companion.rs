//! Companion descriptor: the sidecar JSON that gives a dense candle binary
//! its meaning (extent, stride, scales). Written atomically next to the
//! `.bin`; older writers used `segmentStartTs`/`segmentEndTs`, accepted here
//! as aliases.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{MarketKey, Timeframe};
use crate::store::CANDLE_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Companion {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
    pub timeframe_ms: i64,
    #[serde(alias = "segmentStartTs")]
    pub start_ts: i64,
    #[serde(alias = "segmentEndTs")]
    pub end_ts: i64,
    pub price_scale: f64,
    pub volume_scale: f64,
    pub records: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_input_start_ts: Option<i64>,
}

impl Companion {
    pub fn new(market: &MarketKey, tf: &Timeframe, start_ts: i64, end_ts: i64) -> Self {
        Self {
            exchange: market.exchange.clone(),
            symbol: market.symbol.clone(),
            timeframe: tf.label.clone(),
            timeframe_ms: tf.ms,
            start_ts,
            end_ts,
            price_scale: crate::codec::PRICE_SCALE,
            volume_scale: crate::codec::VOLUME_SCALE,
            records: (end_ts - start_ts) / tf.ms,
            last_input_start_ts: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("read companion {}", path.display()))?;
        let companion: Companion = serde_json::from_slice(&data)
            .with_context(|| format!("parse companion {}", path.display()))?;
        ensure!(
            companion.timeframe_ms > 0,
            "companion {} has non-positive timeframeMs",
            path.display()
        );
        ensure!(
            (companion.end_ts - companion.start_ts) % companion.timeframe_ms == 0,
            "companion {} extent is not a multiple of timeframeMs",
            path.display()
        );
        Ok(companion)
    }

    /// Write pretty JSON via a temp path and atomic rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .with_context(|| format!("write companion {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename companion into {}", path.display()))?;
        Ok(())
    }

    /// Expected byte length of the sibling binary.
    pub fn expected_bin_len(&self) -> u64 {
        self.records as u64 * CANDLE_SIZE as u64
    }

    /// Index of the slot containing `start_ms`, clamped to the valid range.
    pub fn anchor_index(&self, start_ms: i64) -> i64 {
        let idx = (start_ms - self.start_ts).div_euclid(self.timeframe_ms);
        idx.clamp(0, (self.records - 1).max(0))
    }
}

/// Directory holding every binary/companion pair for one market.
pub fn market_dir(output_root: &Path, market: &MarketKey) -> PathBuf {
    output_root
        .join(&market.collector)
        .join(&market.exchange)
        .join(&market.symbol)
}

pub fn bin_path(output_root: &Path, market: &MarketKey, tf: &Timeframe) -> PathBuf {
    market_dir(output_root, market).join(format!("{}.bin", tf.label))
}

pub fn companion_path(output_root: &Path, market: &MarketKey, tf: &Timeframe) -> PathBuf {
    market_dir(output_root, market).join(format!("{}.json", tf.label))
}

/// Enumerate the companions present for a market, finest stride first.
pub fn list_companions(output_root: &Path, market: &MarketKey) -> Result<Vec<(Timeframe, Companion)>> {
    let dir = market_dir(output_root, market);
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("read dir {}", dir.display())),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(tf) = Timeframe::parse(stem) else {
            continue;
        };
        let companion = Companion::load(&path)?;
        out.push((tf, companion));
    }
    out.sort_by_key(|(tf, _)| tf.ms);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Companion {
        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        let tf = Timeframe::parse("1m").unwrap();
        Companion::new(&market, &tf, 1_704_067_200_000, 1_704_067_380_000)
    }

    #[test]
    fn test_records_derived_from_extent() {
        let c = sample();
        assert_eq!(c.records, 3);
        assert_eq!(c.expected_bin_len(), 3 * 56);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1m.json");
        let c = sample();
        c.save(&path).unwrap();
        assert_eq!(Companion::load(&path).unwrap(), c);
        // temp file is gone after rename
        assert!(!dir.path().join("1m.json.tmp").exists());
    }

    #[test]
    fn test_legacy_segment_keys() {
        let raw = r#"{
            "exchange": "BINANCE",
            "symbol": "BTCUSDT",
            "timeframe": "1m",
            "timeframeMs": 60000,
            "segmentStartTs": 1704067200000,
            "segmentEndTs": 1704067260000,
            "priceScale": 10000.0,
            "volumeScale": 1000000.0,
            "records": 1
        }"#;
        let c: Companion = serde_json::from_str(raw).unwrap();
        assert_eq!(c.start_ts, 1_704_067_200_000);
        assert_eq!(c.end_ts, 1_704_067_260_000);
    }

    #[test]
    fn test_anchor_index_clamps() {
        let c = sample();
        assert_eq!(c.anchor_index(1_704_067_200_000), 0);
        assert_eq!(c.anchor_index(1_704_067_260_500), 1);
        assert_eq!(c.anchor_index(0), 0);
        assert_eq!(c.anchor_index(i64::MAX / 2), 2);
    }

    #[test]
    fn test_list_companions_sorted_by_stride() {
        let dir = tempfile::tempdir().unwrap();
        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        for label in ["5m", "1m", "1h"] {
            let tf = Timeframe::parse(label).unwrap();
            let c = Companion::new(&market, &tf, 0, tf.ms * 2);
            std::fs::create_dir_all(market_dir(dir.path(), &market)).unwrap();
            c.save(&companion_path(dir.path(), &market, &tf)).unwrap();
        }
        let found = list_companions(dir.path(), &market).unwrap();
        let labels: Vec<_> = found.iter().map(|(tf, _)| tf.label.as_str()).collect();
        assert_eq!(labels, ["1m", "5m", "1h"]);
    }

    #[test]
    fn test_missing_market_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let market = MarketKey::new("RAM", "NOPE", "X");
        assert!(list_companions(dir.path(), &market).unwrap().is_empty());
    }
}
