//! Recovery adapters: per-exchange strategies for refetching trades that
//! fall inside gap windows, either from live APIs or from bulk ZIP/CSV
//! stores. Adapters receive merged ascending windows and must return trades
//! strictly inside one of them, sorted; everything network-shaped goes
//! through the rate-limited fetcher.

pub mod binance;
pub mod bitfinex;
pub mod bitmex;
pub mod coinbase;
pub mod huobi;
pub mod kucoin;
pub mod kraken;
pub mod okx;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::fixgaps::fetch::Fetcher;
use crate::fixgaps::{FixError, GapWindow};
use crate::models::RecoveredTrade;

/// What an adapter is asked to recover.
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub exchange: String,
    pub symbol: String,
    /// Merged, non-overlapping, ascending windows.
    pub windows: Vec<GapWindow>,
}

#[async_trait]
pub trait TradeRecoveryAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch trades strictly inside the request's windows, sorted by
    /// `(ts, price, size, side)`.
    async fn recover(
        &self,
        req: &RecoveryRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecoveredTrade>, FixError>;
}

/// Exchange → adapter lookup.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn TradeRecoveryAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// The full venue catalogue.
    pub fn standard(fetcher: Arc<Fetcher>, work_dir: &Path) -> Self {
        let mut reg = Self::empty();
        reg.insert("BINANCE", Arc::new(binance::BinanceAdapter::spot(fetcher.clone())));
        reg.insert(
            "BINANCE_FUTURES",
            Arc::new(binance::BinanceAdapter::usdt_futures(fetcher.clone())),
        );
        reg.insert("COINBASE", Arc::new(coinbase::CoinbaseAdapter::new(fetcher.clone())));
        reg.insert(
            "KRAKEN",
            Arc::new(kraken::KrakenAdapter::new(fetcher.clone(), work_dir)),
        );
        reg.insert("BITFINEX", Arc::new(bitfinex::BitfinexAdapter::new(fetcher.clone())));
        reg.insert("OKEX", Arc::new(okx::OkxAdapter::new(fetcher.clone())));
        reg.insert("BITMEX", Arc::new(bitmex::BitmexAdapter::new(fetcher.clone())));
        reg.insert("HUOBI", Arc::new(huobi::HuobiAdapter::spot(fetcher.clone())));
        reg.insert(
            "HUOBI_FUTURES",
            Arc::new(huobi::HuobiAdapter::linear_swap(fetcher.clone())),
        );
        reg.insert("KUCOIN", Arc::new(kucoin::KucoinAdapter::new(fetcher)));
        reg
    }

    pub fn insert(&mut self, exchange: &str, adapter: Arc<dyn TradeRecoveryAdapter>) {
        self.adapters.insert(exchange.to_uppercase(), adapter);
    }

    pub fn get(&self, exchange: &str) -> Option<Arc<dyn TradeRecoveryAdapter>> {
        self.adapters.get(&exchange.to_uppercase()).cloned()
    }
}

// ---------------------------------------------------------------------------
// window helpers
// ---------------------------------------------------------------------------

/// Merge windows into non-overlapping ascending `(from, to)` spans.
pub fn merged_spans(windows: &[GapWindow]) -> Vec<(i64, i64)> {
    let mut spans: Vec<(i64, i64)> = windows
        .iter()
        .filter(|w| w.to_ts > w.from_ts)
        .map(|w| (w.from_ts, w.to_ts))
        .collect();
    spans.sort_unstable();
    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(spans.len());
    for (from, to) in spans {
        match merged.last_mut() {
            Some((_, last_to)) if from <= *last_to => *last_to = (*last_to).max(to),
            _ => merged.push((from, to)),
        }
    }
    merged
}

/// Overall `(min_from, max_to)` of the spans.
pub fn span_bounds(spans: &[(i64, i64)]) -> Option<(i64, i64)> {
    Some((spans.first()?.0, spans.last()?.1))
}

/// Strictly-inside test (windows are open intervals).
pub fn in_spans(ts: i64, spans: &[(i64, i64)]) -> bool {
    spans
        .binary_search_by(|&(from, to)| {
            if ts <= from {
                std::cmp::Ordering::Greater
            } else if ts >= to {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .is_ok()
}

/// UTC days covering `[from_ts, to_ts]`, optionally shifted by
/// `offset_hours` for venues whose daily dumps roll over on local time.
pub fn utc_days(from_ts: i64, to_ts: i64, offset_hours: i64) -> Vec<NaiveDate> {
    let shift = ChronoDuration::hours(offset_hours);
    let first = (Utc.timestamp_millis_opt(from_ts).unwrap() + shift).date_naive();
    let last = (Utc.timestamp_millis_opt(to_ts).unwrap() + shift).date_naive();
    let mut days = Vec::new();
    let mut day = first;
    while day <= last {
        days.push(day);
        day = day.succ_opt().expect("date overflow");
    }
    days
}

/// Keep trades strictly inside the spans and sort them the way the merger
/// expects.
pub fn finalize(mut trades: Vec<RecoveredTrade>, spans: &[(i64, i64)]) -> Vec<RecoveredTrade> {
    trades.retain(|t| in_spans(t.ts, spans));
    trades.sort_by(|a, b| {
        (a.ts, a.price, a.size, a.side)
            .partial_cmp(&(b.ts, b.price, b.size, b.side))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    trades
}

// ---------------------------------------------------------------------------
// archive helpers
// ---------------------------------------------------------------------------

/// Extract the first entry of a ZIP archive held in memory.
pub fn zip_first_entry(bytes: &[u8]) -> Result<Vec<u8>, FixError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| FixError::BadPayload(format!("zip open: {e}")))?;
    if archive.len() == 0 {
        return Err(FixError::BadPayload("zip has no entries".into()));
    }
    let mut entry = archive
        .by_index(0)
        .map_err(|e| FixError::BadPayload(format!("zip entry: {e}")))?;
    let mut out = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut out)
        .map_err(|e| FixError::BadPayload(format!("zip inflate: {e}")))?;
    Ok(out)
}

/// Extract a named entry of a ZIP archive held in memory.
pub fn zip_entry_named(bytes: &[u8], name: &str) -> Result<Vec<u8>, FixError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| FixError::BadPayload(format!("zip open: {e}")))?;
    let mut entry = archive
        .by_name(name)
        .map_err(|_| FixError::BadPayload(format!("zip entry {name} missing")))?;
    let mut out = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut out)
        .map_err(|e| FixError::BadPayload(format!("zip inflate: {e}")))?;
    Ok(out)
}

/// Inflate a gzip body.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, FixError> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| FixError::BadPayload(format!("gunzip: {e}")))?;
    Ok(out)
}

/// CSV reader over raw bytes, no headers assumed.
pub fn csv_rows(bytes: Vec<u8>) -> csv::Reader<Cursor<Vec<u8>>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(bytes))
}

/// Parse a CSV field that should be a float, tolerating blanks.
pub fn csv_f64(record: &csv::StringRecord, idx: usize) -> Option<f64> {
    record.get(idx)?.trim().parse().ok()
}

pub fn csv_i64(record: &csv::StringRecord, idx: usize) -> Option<i64> {
    record.get(idx)?.trim().parse().ok()
}
