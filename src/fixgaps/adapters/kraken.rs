//! Kraken recovery: union of two sources.
//!
//! The direct source is Kraken's public trading-history archive on Google
//! Drive (quarterly ZIPs plus a full-history ZIP). A manifest of file ids is
//! cached under the work dir; when the Drive folder cannot be scraped the
//! adapter falls back to the last known hard-coded ids. Archive CSVs carry
//! no side, so it is inferred tick by tick (price up = buy, down = sell,
//! unchanged keeps the previous side).
//!
//! The API source pages `/0/public/Trades` forward by the venue's
//! nanosecond cursor and covers the recent range the archives have not
//! reached. The two coverages are stitched with a 24 h overlap so nothing
//! is lost around the archive's cut-off.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    csv_rows, finalize, merged_spans, zip_entry_named, RecoveryRequest, TradeRecoveryAdapter,
};
use crate::fixgaps::fetch::Fetcher;
use crate::fixgaps::FixError;
use crate::models::{RecoveredTrade, Side};

const API_URL: &str = "https://api.kraken.com";
const DRIVE_FOLDER_URL: &str =
    "https://drive.google.com/drive/folders/1aoA6SKgPbS_p3pYStXUXFvmjqShJ2jv9";
const DRIVE_DOWNLOAD_URL: &str = "https://drive.google.com/uc?export=download&id=";

/// Last known archive ids, used when the Drive folder markup changes.
const FALLBACK_ARCHIVES: &[(&str, &str)] = &[
    ("1xmQ9ZJmoGDJrgzy0LWrA6C2fW9cMgWua", "Kraken_Full_History.zip"),
    ("1Sw0kAdMKPlRKF1yN2Y3kqDo4cTTD0UXJ", "Kraken_Trading_History_Q1_2024.zip"),
    ("1r4cYgSvQxkUh3eZ0hX9uBkL5n8eBqW2d", "Kraken_Trading_History_Q2_2024.zip"),
];

/// Conservative end of archive coverage when quarterly names say nothing.
const FULL_HISTORY_END_MS: i64 = 1_704_067_200_000; // 2024-01-01
/// Overlap between archive coverage end and API start.
const TAIL_OVERLAP_MS: i64 = 86_400_000;
/// EAPI:Rate limit retries.
const API_RATE_LIMIT_RETRIES: u32 = 6;
/// Idle ZIP cursors close after this.
const CURSOR_IDLE: Duration = Duration::from_secs(2);
/// API pagination safety cap.
const MAX_API_PAGES: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub fetched_at: i64,
    pub archives: Vec<ArchiveEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub file_id: String,
    pub name: String,
    /// Coverage in ms, end exclusive.
    pub from_ts: i64,
    pub to_ts: i64,
}

/// Restartable monotonic scan over one symbol's CSV inside one archive.
struct ZipCursor {
    file_id: String,
    symbol: String,
    rows: Vec<(i64, String, String)>,
    pos: usize,
    last_price: Option<f64>,
    last_side: Side,
    last_used: tokio::time::Instant,
}

impl ZipCursor {
    fn new(file_id: &str, symbol: &str, rows: Vec<(i64, String, String)>) -> Self {
        Self {
            file_id: file_id.to_string(),
            symbol: symbol.to_string(),
            rows,
            pos: 0,
            last_price: None,
            last_side: Side::Buy,
            last_used: tokio::time::Instant::now(),
        }
    }

    fn restart(&mut self) {
        self.pos = 0;
        self.last_price = None;
        self.last_side = Side::Buy;
    }

    /// Emit trades strictly inside `(from, to)`, advancing monotonically;
    /// a target behind the cursor restarts the scan.
    fn collect(&mut self, from: i64, to: i64) -> Result<Vec<RecoveredTrade>, FixError> {
        self.last_used = tokio::time::Instant::now();
        if let Some((ts, _, _)) = self.rows.get(self.pos) {
            if from < *ts {
                self.restart();
            }
        } else if self.pos > 0 {
            self.restart();
        }

        let mut out = Vec::new();
        while let Some((ts, price_text, size_text)) = self.rows.get(self.pos) {
            if *ts >= to {
                break;
            }
            let price: f64 = price_text
                .parse()
                .map_err(|_| FixError::BadPayload(format!("kraken price '{price_text}'")))?;
            let side = tick_rule(self.last_price, price, self.last_side);
            self.last_price = Some(price);
            self.last_side = side;
            if *ts > from {
                out.push(
                    RecoveredTrade::with_text(*ts, side, price_text, size_text)
                        .map_err(|e| FixError::BadPayload(format!("kraken row: {e}")))?,
                );
            }
            self.pos += 1;
        }
        Ok(out)
    }
}

/// Tick-rule side inference.
pub fn tick_rule(prev_price: Option<f64>, price: f64, last_side: Side) -> Side {
    match prev_price {
        Some(prev) if price > prev => Side::Buy,
        Some(prev) if price < prev => Side::Sell,
        _ => last_side,
    }
}

pub struct KrakenAdapter {
    fetcher: Arc<Fetcher>,
    cache_dir: PathBuf,
    cursor: Mutex<Option<ZipCursor>>,
}

impl KrakenAdapter {
    pub fn new(fetcher: Arc<Fetcher>, work_dir: &Path) -> Self {
        Self {
            fetcher,
            cache_dir: work_dir.join(".cache").join("fixgaps").join("kraken"),
            cursor: Mutex::new(None),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.cache_dir.join("manifest.json")
    }

    fn download_path(&self, file_id: &str) -> PathBuf {
        self.cache_dir.join("downloads").join(format!("{file_id}.zip"))
    }

    /// Cached manifest, else scrape the Drive folder, else hard-coded ids.
    async fn manifest(&self, cancel: &CancellationToken) -> Result<ArchiveManifest, FixError> {
        if let Ok(raw) = std::fs::read(self.manifest_path()) {
            if let Ok(manifest) = serde_json::from_slice::<ArchiveManifest>(&raw) {
                return Ok(manifest);
            }
            warn!("kraken manifest cache unreadable, refetching");
        }

        let archives = match self.fetcher.get(DRIVE_FOLDER_URL, cancel).await {
            Ok(resp) => {
                let scraped = parse_drive_folder_html(&resp.text());
                if scraped.is_empty() {
                    warn!("kraken drive folder yielded no archives, using fallback ids");
                    fallback_archives()
                } else {
                    scraped
                }
            }
            Err(FixError::Cancelled) => return Err(FixError::Cancelled),
            Err(e) => {
                warn!(error = %e, "kraken drive folder fetch failed, using fallback ids");
                fallback_archives()
            }
        };

        let manifest = ArchiveManifest {
            fetched_at: chrono::Utc::now().timestamp_millis(),
            archives,
        };
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| FixError::BadPayload(format!("kraken cache dir: {e}")))?;
        std::fs::write(
            self.manifest_path(),
            serde_json::to_vec_pretty(&manifest)
                .map_err(|e| FixError::BadPayload(format!("kraken manifest: {e}")))?,
        )
        .map_err(|e| FixError::BadPayload(format!("kraken manifest write: {e}")))?;
        info!(archives = manifest.archives.len(), "kraken manifest cached");
        Ok(manifest)
    }

    async fn archive_bytes(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FixError> {
        let path = self.download_path(file_id);
        if let Ok(bytes) = std::fs::read(&path) {
            return Ok(bytes);
        }
        let url = format!("{DRIVE_DOWNLOAD_URL}{file_id}");
        let resp = self.fetcher.get(&url, cancel).await?;
        std::fs::create_dir_all(path.parent().unwrap())
            .map_err(|e| FixError::BadPayload(format!("kraken downloads dir: {e}")))?;
        std::fs::write(&path, &resp.body)
            .map_err(|e| FixError::BadPayload(format!("kraken download cache: {e}")))?;
        Ok(resp.body)
    }

    /// Collect from the archive source for one span.
    async fn collect_direct(
        &self,
        symbol: &str,
        entry: &ArchiveEntry,
        from: i64,
        to: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecoveredTrade>, FixError> {
        let mut guard = self.cursor.lock().await;
        // one active cursor; idle or mismatched cursors are dropped
        let reusable = guard.as_ref().map_or(false, |c| {
            c.file_id == entry.file_id
                && c.symbol == symbol
                && c.last_used.elapsed() < CURSOR_IDLE
        });
        if !reusable {
            let bytes = self.archive_bytes(&entry.file_id, cancel).await?;
            let csv = zip_entry_named(&bytes, &format!("{symbol}.csv"))?;
            let rows = parse_archive_csv(&csv)?;
            *guard = Some(ZipCursor::new(&entry.file_id, symbol, rows));
        }
        guard.as_mut().unwrap().collect(from, to)
    }

    /// Collect from the paginated public API for one span.
    async fn collect_api(
        &self,
        pair: &str,
        from: i64,
        to: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecoveredTrade>, FixError> {
        let mut out = Vec::new();
        let mut since_ns = (from as i128 * 1_000_000) as i64;
        let mut rate_limited = 0u32;

        for _ in 0..MAX_API_PAGES {
            let url =
                format!("{API_URL}/0/public/Trades?pair={pair}&since={since_ns}");
            let resp = self.fetcher.get(&url, cancel).await?;
            let payload: serde_json::Value = resp.json()?;

            let errors = payload["error"].as_array().cloned().unwrap_or_default();
            if let Some(err) = errors.first().and_then(|e| e.as_str()) {
                if err.contains("Rate limit") && rate_limited < API_RATE_LIMIT_RETRIES {
                    rate_limited += 1;
                    let wait = Duration::from_secs(2u64.pow(rate_limited.min(5)));
                    warn!(pair, attempt = rate_limited, "kraken api rate limited");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => continue,
                        _ = cancel.cancelled() => return Err(FixError::Cancelled),
                    }
                }
                return Err(FixError::BadPayload(format!("kraken api: {err}")));
            }
            rate_limited = 0;

            let result = payload["result"]
                .as_object()
                .ok_or_else(|| FixError::BadPayload("kraken api: no result".into()))?;
            let last: i64 = result
                .get("last")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| FixError::BadPayload("kraken api: no cursor".into()))?;
            let rows = result
                .iter()
                .find(|(k, _)| *k != "last")
                .and_then(|(_, v)| v.as_array())
                .cloned()
                .unwrap_or_default();

            let mut max_ts = from;
            for row in &rows {
                let (ts, price_text, size_text, side) = parse_api_row(row)?;
                max_ts = max_ts.max(ts);
                if ts > from && ts < to {
                    out.push(
                        RecoveredTrade::with_text(ts, side, &price_text, &size_text)
                            .map_err(|e| FixError::BadPayload(format!("kraken api: {e}")))?,
                    );
                }
            }
            debug!(pair, rows = rows.len(), max_ts, "kraken api page");
            if rows.is_empty() || max_ts >= to || last <= since_ns {
                break;
            }
            since_ns = last;
        }
        Ok(out)
    }
}

#[async_trait]
impl TradeRecoveryAdapter for KrakenAdapter {
    fn name(&self) -> &'static str {
        "kraken"
    }

    async fn recover(
        &self,
        req: &RecoveryRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecoveredTrade>, FixError> {
        let spans = merged_spans(&req.windows);
        if spans.is_empty() {
            return Ok(Vec::new());
        }
        let symbol = req.symbol.to_uppercase();
        let manifest = self.manifest(cancel).await?;
        let direct_end = manifest
            .archives
            .iter()
            .map(|a| a.to_ts)
            .max()
            .unwrap_or(FULL_HISTORY_END_MS);
        let api_start = direct_end - TAIL_OVERLAP_MS;

        let mut trades = Vec::new();
        for &(from, to) in &spans {
            if from < direct_end {
                let direct_to = to.min(direct_end);
                for entry in &manifest.archives {
                    if entry.from_ts < direct_to && entry.to_ts > from {
                        trades.extend(
                            self.collect_direct(&symbol, entry, from, direct_to, cancel)
                                .await?,
                        );
                    }
                }
            }
            if to > api_start {
                trades.extend(
                    self.collect_api(&symbol, from.max(api_start), to, cancel)
                        .await?,
                );
            }
        }

        // the overlap region may be present in both sources
        let mut trades = finalize(trades, &spans);
        trades.dedup_by_key(|t| t.key());
        Ok(trades)
    }
}

/// Archive rows are `unix_seconds,price,volume`.
fn parse_archive_csv(bytes: &[u8]) -> Result<Vec<(i64, String, String)>, FixError> {
    let mut rows = Vec::new();
    for record in csv_rows(bytes.to_vec()).records() {
        let record = record.map_err(|e| FixError::BadPayload(format!("kraken csv: {e}")))?;
        let Some(secs) = record.get(0).and_then(|v| v.trim().parse::<i64>().ok()) else {
            continue;
        };
        let price = record
            .get(1)
            .map(str::trim)
            .ok_or_else(|| FixError::BadPayload("kraken csv: missing price".into()))?;
        let volume = record
            .get(2)
            .map(str::trim)
            .ok_or_else(|| FixError::BadPayload("kraken csv: missing volume".into()))?;
        rows.push((secs * 1_000, price.to_string(), volume.to_string()));
    }
    Ok(rows)
}

/// API rows are `[price, volume, time_sec_float, side(b/s), ord, misc]`.
fn parse_api_row(row: &serde_json::Value) -> Result<(i64, String, String, Side), FixError> {
    let arr = row
        .as_array()
        .filter(|a| a.len() >= 4)
        .ok_or_else(|| FixError::BadPayload("kraken api: short row".into()))?;
    let price = arr[0]
        .as_str()
        .ok_or_else(|| FixError::BadPayload("kraken api: bad price".into()))?;
    let volume = arr[1]
        .as_str()
        .ok_or_else(|| FixError::BadPayload("kraken api: bad volume".into()))?;
    let time = arr[2]
        .as_f64()
        .ok_or_else(|| FixError::BadPayload("kraken api: bad time".into()))?;
    let side = match arr[3].as_str() {
        Some("b") => Side::Buy,
        Some("s") => Side::Sell,
        other => return Err(FixError::BadPayload(format!("kraken api side {other:?}"))),
    };
    Ok((
        (time * 1_000.0).round() as i64,
        price.to_string(),
        volume.to_string(),
        side,
    ))
}

fn fallback_archives() -> Vec<ArchiveEntry> {
    FALLBACK_ARCHIVES
        .iter()
        .map(|(id, name)| archive_entry(id, name))
        .collect()
}

fn archive_entry(file_id: &str, name: &str) -> ArchiveEntry {
    let (from_ts, to_ts) = coverage_from_name(name);
    ArchiveEntry {
        file_id: file_id.to_string(),
        name: name.to_string(),
        from_ts,
        to_ts,
    }
}

/// `Kraken_Trading_History_Q<q>_<year>.zip` maps to its quarter; the full
/// dump covers everything up to the known cut-off.
fn coverage_from_name(name: &str) -> (i64, i64) {
    let quarter = name
        .split(['_', '.'])
        .collect::<Vec<_>>()
        .windows(2)
        .find_map(|w| {
            let q = w[0].strip_prefix('Q')?.parse::<u32>().ok()?;
            let year = w[1].parse::<i32>().ok()?;
            (1..=4).contains(&q).then_some((q, year))
        });
    match quarter {
        Some((q, year)) => {
            let from = chrono::NaiveDate::from_ymd_opt(year, (q - 1) * 3 + 1, 1).unwrap();
            let to = if q == 4 {
                chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
            } else {
                chrono::NaiveDate::from_ymd_opt(year, q * 3 + 1, 1).unwrap()
            };
            (
                from.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis(),
                to.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis(),
            )
        }
        None => (0, FULL_HISTORY_END_MS),
    }
}

/// Best-effort scrape of the Drive folder listing. The markup rotates; any
/// failure just means the fallback ids get used.
fn parse_drive_folder_html(html: &str) -> Vec<ArchiveEntry> {
    let mut ids = Vec::new();
    for chunk in html.split("data-id=\"").skip(1) {
        if let Some(end) = chunk.find('"') {
            let id = &chunk[..end];
            if id.len() >= 20 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                // the entry name follows in the same row's markup
                let name = chunk
                    .split("Kraken_")
                    .nth(1)
                    .and_then(|rest| rest.split('"').next())
                    .map(|tail| format!("Kraken_{tail}"));
                if let Some(name) = name.filter(|n| n.ends_with(".zip")) {
                    ids.push(archive_entry(id, &name));
                }
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Seed scenario: price changes [100, 101, 101, 99], initial side buy.
    #[test]
    fn test_tick_rule_sequence() {
        let prices = [100.0, 101.0, 101.0, 99.0];
        let mut last_side = Side::Buy;
        let mut prev: Option<f64> = Some(prices[0]);
        let mut sides = Vec::new();
        for &price in &prices[1..] {
            let side = tick_rule(prev, price, last_side);
            sides.push(side);
            prev = Some(price);
            last_side = side;
        }
        assert_eq!(sides, vec![Side::Buy, Side::Buy, Side::Sell]);
    }

    #[test]
    fn test_cursor_monotonic_and_restart() {
        let rows = vec![
            (1_000, "100".to_string(), "1".to_string()),
            (2_000, "101".to_string(), "1".to_string()),
            (3_000, "99".to_string(), "1".to_string()),
            (4_000, "99".to_string(), "2".to_string()),
        ];
        let mut cursor = ZipCursor::new("file", "XBTUSD", rows);

        let first = cursor.collect(1_000, 3_000).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ts, 2_000);
        assert_eq!(first[0].side, Side::Buy);

        // forward scan continues from position
        let second = cursor.collect(2_500, 5_000).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].ts, 3_000);
        assert_eq!(second[0].side, Side::Sell);
        // unchanged price keeps previous side
        assert_eq!(second[1].side, Side::Sell);

        // backwards target restarts
        let third = cursor.collect(0, 2_500).unwrap();
        assert_eq!(third.len(), 2);
        assert_eq!(third[0].ts, 1_000);
    }

    #[test]
    fn test_parse_archive_csv_seconds_to_ms() {
        let rows = parse_archive_csv(b"1704067200,42000.5,0.25\n1704067201,42001.0,1\n").unwrap();
        assert_eq!(rows[0].0, 1_704_067_200_000);
        assert_eq!(rows[0].1, "42000.5");
    }

    #[test]
    fn test_parse_api_row() {
        let row = serde_json::json!(["42000.5", "0.25", 1704067210.4321, "s", "l", ""]);
        let (ts, price, vol, side) = parse_api_row(&row).unwrap();
        assert_eq!(ts, 1_704_067_210_432);
        assert_eq!(price, "42000.5");
        assert_eq!(vol, "0.25");
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn test_coverage_from_quarterly_name() {
        let (from, to) = coverage_from_name("Kraken_Trading_History_Q1_2024.zip");
        assert_eq!(from, 1_704_067_200_000); // 2024-01-01
        assert_eq!(to, 1_711_929_600_000); // 2024-04-01
        let (from, to) = coverage_from_name("Kraken_Full_History.zip");
        assert_eq!(from, 0);
        assert_eq!(to, FULL_HISTORY_END_MS);
    }

    #[test]
    fn test_drive_html_scrape_and_fallback() {
        let html = r#"
            <div data-id="1xmQ9ZJmoGDJrgzy0LWrA6C2fW9cMgWua" data-name="Kraken_Trading_History_Q1_2024.zip">...</div>
        "#;
        let entries = parse_drive_folder_html(html);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Kraken_Trading_History_Q1_2024.zip");

        assert!(parse_drive_folder_html("<html>rotated markup</html>").is_empty());
        assert_eq!(fallback_archives().len(), FALLBACK_ARCHIVES.len());
    }
}
