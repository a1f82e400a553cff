//! BitMEX recovery: the public S3 bucket publishes one gzipped CSV per day
//! covering every symbol; rows are filtered to the requested instrument.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    csv_rows, finalize, gunzip, merged_spans, span_bounds, utc_days, RecoveryRequest,
    TradeRecoveryAdapter,
};
use crate::fixgaps::fetch::Fetcher;
use crate::fixgaps::FixError;
use crate::models::{RecoveredTrade, Side};

const BASE_URL: &str = "https://s3-eu-west-1.amazonaws.com/public.bitmex.com/data/trade";

pub struct BitmexAdapter {
    fetcher: Arc<Fetcher>,
}

impl BitmexAdapter {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }

    fn day_url(&self, day: NaiveDate) -> String {
        format!("{BASE_URL}/{}.csv.gz", day.format("%Y%m%d"))
    }
}

#[async_trait]
impl TradeRecoveryAdapter for BitmexAdapter {
    fn name(&self) -> &'static str {
        "bitmex"
    }

    async fn recover(
        &self,
        req: &RecoveryRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecoveredTrade>, FixError> {
        let spans = merged_spans(&req.windows);
        let Some((from, to)) = span_bounds(&spans) else {
            return Ok(Vec::new());
        };
        let symbol = req.symbol.to_uppercase();
        let mut trades = Vec::new();

        for day in utc_days(from, to, 0) {
            let url = self.day_url(day);
            let body = match self.fetcher.get(&url, cancel).await {
                Ok(resp) => resp.body,
                Err(FixError::Http { status: 404, .. }) => {
                    warn!(%day, "bitmex daily dump missing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let csv = gunzip(&body)?;
            trades.extend(parse_trades_csv(&csv, &symbol)?);
            debug!(symbol = %symbol, %day, total = trades.len(), "bitmex day parsed");
        }

        Ok(finalize(trades, &spans))
    }
}

/// `timestamp,symbol,side,size,price,...` with a header row; timestamps look
/// like `2024-01-01D00:00:10.123456789`.
fn parse_trades_csv(bytes: &[u8], symbol: &str) -> Result<Vec<RecoveredTrade>, FixError> {
    let mut out = Vec::new();
    for record in csv_rows(bytes.to_vec()).records() {
        let record = record.map_err(|e| FixError::BadPayload(format!("bitmex csv: {e}")))?;
        if record.get(1).map(str::trim) != Some(symbol) {
            continue;
        }
        let Some(ts) = record.get(0).and_then(parse_bitmex_timestamp) else {
            continue; // header row
        };
        let side = match record.get(2).map(str::trim) {
            Some("Buy") => Side::Buy,
            Some("Sell") => Side::Sell,
            other => return Err(FixError::BadPayload(format!("bitmex side {other:?}"))),
        };
        let size: f64 = record
            .get(3)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| FixError::BadPayload("bitmex csv: bad size".into()))?;
        let price: f64 = record
            .get(4)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| FixError::BadPayload("bitmex csv: bad price".into()))?;
        out.push(RecoveredTrade::new(ts, price, size, side));
    }
    Ok(out)
}

fn parse_bitmex_timestamp(raw: &str) -> Option<i64> {
    let normalised = raw.trim().replacen('D', " ", 1);
    let dt = chrono::NaiveDateTime::parse_from_str(&normalised, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Some(dt.and_utc().timestamp_millis())
}
