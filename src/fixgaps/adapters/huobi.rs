//! Huobi recovery: daily trade ZIPs for spot and linear swaps. The venue
//! cuts its daily files on UTC+8, so day enumeration is shifted by +8 h.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    csv_rows, finalize, merged_spans, span_bounds, utc_days, zip_first_entry, RecoveryRequest,
    TradeRecoveryAdapter,
};
use crate::fixgaps::fetch::Fetcher;
use crate::fixgaps::FixError;
use crate::models::{RecoveredTrade, Side};

const BASE_URL: &str = "https://futures.huobi.com/data";
/// Huobi daily files roll over on Asia/Shanghai midnight.
const DAY_SHIFT_HOURS: i64 = 8;

pub struct HuobiAdapter {
    fetcher: Arc<Fetcher>,
    dataset: &'static str,
    name: &'static str,
}

impl HuobiAdapter {
    pub fn spot(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            dataset: "trades/spot/daily",
            name: "huobi",
        }
    }

    pub fn linear_swap(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            dataset: "trades/linear-swap/daily",
            name: "huobi_swap",
        }
    }

    fn day_url(&self, symbol: &str, day: NaiveDate) -> String {
        format!(
            "{BASE_URL}/{}/{symbol}/{symbol}-trades-{day}.zip",
            self.dataset,
            symbol = symbol,
            day = day.format("%Y-%m-%d")
        )
    }
}

#[async_trait]
impl TradeRecoveryAdapter for HuobiAdapter {
    fn name(&self) -> &'static str {
        self.name
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

        for day in utc_days(from, to, DAY_SHIFT_HOURS) {
            let url = self.day_url(&symbol, day);
            let body = match self.fetcher.get(&url, cancel).await {
                Ok(resp) => resp.body,
                Err(FixError::Http { status: 404, .. }) => {
                    warn!(symbol = %symbol, %day, "huobi daily archive missing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let csv = zip_first_entry(&body)?;
            trades.extend(parse_trades_csv(&csv)?);
            debug!(symbol = %symbol, %day, total = trades.len(), "huobi day parsed");
        }

        Ok(finalize(trades, &spans))
    }
}

/// `id,ts,price,amount,direction` with a header row; direction is
/// `buy`/`sell`.
fn parse_trades_csv(bytes: &[u8]) -> Result<Vec<RecoveredTrade>, FixError> {
    let mut out = Vec::new();
    for record in csv_rows(bytes.to_vec()).records() {
        let record = record.map_err(|e| FixError::BadPayload(format!("huobi csv: {e}")))?;
        let Some(ts) = record.get(1).and_then(|v| v.trim().parse::<i64>().ok()) else {
            continue; // header row
        };
        let price_text = record
            .get(2)
            .map(str::trim)
            .ok_or_else(|| FixError::BadPayload("huobi csv: missing price".into()))?;
        let size_text = record
            .get(3)
            .map(str::trim)
            .ok_or_else(|| FixError::BadPayload("huobi csv: missing amount".into()))?;
        let side = match record.get(4).map(str::trim) {
            Some("buy") | Some("BUY") => Side::Buy,
            Some("sell") | Some("SELL") => Side::Sell,
            other => return Err(FixError::BadPayload(format!("huobi direction {other:?}"))),
        };
        out.push(
            RecoveredTrade::with_text(ts, side, price_text, size_text)
                .map_err(|e| FixError::BadPayload(format!("huobi csv: {e}")))?,
        );
    }
    Ok(out)
}
