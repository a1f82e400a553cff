//! KuCoin recovery: daily spot trade ZIPs; sides arrive as `BUY`/`SELL`
//! tokens.

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

const BASE_URL: &str = "https://historical-data.kucoin.com/data/spot/daily/trades";

pub struct KucoinAdapter {
    fetcher: Arc<Fetcher>,
}

impl KucoinAdapter {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }

    fn day_url(&self, symbol: &str, day: NaiveDate) -> String {
        format!(
            "{BASE_URL}/{symbol}/{symbol}-trades-{day}.zip",
            symbol = symbol,
            day = day.format("%Y-%m-%d")
        )
    }
}

#[async_trait]
impl TradeRecoveryAdapter for KucoinAdapter {
    fn name(&self) -> &'static str {
        "kucoin"
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
            let url = self.day_url(&symbol, day);
            let body = match self.fetcher.get(&url, cancel).await {
                Ok(resp) => resp.body,
                Err(FixError::Http { status: 404, .. }) => {
                    warn!(symbol = %symbol, %day, "kucoin daily archive missing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let csv = zip_first_entry(&body)?;
            trades.extend(parse_trades_csv(&csv)?);
            debug!(symbol = %symbol, %day, total = trades.len(), "kucoin day parsed");
        }

        Ok(finalize(trades, &spans))
    }
}

/// `id,ts,price,size,side` with a header row; `ts` is in milliseconds and
/// `side` is a `BUY`/`SELL` token.
fn parse_trades_csv(bytes: &[u8]) -> Result<Vec<RecoveredTrade>, FixError> {
    let mut out = Vec::new();
    for record in csv_rows(bytes.to_vec()).records() {
        let record = record.map_err(|e| FixError::BadPayload(format!("kucoin csv: {e}")))?;
        let Some(ts) = record.get(1).and_then(|v| v.trim().parse::<i64>().ok()) else {
            continue; // header row
        };
        let price_text = record
            .get(2)
            .map(str::trim)
            .ok_or_else(|| FixError::BadPayload("kucoin csv: missing price".into()))?;
        let size_text = record
            .get(3)
            .map(str::trim)
            .ok_or_else(|| FixError::BadPayload("kucoin csv: missing size".into()))?;
        let side = match record.get(4).map(|v| v.trim().to_ascii_uppercase()).as_deref() {
            Some("BUY") => Side::Buy,
            Some("SELL") => Side::Sell,
            other => return Err(FixError::BadPayload(format!("kucoin side {other:?}"))),
        };
        out.push(
            RecoveredTrade::with_text(ts, side, price_text, size_text)
                .map_err(|e| FixError::BadPayload(format!("kucoin csv: {e}")))?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_side_tokens() {
        let csv = b"id,ts,price,size,side\n\
            1,1704067210000,42000.5,0.25,BUY\n\
            2,1704067211000,42000.0,1.5,SELL\n";
        let trades = parse_trades_csv(csv).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[1].side, Side::Sell);
    }

    #[test]
    fn test_bad_side_token_rejected() {
        let csv = b"1,1704067210000,42000.5,0.25,HODL\n";
        assert!(parse_trades_csv(csv).is_err());
    }

    #[test]
    fn test_day_url() {
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(crate::fixgaps::fetch::ReqwestTransport::new().unwrap()),
            Default::default(),
        ));
        let adapter = KucoinAdapter::new(fetcher);
        assert_eq!(
            adapter.day_url("BTC-USDT", "2024-01-01".parse().unwrap()),
            "https://historical-data.kucoin.com/data/spot/daily/trades/BTC-USDT/BTC-USDT-trades-2024-01-01.zip"
        );
    }
}
