//! Bitfinex recovery via the public v2 trades history endpoint, paginated
//! forward by `last mts + 1`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{finalize, merged_spans, span_bounds, RecoveryRequest, TradeRecoveryAdapter};
use crate::fixgaps::fetch::Fetcher;
use crate::fixgaps::FixError;
use crate::models::{RecoveredTrade, Side};

const BASE_URL: &str = "https://api-pub.bitfinex.com";
const PAGE_LIMIT: usize = 1000;
const MAX_PAGES: usize = 500;

pub struct BitfinexAdapter {
    fetcher: Arc<Fetcher>,
}

impl BitfinexAdapter {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }

    fn page_url(&self, pair: &str, start: i64, end: i64) -> String {
        format!(
            "{BASE_URL}/v2/trades/t{pair}/hist?start={start}&end={end}&limit={PAGE_LIMIT}&sort=1"
        )
    }
}

#[async_trait]
impl TradeRecoveryAdapter for BitfinexAdapter {
    fn name(&self) -> &'static str {
        "bitfinex"
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
        let pair = req.symbol.to_uppercase();
        let mut trades = Vec::new();
        let mut cursor = from;

        for _ in 0..MAX_PAGES {
            let url = self.page_url(&pair, cursor, to);
            let resp = self.fetcher.get(&url, cancel).await?;
            // rows are [ID, MTS, AMOUNT, PRICE] in mts-ascending order
            let rows: Vec<serde_json::Value> = resp.json()?;
            if rows.is_empty() {
                break;
            }
            let mut page_last = cursor;
            for row in &rows {
                let (ts, amount, price) = parse_row(row)?;
                page_last = page_last.max(ts);
                let side = if amount >= 0.0 { Side::Buy } else { Side::Sell };
                trades.push(RecoveredTrade::new(ts, price, amount.abs(), side));
            }
            debug!(pair = %pair, rows = rows.len(), cursor, "bitfinex page");
            if rows.len() < PAGE_LIMIT || page_last >= to {
                break;
            }
            cursor = page_last + 1;
        }

        Ok(finalize(trades, &spans))
    }
}

fn parse_row(row: &serde_json::Value) -> Result<(i64, f64, f64), FixError> {
    let arr = row
        .as_array()
        .filter(|a| a.len() >= 4)
        .ok_or_else(|| FixError::BadPayload("bitfinex: row is not [id,mts,amount,price]".into()))?;
    let ts = arr[1]
        .as_i64()
        .ok_or_else(|| FixError::BadPayload("bitfinex: bad mts".into()))?;
    let amount = arr[2]
        .as_f64()
        .ok_or_else(|| FixError::BadPayload("bitfinex: bad amount".into()))?;
    let price = arr[3]
        .as_f64()
        .ok_or_else(|| FixError::BadPayload("bitfinex: bad price".into()))?;
    Ok((ts, amount, price))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_row_side_from_amount_sign() {
        let buy: serde_json::Value = serde_json::json!([123, 1704067210000i64, 0.5, 42000.0]);
        let sell: serde_json::Value = serde_json::json!([124, 1704067211000i64, -1.5, 42001.0]);
        assert_eq!(parse_row(&buy).unwrap(), (1_704_067_210_000, 0.5, 42_000.0));
        let (_, amount, _) = parse_row(&sell).unwrap();
        assert!(amount < 0.0);
    }

    #[test]
    fn test_parse_row_rejects_short_arrays() {
        let bad: serde_json::Value = serde_json::json!([123, 1704067210000i64]);
        assert!(parse_row(&bad).is_err());
    }

    #[test]
    fn test_page_url_shape() {
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(crate::fixgaps::fetch::ReqwestTransport::new().unwrap()),
            Default::default(),
        ));
        let adapter = BitfinexAdapter::new(fetcher);
        assert_eq!(
            adapter.page_url("BTCUSD", 100, 200),
            "https://api-pub.bitfinex.com/v2/trades/tBTCUSD/hist?start=100&end=200&limit=1000&sort=1"
        );
    }
}
