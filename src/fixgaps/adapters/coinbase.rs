//! Coinbase recovery: one brokerage ticker page for the newest slice, then
//! the exchange trades endpoint paginated backwards by trade id until the
//! window's lower bound is crossed.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{finalize, merged_spans, span_bounds, RecoveryRequest, TradeRecoveryAdapter};
use crate::fixgaps::fetch::Fetcher;
use crate::fixgaps::FixError;
use crate::models::{RecoveredTrade, Side};

const BROKERAGE_URL: &str = "https://api.coinbase.com/api/v3/brokerage/market";
const EXCHANGE_URL: &str = "https://api.exchange.coinbase.com";
const PAGE_LIMIT: usize = 1000;
const MAX_PAGES: usize = 500;

#[derive(Debug, Deserialize)]
struct TickerResponse {
    trades: Vec<BrokerageTrade>,
}

#[derive(Debug, Deserialize)]
struct BrokerageTrade {
    trade_id: String,
    price: String,
    size: String,
    time: String,
    side: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeTrade {
    time: String,
    trade_id: i64,
    price: String,
    size: String,
    side: String,
}

pub struct CoinbaseAdapter {
    fetcher: Arc<Fetcher>,
}

impl CoinbaseAdapter {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl TradeRecoveryAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
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

        // newest slice via the brokerage ticker, which also yields the id
        // cursor for the exchange pagination
        let ticker_url = format!(
            "{BROKERAGE_URL}/products/{pair}/ticker?start={}&end={}&limit={PAGE_LIMIT}",
            from / 1_000,
            to / 1_000
        );
        let ticker: TickerResponse = self.fetcher.get(&ticker_url, cancel).await?.json()?;
        let mut oldest_id: Option<i64> = None;
        let mut oldest_ts = i64::MAX;
        for t in &ticker.trades {
            let ts = parse_rfc3339_ms(&t.time)?;
            if ts < oldest_ts {
                oldest_ts = ts;
                oldest_id = t.trade_id.parse().ok();
            }
            trades.push(brokerage_trade(t, ts)?);
        }
        debug!(pair = %pair, page = ticker.trades.len(), "coinbase ticker page");

        // paginate older trades until we cross the lower bound
        let mut after = oldest_id;
        for _ in 0..MAX_PAGES {
            let Some(cursor) = after else { break };
            if oldest_ts <= from {
                break;
            }
            let url = format!(
                "{EXCHANGE_URL}/products/{pair}/trades?after={cursor}&limit={PAGE_LIMIT}"
            );
            let page: Vec<ExchangeTrade> = self.fetcher.get(&url, cancel).await?.json()?;
            if page.is_empty() {
                break;
            }
            let mut min_id = cursor;
            for t in &page {
                let ts = parse_rfc3339_ms(&t.time)?;
                oldest_ts = oldest_ts.min(ts);
                min_id = min_id.min(t.trade_id);
                let side = parse_side(&t.side)?;
                trades.push(
                    RecoveredTrade::with_text(ts, side, &t.price, &t.size)
                        .map_err(|e| FixError::BadPayload(format!("coinbase trade: {e}")))?,
                );
            }
            debug!(pair = %pair, page = page.len(), oldest_ts, "coinbase trades page");
            after = Some(min_id);
        }

        Ok(finalize(trades, &spans))
    }
}

fn brokerage_trade(t: &BrokerageTrade, ts: i64) -> Result<RecoveredTrade, FixError> {
    let side = parse_side(&t.side)?;
    RecoveredTrade::with_text(ts, side, &t.price, &t.size)
        .map_err(|e| FixError::BadPayload(format!("coinbase trade: {e}")))
}

fn parse_side(side: &str) -> Result<Side, FixError> {
    match side.to_ascii_uppercase().as_str() {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(FixError::BadPayload(format!("coinbase side '{other}'"))),
    }
}

fn parse_rfc3339_ms(time: &str) -> Result<i64, FixError> {
    chrono::DateTime::parse_from_rfc3339(time)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| FixError::BadPayload(format!("coinbase time '{time}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339_ms() {
        assert_eq!(
            parse_rfc3339_ms("2024-01-01T00:00:10.500Z").unwrap(),
            1_704_067_210_500
        );
        assert!(parse_rfc3339_ms("yesterday").is_err());
    }

    #[test]
    fn test_parse_side_cases() {
        assert_eq!(parse_side("BUY").unwrap(), Side::Buy);
        assert_eq!(parse_side("sell").unwrap(), Side::Sell);
        assert!(parse_side("hold").is_err());
    }

    #[test]
    fn test_exchange_payload_shape() {
        let raw = r#"[
            {"time": "2024-01-01T00:00:10Z", "trade_id": 42, "price": "42000.5", "size": "0.1", "side": "buy"}
        ]"#;
        let page: Vec<ExchangeTrade> = serde_json::from_str(raw).unwrap();
        assert_eq!(page[0].trade_id, 42);
        assert_eq!(page[0].price, "42000.5");
    }

    #[test]
    fn test_brokerage_payload_shape() {
        let raw = r#"{"trades": [
            {"trade_id": "99", "price": "42000.5", "size": "0.1", "time": "2024-01-01T00:00:10Z", "side": "SELL"}
        ], "best_bid": "1", "best_ask": "2"}"#;
        let resp: TickerResponse = serde_json::from_str(raw).unwrap();
        let t = brokerage_trade(&resp.trades[0], 1_704_067_210_000).unwrap();
        assert_eq!(t.side, Side::Sell);
        assert_eq!(t.size_text, "0.1");
    }
}
