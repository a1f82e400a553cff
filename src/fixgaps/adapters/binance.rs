//! Binance bulk recovery: daily trade ZIPs from data.binance.vision, one
//! CSV per UTC day, for spot and USDT-margined futures.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    csv_i64, csv_rows, finalize, merged_spans, span_bounds, utc_days, zip_first_entry,
    RecoveryRequest, TradeRecoveryAdapter,
};
use crate::fixgaps::fetch::Fetcher;
use crate::fixgaps::FixError;
use crate::models::{RecoveredTrade, Side};

const BASE_URL: &str = "https://data.binance.vision";

pub struct BinanceAdapter {
    fetcher: Arc<Fetcher>,
    dataset: &'static str,
    name: &'static str,
}

impl BinanceAdapter {
    pub fn spot(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            dataset: "spot/daily/trades",
            name: "binance",
        }
    }

    pub fn usdt_futures(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            dataset: "futures/um/daily/trades",
            name: "binance_futures",
        }
    }

    fn day_url(&self, symbol: &str, day: NaiveDate) -> String {
        format!(
            "{BASE_URL}/data/{}/{symbol}/{symbol}-trades-{day}.zip",
            self.dataset,
            symbol = symbol,
            day = day.format("%Y-%m-%d")
        )
    }
}

#[async_trait]
impl TradeRecoveryAdapter for BinanceAdapter {
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

        for day in utc_days(from, to, 0) {
            let url = self.day_url(&symbol, day);
            let body = match self.fetcher.get(&url, cancel).await {
                Ok(resp) => resp.body,
                // day not published (too recent, or symbol listed later)
                Err(FixError::Http { status: 404, .. }) => {
                    warn!(symbol = %symbol, %day, "binance daily archive missing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let csv = zip_first_entry(&body)?;
            trades.extend(parse_trades_csv(&csv)?);
            debug!(symbol = %symbol, %day, total = trades.len(), "binance day parsed");
        }

        Ok(finalize(trades, &spans))
    }
}

/// `id,price,qty,quoteQty,time,isBuyerMaker[,isBestMatch]`. Futures dumps
/// carry a header row; newer spot dumps report microsecond timestamps.
pub fn parse_trades_csv(bytes: &[u8]) -> Result<Vec<RecoveredTrade>, FixError> {
    let mut out = Vec::new();
    for record in csv_rows(bytes.to_vec()).records() {
        let record = record.map_err(|e| FixError::BadPayload(format!("binance csv: {e}")))?;
        if csv_i64(&record, 0).is_none() {
            continue; // header row
        }
        let price_text = record
            .get(1)
            .ok_or_else(|| FixError::BadPayload("binance csv: missing price".into()))?
            .trim()
            .to_string();
        let size_text = record
            .get(2)
            .ok_or_else(|| FixError::BadPayload("binance csv: missing qty".into()))?
            .trim()
            .to_string();
        let mut ts = csv_i64(&record, 4)
            .ok_or_else(|| FixError::BadPayload("binance csv: bad time".into()))?;
        if ts > 10_000_000_000_000_000 {
            ts /= 1_000_000; // nanoseconds
        } else if ts > 10_000_000_000_000 {
            ts /= 1_000; // microseconds
        }
        let maker = matches!(
            record.get(5).map(str::trim),
            Some("true") | Some("True") | Some("TRUE") | Some("1")
        );
        // the buyer being the maker means the aggressor sold
        let side = if maker { Side::Sell } else { Side::Buy };
        out.push(
            RecoveredTrade::with_text(ts, side, &price_text, &size_text)
                .map_err(|e| FixError::BadPayload(format!("binance csv: {e}")))?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixgaps::adapters::test_util::{make_zip, window};

    /// Seed scenario: stored ZIP with the documented CSV shape, open-interval
    /// filtering, maker→sell mapping.
    #[test]
    fn test_parse_trades_csv_side_mapping() {
        let csv = b"1,50000.5,0.25,12500.125,1704067210000,true,true\n\
                    2,50001.0,0.50,25000.5,1704067220000,false,true\n";
        let trades = parse_trades_csv(csv).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, Side::Sell);
        assert_eq!(trades[0].price_text, "50000.5");
        assert_eq!(trades[1].side, Side::Buy);
        assert_eq!(trades[1].ts, 1_704_067_220_000);
    }

    #[test]
    fn test_parse_skips_header_row() {
        let csv = b"id,price,qty,quote_qty,time,is_buyer_maker\n\
                    7,100.0,1.0,100.0,1704067210000,false\n";
        let trades = parse_trades_csv(csv).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].ts, 1_704_067_210_000);
    }

    #[test]
    fn test_parse_microsecond_timestamps() {
        let csv = b"1,100.0,1.0,100.0,1704067210000000,false\n";
        let trades = parse_trades_csv(csv).unwrap();
        assert_eq!(trades[0].ts, 1_704_067_210_000);
    }

    #[test]
    fn test_zip_extraction_and_window_filter() {
        let csv = b"1,100.0,1.0,100.0,1704067205000,true\n\
                    2,101.0,1.0,101.0,1704067210000,false\n\
                    3,102.0,1.0,102.0,1704067215000,false\n";
        let zipped = make_zip("BTCUSDT-trades-2024-01-01.csv", csv);
        let extracted = zip_first_entry(&zipped).unwrap();
        let trades = parse_trades_csv(&extracted).unwrap();

        let spans = merged_spans(&[window(1, 1_704_067_205_000, 1_704_067_215_000)]);
        let filtered = finalize(trades, &spans);
        // open interval: boundary trades at from/to excluded
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].ts, 1_704_067_210_000);
        assert_eq!(filtered[0].side, Side::Buy);
    }

    #[test]
    fn test_day_urls() {
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(crate::fixgaps::fetch::ReqwestTransport::new().unwrap()),
            Default::default(),
        ));
        let spot = BinanceAdapter::spot(fetcher.clone());
        let day: NaiveDate = "2024-01-01".parse().unwrap();
        assert_eq!(
            spot.day_url("BTCUSDT", day),
            "https://data.binance.vision/data/spot/daily/trades/BTCUSDT/BTCUSDT-trades-2024-01-01.zip"
        );
        let fut = BinanceAdapter::usdt_futures(fetcher);
        assert_eq!(
            fut.day_url("BTCUSDT", day),
            "https://data.binance.vision/data/futures/um/daily/trades/BTCUSDT/BTCUSDT-trades-2024-01-01.zip"
        );
    }
}
