//! OKX recovery: daily trade ZIPs on static.okx.com only (no paginated API
//! fallback), published for days since 2021-09-02. Futures and swap sizes
//! are contract counts and get rescaled by the instrument's contract value.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
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

const STATIC_URL: &str = "https://static.okx.com";
const API_URL: &str = "https://www.okx.com";
/// First day with published archives.
const FIRST_ARCHIVE_DAY: &str = "2021-09-02";

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    data: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "ctVal", default)]
    ct_val: String,
    #[serde(rename = "ctType", default)]
    ct_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ContractScale {
    ct_val: f64,
    inverse: bool,
}

pub struct OkxAdapter {
    fetcher: Arc<Fetcher>,
}

impl OkxAdapter {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }

    fn day_url(&self, inst: &str, day: NaiveDate) -> String {
        format!(
            "{STATIC_URL}/cdn/okex/traderecords/trades/daily/{compact}/{inst}-trades-{day}.zip",
            compact = day.format("%Y%m%d"),
            inst = inst,
            day = day.format("%Y-%m-%d")
        )
    }

    /// Contract value for derivative instruments; spot returns `None`.
    async fn contract_scale(
        &self,
        inst: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ContractScale>, FixError> {
        let inst_type = if inst.ends_with("-SWAP") {
            "SWAP"
        } else if inst.rsplit('-').next().map_or(false, |tail| {
            tail.len() == 6 && tail.chars().all(|c| c.is_ascii_digit())
        }) {
            "FUTURES"
        } else {
            return Ok(None);
        };
        let url = format!(
            "{API_URL}/api/v5/public/instruments?instType={inst_type}&instId={inst}"
        );
        let resp: InstrumentsResponse = self.fetcher.get(&url, cancel).await?.json()?;
        let found = resp
            .data
            .into_iter()
            .find(|i| i.inst_id == inst)
            .ok_or_else(|| FixError::BadPayload(format!("okx instrument {inst} unknown")))?;
        let ct_val: f64 = found
            .ct_val
            .parse()
            .map_err(|_| FixError::BadPayload(format!("okx ctVal '{}'", found.ct_val)))?;
        Ok(Some(ContractScale {
            ct_val,
            inverse: found.ct_type == "inverse",
        }))
    }
}

#[async_trait]
impl TradeRecoveryAdapter for OkxAdapter {
    fn name(&self) -> &'static str {
        "okx"
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
        let inst = req.symbol.to_uppercase();
        let first_day: NaiveDate = FIRST_ARCHIVE_DAY.parse().unwrap();
        let scale = self.contract_scale(&inst, cancel).await?;

        let mut trades = Vec::new();
        for day in utc_days(from, to, 0) {
            if day < first_day {
                warn!(%day, "okx archives start at {FIRST_ARCHIVE_DAY}, skipping");
                continue;
            }
            let url = self.day_url(&inst, day);
            let body = match self.fetcher.get(&url, cancel).await {
                Ok(resp) => resp.body,
                Err(FixError::Http { status: 404, .. }) => {
                    warn!(inst = %inst, %day, "okx daily archive missing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let csv = zip_first_entry(&body)?;
            trades.extend(parse_trades_csv(&csv, scale)?);
            debug!(inst = %inst, %day, total = trades.len(), "okx day parsed");
        }

        Ok(finalize(trades, &spans))
    }
}

/// `trade_id,side,size,price,created_time`; header row present.
fn parse_trades_csv(
    bytes: &[u8],
    scale: Option<ContractScale>,
) -> Result<Vec<RecoveredTrade>, FixError> {
    let mut out = Vec::new();
    for record in csv_rows(bytes.to_vec()).records() {
        let record = record.map_err(|e| FixError::BadPayload(format!("okx csv: {e}")))?;
        let Some(ts) = record.get(4).and_then(|v| v.trim().parse::<i64>().ok()) else {
            continue; // header row
        };
        let side = match record.get(1).map(str::trim) {
            Some("buy") | Some("BUY") => Side::Buy,
            Some("sell") | Some("SELL") => Side::Sell,
            other => {
                return Err(FixError::BadPayload(format!("okx side {other:?}")));
            }
        };
        let size: f64 = record
            .get(2)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| FixError::BadPayload("okx csv: bad size".into()))?;
        let price: f64 = record
            .get(3)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| FixError::BadPayload("okx csv: bad price".into()))?;

        let size = match scale {
            Some(s) if s.inverse => size * s.ct_val / price,
            Some(s) => size * s.ct_val,
            None => size,
        };
        out.push(RecoveredTrade::new(ts, price, size, side));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &[u8] = b"trade_id,side,size,price,created_time\n\
        1,buy,2,42000.0,1704067210000\n\
        2,sell,4,42001.0,1704067211000\n";

    #[test]
    fn test_parse_spot_csv() {
        let trades = parse_trades_csv(CSV, None).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].size, 2.0);
        assert_eq!(trades[1].ts, 1_704_067_211_000);
    }

    #[test]
    fn test_linear_contract_scaling() {
        let scale = ContractScale {
            ct_val: 0.01,
            inverse: false,
        };
        let trades = parse_trades_csv(CSV, Some(scale)).unwrap();
        assert_eq!(trades[0].size, 0.02);
    }

    #[test]
    fn test_inverse_contract_scaling() {
        let scale = ContractScale {
            ct_val: 100.0,
            inverse: true,
        };
        let trades = parse_trades_csv(CSV, Some(scale)).unwrap();
        // size * ctVal / price
        assert!((trades[0].size - 2.0 * 100.0 / 42_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_day_url_uses_compact_and_dashed_forms() {
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(crate::fixgaps::fetch::ReqwestTransport::new().unwrap()),
            Default::default(),
        ));
        let adapter = OkxAdapter::new(fetcher);
        let day: NaiveDate = "2024-01-01".parse().unwrap();
        assert_eq!(
            adapter.day_url("BTC-USDT", day),
            "https://static.okx.com/cdn/okex/traderecords/trades/daily/20240101/BTC-USDT-trades-2024-01-01.zip"
        );
    }
}
