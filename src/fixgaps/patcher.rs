//! Binary patcher: after a merge widened a source file, every derived
//! timeframe binary of the market gets its affected slot range recomputed
//! in place. The patched file is replayed once per timeframe and the slots
//! covering the inserted span are overwritten, empty candles included, so a
//! previously-filled slot that lost its only trades would go back to gap.

use anyhow::{ensure, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::codec::{parse_line, ParsedLine};
use crate::models::MarketKey;
use crate::pipeline::accumulator::CandleAccumulator;
use crate::pipeline::LineReader;
use crate::store::binary::overwrite_range;
use crate::store::companion::{bin_path, list_companions};
use crate::store::Candle;

/// Recompute the slots of every timeframe binary touched by trades inserted
/// in `[min_ts, max_ts]`. Returns how many binaries were patched.
pub fn patch_binaries(
    catalog: &Catalog,
    output_root: &Path,
    market: &MarketKey,
    source_file: &Path,
    min_ts: i64,
    max_ts: i64,
) -> Result<usize> {
    let mut patched = 0usize;

    for (tf, companion) in list_companions(output_root, market)? {
        let from_slot = companion.start_ts.max(tf.slot(min_ts));
        let to_slot = (companion.end_ts - tf.ms).min(tf.slot(max_ts));
        if to_slot < from_slot {
            debug!(market = %market, timeframe = %tf, "insert span outside binary, skipping");
            continue;
        }
        // the companion's start is slot-aligned by construction; a mismatch
        // means the descriptor and binary disagree and patching would
        // corrupt the file
        ensure!(
            (from_slot - companion.start_ts) % tf.ms == 0,
            "slot {from_slot} misaligned against {} (start {}, stride {})",
            market,
            companion.start_ts,
            tf.ms
        );

        let buckets = replay_range(source_file, &market.exchange, &tf, from_slot, to_slot)?;

        let mut candles = Vec::with_capacity(((to_slot - from_slot) / tf.ms + 1) as usize);
        let mut slot = from_slot;
        while slot <= to_slot {
            candles.push(buckets.get(&slot).copied().unwrap_or_default());
            slot += tf.ms;
        }

        let first_idx = (from_slot - companion.start_ts) / tf.ms;
        let path = bin_path(output_root, market, &tf);
        overwrite_range(&path, first_idx, &candles)
            .with_context(|| format!("patch {}", path.display()))?;
        catalog.upsert_registry(market, &tf.label, companion.start_ts, companion.end_ts)?;
        patched += 1;

        info!(
            market = %market,
            timeframe = %tf,
            from_slot,
            to_slot,
            slots = candles.len(),
            "binary patched"
        );
    }
    Ok(patched)
}

/// Fold the patched source file's trades whose slot lies in
/// `[from_slot, to_slot]`.
fn replay_range(
    source_file: &Path,
    exchange: &str,
    tf: &crate::models::Timeframe,
    from_slot: i64,
    to_slot: i64,
) -> Result<BTreeMap<i64, Candle>> {
    let mut acc = CandleAccumulator::new(tf.clone());
    for item in LineReader::open(source_file)? {
        let (line_no, line) = item?;
        if let ParsedLine::Trade(trade) = parse_line(exchange, &line) {
            let slot = tf.slot(trade.ts);
            if slot >= from_slot && slot <= to_slot {
                acc.push(&trade)
                    .with_context(|| format!("replay line {line_no}"))?;
            }
        }
    }
    Ok(acc.into_buckets())
}
