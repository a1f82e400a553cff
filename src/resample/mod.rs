//! On-demand resampler: materialises a coarser timeframe binary by folding
//! an existing finer one.
//!
//! Source choice: among present timeframes whose stride divides the target,
//! prefer a "fresh" one (its end matches the finest timeframe's end aligned
//! to its own stride) and among fresh candidates take the coarsest; with no
//! fresh candidate fall back to the finest. An existing target binary is
//! extended by appending only the missing tail slots.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::models::{MarketKey, Timeframe};
use crate::store::binary::append_candles;
use crate::store::companion::{bin_path, companion_path, list_companions, Companion};
use crate::store::{Candle, CandleBinReader, CandleBinWriter};

/// Ensure `target` exists for the market, materialising it if needed.
/// Returns the target companion, or `None` when the market has no data.
pub fn ensure_timeframe(
    catalog: &Catalog,
    output_root: &Path,
    market: &MarketKey,
    target: &Timeframe,
) -> Result<Option<Companion>> {
    let present = list_companions(output_root, market)?;
    if present.is_empty() {
        return Ok(None);
    }
    let existing = present.iter().find(|(tf, _)| tf.ms == target.ms);

    let Some((source_tf, source)) = choose_source(&present, target) else {
        // the target may itself be the finest materialised timeframe
        if let Some((_, old)) = existing {
            return Ok(Some(old.clone()));
        }
        bail!("no timeframe of {market} divides {target}");
    };

    let target_start = target.slot(source.start_ts);
    let target_end = target.slot(source.end_ts);
    if target_end <= target_start {
        return Ok(existing.map(|(_, c)| c.clone()));
    }

    // append from the old end when the existing binary lines up, otherwise
    // rebuild from offset 0
    let append_from = match existing {
        Some((_, old)) if old.start_ts == target_start && old.end_ts < target_end => old.end_ts,
        Some((_, old)) if old.start_ts == target_start && old.end_ts >= target_end => {
            debug!(market = %market, timeframe = %target, "target already current");
            return Ok(Some(old.clone()));
        }
        _ => target_start,
    };

    let source_path = bin_path(output_root, market, &source_tf);
    let reload = {
        let p = companion_path(output_root, market, &source_tf);
        move || Companion::load(&p)
    };
    let mut reader = CandleBinReader::open(&source_path, source.clone(), reload)?;

    let folded = fold_range(&mut reader, &source, target, append_from, target_end)?;
    let target_bin = bin_path(output_root, market, target);

    if append_from == target_start {
        let mut writer = CandleBinWriter::create(&target_bin)?;
        for candle in &folded {
            writer.push(candle)?;
        }
        writer.finish()?;
    } else {
        append_candles(&target_bin, &folded)
            .with_context(|| format!("extend {}", target_bin.display()))?;
    }

    let companion = Companion::new(market, target, target_start, target_end);
    companion.save(&companion_path(output_root, market, target))?;
    catalog.upsert_registry(market, &target.label, target_start, target_end)?;

    info!(
        market = %market,
        source = %source_tf,
        target = %target,
        slots = folded.len(),
        appended = append_from != target_start,
        "timeframe materialised"
    );
    Ok(Some(companion))
}

/// Pick the source to fold from. `present` is sorted finest first.
fn choose_source<'a>(
    present: &'a [(Timeframe, Companion)],
    target: &Timeframe,
) -> Option<(Timeframe, Companion)> {
    let finest = &present.first()?.1;
    let compatible: Vec<&(Timeframe, Companion)> = present
        .iter()
        .filter(|(tf, _)| tf.ms <= target.ms && target.ms % tf.ms == 0 && tf.ms != target.ms)
        .collect();

    let fresh: Option<&&(Timeframe, Companion)> = compatible
        .iter()
        .filter(|(tf, c)| c.end_ts == tf.slot(finest.end_ts))
        .last(); // coarsest fresh (list is sorted finest first)

    fresh
        .or_else(|| compatible.first())
        .map(|(tf, c)| (tf.clone(), c.clone()))
}

/// Fold source slots into target candles over `[from, to)`.
fn fold_range(
    reader: &mut CandleBinReader,
    source: &Companion,
    target: &Timeframe,
    from: i64,
    to: i64,
) -> Result<Vec<Candle>> {
    let src_ms = source.timeframe_ms;
    let mut out = Vec::with_capacity(((to - from) / target.ms) as usize);

    let mut slot = from;
    while slot < to {
        let cover_from = slot.max(source.start_ts);
        let cover_to = (slot + target.ms).min(source.end_ts);
        let mut folded = Candle::default();
        if cover_from < cover_to {
            let first_idx = (cover_from - source.start_ts) / src_ms;
            let last_idx = (cover_to - source.start_ts) / src_ms - 1;
            for src in reader.read_range(first_idx, last_idx)? {
                fold_into(&mut folded, &src);
            }
        }
        out.push(folded);
        slot += target.ms;
    }
    Ok(out)
}

/// OHLC folds over non-gap sources only; sums always accumulate.
fn fold_into(target: &mut Candle, src: &Candle) {
    if !src.is_gap() {
        if target.is_gap() {
            target.open = src.open;
            target.high = src.high;
            target.low = src.low;
        } else {
            target.high = target.high.max(src.high);
            target.low = target.low.min(src.low);
        }
        target.close = src.close;
    }
    target.buy_vol += src.buy_vol;
    target.sell_vol += src.sell_vol;
    target.buy_count += src.buy_count;
    target.sell_count += src.sell_count;
    target.liq_buy += src.liq_buy;
    target.liq_sell += src.liq_sell;
}
