//! Processor: turns one market's archive files into a dense candle binary,
//! a companion descriptor and a batch of anomaly events, then registers the
//! materialised range in the catalog.
//!
//! Resume is cutoff-based: a companion remembers the exclusive end of the
//! folded range and the newest source-file start ever ingested; older input
//! is dropped instead of re-folded. Binary and companion are staged to temp
//! paths and land via atomic rename, so a crash never leaves a torn pair.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, FileRow, MarketFilter};
use crate::codec::{parse_line, ParsedLine};
use crate::models::{MarketKey, Timeframe};
use crate::pipeline::accumulator::CandleAccumulator;
use crate::pipeline::events::EventAccumulator;
use crate::pipeline::gap_tracker::GapTracker;
use crate::pipeline::line_reader::LineReader;
use crate::store::companion::{bin_path, companion_path, Companion};
use crate::store::{Candle, CandleBinReader, CandleBinWriter};

/// Worker cap for market batches.
fn worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    cpus.saturating_sub(1).clamp(1, 16)
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub timeframe: Timeframe,
    /// Rebuild from scratch, ignoring resume cutoffs.
    pub force: bool,
}

/// Per-market outcome.
#[derive(Debug, Clone, Default)]
pub struct MarketOutcome {
    pub files_read: usize,
    pub files_skipped: usize,
    pub trades: u64,
    pub events: usize,
    pub records_written: u64,
}

/// Batch summary over many markets.
#[derive(Debug, Default)]
pub struct ProcessStats {
    pub markets_processed: usize,
    pub markets_failed: usize,
    pub records_written: u64,
    pub events: usize,
}

/// Process every market matching `filter` over a bounded worker pool.
/// Markets are disjoint in market-key, so per-market failures stay isolated.
pub fn process_markets(
    catalog: &Catalog,
    output_root: &Path,
    filter: &MarketFilter,
    options: &ProcessOptions,
    cancel: &CancellationToken,
) -> Result<ProcessStats> {
    let markets = catalog.market_keys(filter)?;
    info!(markets = markets.len(), timeframe = %options.timeframe, "processing markets");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count())
        .build()
        .context("build worker pool")?;

    let outcomes: Vec<(MarketKey, Result<MarketOutcome>)> = pool.install(|| {
        markets
            .par_iter()
            .map(|market| {
                let result = if cancel.is_cancelled() {
                    Err(anyhow::anyhow!("cancelled"))
                } else {
                    process_market(catalog, output_root, market, options, cancel)
                };
                (market.clone(), result)
            })
            .collect()
    });

    let mut stats = ProcessStats::default();
    for (market, result) in outcomes {
        match result {
            Ok(outcome) => {
                stats.markets_processed += 1;
                stats.records_written += outcome.records_written;
                stats.events += outcome.events;
            }
            Err(e) => {
                stats.markets_failed += 1;
                warn!(market = %market, error = %e, "market processing failed");
            }
        }
    }
    Ok(stats)
}

/// Process one market end to end.
pub fn process_market(
    catalog: &Catalog,
    output_root: &Path,
    market: &MarketKey,
    options: &ProcessOptions,
    cancel: &CancellationToken,
) -> Result<MarketOutcome> {
    let tf = &options.timeframe;
    let files = catalog.files_for_market(market)?;
    let mut outcome = MarketOutcome::default();

    let companion_file = companion_path(output_root, market, tf);
    let previous = if options.force {
        None
    } else if companion_file.exists() {
        Some(Companion::load(&companion_file)?)
    } else {
        None
    };

    let input_cutoff = previous.as_ref().and_then(|c| c.last_input_start_ts);
    let ts_cutoff = previous.as_ref().map(|c| c.end_ts);

    let mut acc = CandleAccumulator::new(tf.clone());
    let mut tracker = GapTracker::new(tf.ms);
    let mut newest_input = input_cutoff.unwrap_or(i64::MIN);

    for file in &files {
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        if let Some(cutoff) = input_cutoff {
            if file.start_ts < cutoff {
                outcome.files_skipped += 1;
                continue;
            }
        }
        let events = stream_file(catalog, file, ts_cutoff, &mut acc, &mut tracker, &mut outcome)?;
        catalog.delete_events_for_file(file.root_id, &file.relative_path)?;
        outcome.events += catalog.insert_events(file, &events)?;
        newest_input = newest_input.max(file.start_ts);
        outcome.files_read += 1;
    }

    let (Some(min_slot), Some(max_slot)) = (acc.min_slot(), acc.max_slot()) else {
        debug!(market = %market, "no new candles");
        return Ok(outcome);
    };
    let start_ts = previous.as_ref().map_or(min_slot, |c| c.start_ts.min(min_slot));
    let end_ts = previous
        .as_ref()
        .map_or(max_slot + tf.ms, |c| c.end_ts.max(max_slot + tf.ms));

    let records = write_merged_binary(
        &bin_path(output_root, market, tf),
        previous.as_ref(),
        &acc,
        start_ts,
        end_ts,
    )?;

    let mut companion = Companion::new(market, tf, start_ts, end_ts);
    companion.last_input_start_ts = (newest_input > i64::MIN).then_some(newest_input);
    companion.save(&companion_file)?;

    catalog.upsert_registry(market, &tf.label, start_ts, end_ts)?;
    outcome.records_written = records;

    info!(
        market = %market,
        timeframe = %tf,
        records,
        events = outcome.events,
        "market processed"
    );
    Ok(outcome)
}

/// Stream one file through codec, accumulator, gap tracker and the event
/// accumulator; returns the file's coalesced events.
fn stream_file(
    catalog: &Catalog,
    file: &FileRow,
    ts_cutoff: Option<i64>,
    acc: &mut CandleAccumulator,
    tracker: &mut GapTracker,
    outcome: &mut MarketOutcome,
) -> Result<Vec<crate::catalog::NewEvent>> {
    let root = catalog.root_path(file.root_id)?;
    let path = root.join(&file.relative_path);
    let mut events = EventAccumulator::new();

    for item in LineReader::open(&path)? {
        let (line_no, line) = item?;
        if line.is_empty() {
            continue;
        }
        match parse_line(&file.exchange, &line) {
            ParsedLine::Rejected(kind) => events.reject(kind, line_no as i64),
            ParsedLine::Trade(trade) => {
                if let Some(cutoff) = ts_cutoff {
                    if trade.ts < cutoff {
                        continue;
                    }
                }
                acc.push(&trade)
                    .with_context(|| format!("fold {} line {line_no}", path.display()))?;
                if let Some(signal) = tracker.observe(&trade) {
                    events.gap(line_no as i64, signal);
                }
                outcome.trades += 1;
            }
        }
    }
    Ok(events.finish())
}

/// Write the union of the previous binary and the new buckets over
/// `[start_ts, end_ts)`. Old slots outside the new buckets are carried over
/// record by record; everything else comes from the accumulator (gap candles
/// where neither has data).
fn write_merged_binary(
    path: &Path,
    previous: Option<&Companion>,
    acc: &CandleAccumulator,
    start_ts: i64,
    end_ts: i64,
) -> Result<u64> {
    let tf_ms = acc.timeframe().ms;
    let mut old_reader = match previous {
        Some(companion) if path.exists() => {
            let c = companion.clone();
            Some(CandleBinReader::open(path, companion.clone(), move || Ok(c.clone()))?)
        }
        _ => None,
    };

    let mut writer = CandleBinWriter::create(path)?;
    let mut slot = start_ts;
    while slot < end_ts {
        let candle = if let Some(c) = acc.get(slot) {
            *c
        } else if let Some((reader, companion)) = old_reader
            .as_mut()
            .and_then(|r| previous.map(|c| (r, c)))
        {
            if slot >= companion.start_ts && slot < companion.end_ts {
                let idx = (slot - companion.start_ts) / tf_ms;
                reader.read_range(idx, idx)?[0]
            } else {
                Candle::default()
            }
        } else {
            Candle::default()
        };
        writer.push(&candle)?;
        slot += tf_ms;
    }
    writer.finish()
}
