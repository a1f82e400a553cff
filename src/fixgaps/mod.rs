//! Gap-fix pipeline: walks the event queue, groups gap events by source
//! file, extracts precise windows, dispatches the exchange's recovery
//! adapter, merges recovered trades back into the source file and patches
//! every derived candle binary. Failures are per-group: one broken file
//! never stops the queue, it just leaves its rows marked with a sanitised
//! error.

pub mod adapters;
pub mod extractor;
pub mod fetch;
pub mod merger;
pub mod patcher;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, EventRow, MarketFilter};
use crate::models::{DebugFlags, GapFixStatus, MarketKey, RecoveredTrade};
use adapters::{AdapterRegistry, RecoveryRequest};
use extractor::extract_windows;
use merger::merge_trades;
use patcher::patch_binaries;

/// Error kinds a recovery attempt can end in. Everything here becomes a row
/// status plus sanitised text; only cancellation propagates.
#[derive(Debug, Error)]
pub enum FixError {
    #[error("no adapter registered for exchange")]
    MissingAdapter,
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("bad payload: {0}")]
    BadPayload(String),
    #[error("cancelled")]
    Cancelled,
}

/// A precise interval to refill. Open on both ends: recovered trades must
/// satisfy `from_ts < ts < to_ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapWindow {
    pub event_id: i64,
    pub from_ts: i64,
    pub to_ts: i64,
}

/// Row-status text: single line, bounded length.
pub fn sanitize_error(message: &str) -> String {
    let mut out: String = message
        .replace(['\n', '\r'], " ")
        .trim()
        .chars()
        .take(300)
        .collect();
    out.shrink_to_fit();
    out
}

#[derive(Debug, Clone, Default)]
pub struct FixGapsOptions {
    pub filter: MarketFilter,
    /// Additional statuses to revisit (unvisited rows are always selected).
    pub retry: Vec<GapFixStatus>,
    /// Walk and report without fetching, merging or patching.
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FixGapsStats {
    pub selected_events: usize,
    pub processed_files: usize,
    pub recovered_trades: usize,
    pub fixed_events: usize,
    pub deleted_events: usize,
    pub missing_adapter: usize,
    pub adapter_error: usize,
    pub binaries_patched: usize,
}

pub struct GapFixer<'a> {
    catalog: &'a Catalog,
    output_root: &'a Path,
    registry: &'a AdapterRegistry,
    debug: DebugFlags,
}

impl<'a> GapFixer<'a> {
    pub fn new(
        catalog: &'a Catalog,
        output_root: &'a Path,
        registry: &'a AdapterRegistry,
        debug: DebugFlags,
    ) -> Self {
        Self {
            catalog,
            output_root,
            registry,
            debug,
        }
    }

    pub async fn run(
        &self,
        options: &FixGapsOptions,
        cancel: &CancellationToken,
    ) -> Result<FixGapsStats> {
        let rows = self.catalog.gap_events(&options.filter, &options.retry)?;
        let mut stats = FixGapsStats {
            selected_events: rows.len(),
            ..Default::default()
        };
        info!(events = rows.len(), dry_run = options.dry_run, "gap fix started");

        for group in group_by_file(&rows) {
            if cancel.is_cancelled() {
                warn!("gap fix cancelled");
                break;
            }
            self.progress(&format!(
                "fixgaps {}/{} ({} events)",
                group[0].exchange,
                group[0].relative_path,
                group.len()
            ));
            // groups share one source file; serial processing keeps a single
            // writer per file and per binary
            self.fix_group(group, options, cancel, &mut stats).await?;
            stats.processed_files += 1;
        }
        self.progress_done();

        info!(
            fixed = stats.fixed_events,
            missing_adapter = stats.missing_adapter,
            adapter_error = stats.adapter_error,
            recovered = stats.recovered_trades,
            patched = stats.binaries_patched,
            "gap fix finished"
        );
        Ok(stats)
    }

    async fn fix_group(
        &self,
        group: &[EventRow],
        options: &FixGapsOptions,
        cancel: &CancellationToken,
        stats: &mut FixGapsStats,
    ) -> Result<()> {
        let first = &group[0];
        let market = MarketKey::new(&first.collector, &first.exchange, &first.symbol);

        let root = self.catalog.root_path(first.root_id)?;
        let source = root.join(&first.relative_path);
        if !source.exists() {
            // stale queue entry: the archive file is gone, so are its events
            self.catalog
                .delete_events_for_file(first.root_id, &first.relative_path)?;
            stats.deleted_events += group.len();
            warn!(path = %source.display(), "source file missing, events deleted");
            return Ok(());
        }

        let Some(adapter) = self.registry.get(&first.exchange) else {
            for row in group {
                self.catalog.update_event_fix(
                    row.id,
                    GapFixStatus::MissingAdapter,
                    None,
                    None,
                )?;
            }
            stats.missing_adapter += group.len();
            debug!(exchange = %first.exchange, "no recovery adapter");
            return Ok(());
        };

        let extracted = match extract_windows(&source, &first.exchange, group) {
            Ok(e) => e,
            Err(e) => {
                self.mark_group_error(group, &e.to_string(), stats)?;
                return Ok(());
            }
        };
        for event_id in &extracted.unresolved {
            self.catalog.update_event_fix(
                *event_id,
                GapFixStatus::AdapterError,
                Some("Unable to resolve event lines"),
                None,
            )?;
            stats.adapter_error += 1;
        }
        if extracted.windows.is_empty() {
            return Ok(());
        }

        if options.dry_run {
            info!(
                path = %source.display(),
                windows = extracted.windows.len(),
                "dry run, skipping recovery"
            );
            return Ok(());
        }

        let request = RecoveryRequest {
            exchange: first.exchange.clone(),
            symbol: first.symbol.clone(),
            windows: extracted.windows.clone(),
        };
        let recovered = match adapter.recover(&request, cancel).await {
            Ok(trades) => trades,
            Err(FixError::Cancelled) => return Err(FixError::Cancelled.into()),
            Err(e) => {
                self.mark_windowed_error(&extracted.windows, &e.to_string(), stats)?;
                return Ok(());
            }
        };
        if self.debug.adapters {
            debug!(adapter = adapter.name(), trades = recovered.len(), "adapter returned");
        }
        stats.recovered_trades += recovered.len();

        let merged = match merge_trades(&source, &recovered) {
            Ok(m) => m,
            Err(e) => {
                self.mark_windowed_error(&extracted.windows, &e.to_string(), stats)?;
                return Ok(());
            }
        };

        if let Some(outcome) = &merged {
            match patch_binaries(
                self.catalog,
                self.output_root,
                &market,
                &source,
                outcome.inserted_min_ts,
                outcome.inserted_max_ts,
            ) {
                Ok(patched) => stats.binaries_patched += patched,
                Err(e) => {
                    self.mark_windowed_error(&extracted.windows, &e.to_string(), stats)?;
                    return Ok(());
                }
            }
        }

        let per_event = count_per_window(&recovered, &extracted.windows);
        for window in &extracted.windows {
            let count = per_event.get(&window.event_id).copied().unwrap_or(0);
            self.catalog
                .update_event_fix(window.event_id, GapFixStatus::Fixed, None, Some(count))?;
            stats.fixed_events += 1;
        }
        Ok(())
    }

    fn mark_group_error(
        &self,
        group: &[EventRow],
        message: &str,
        stats: &mut FixGapsStats,
    ) -> Result<()> {
        let text = sanitize_error(message);
        for row in group {
            self.catalog
                .update_event_fix(row.id, GapFixStatus::AdapterError, Some(&text), None)
                .context("record group failure")?;
            stats.adapter_error += 1;
        }
        warn!(error = %text, "gap-fix group failed");
        Ok(())
    }

    fn mark_windowed_error(
        &self,
        windows: &[GapWindow],
        message: &str,
        stats: &mut FixGapsStats,
    ) -> Result<()> {
        let text = sanitize_error(message);
        for window in windows {
            self.catalog
                .update_event_fix(window.event_id, GapFixStatus::AdapterError, Some(&text), None)
                .context("record window failure")?;
            stats.adapter_error += 1;
        }
        warn!(error = %text, "gap-fix group failed");
        Ok(())
    }

    fn progress(&self, message: &str) {
        if self.debug.progress {
            eprint!("\r{message:<100}");
        }
    }

    fn progress_done(&self) {
        if self.debug.progress {
            eprint!("\r{:<100}\r", "");
        }
    }
}

/// Consecutive rows sharing `(root_id, relative_path)` form one group; the
/// query already orders rows that way.
fn group_by_file(rows: &[EventRow]) -> Vec<&[EventRow]> {
    let mut groups = Vec::new();
    let mut start = 0usize;
    for i in 1..=rows.len() {
        let boundary = i == rows.len()
            || rows[i].root_id != rows[start].root_id
            || rows[i].relative_path != rows[start].relative_path;
        if boundary {
            groups.push(&rows[start..i]);
            start = i;
        }
    }
    groups
}

/// Per-event recovered-trade counts: one walk of the sorted trades over the
/// sorted windows.
fn count_per_window(trades: &[RecoveredTrade], windows: &[GapWindow]) -> HashMap<i64, i64> {
    let mut counts: HashMap<i64, i64> = HashMap::new();
    for window in windows {
        let start = trades.partition_point(|t| t.ts <= window.from_ts);
        let mut count = 0i64;
        for trade in &trades[start..] {
            if trade.ts >= window.to_ts {
                break;
            }
            count += 1;
        }
        counts.insert(window.event_id, count);
    }
    counts
}
