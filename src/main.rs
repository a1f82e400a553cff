//! Candlestore CLI: index an archive, process markets into candle
//! binaries, run the gap-fix pipeline, maintain the registry, or
//! materialise a timeframe on demand.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use candlestore::catalog::{Catalog, MarketFilter};
use candlestore::fixgaps::adapters::AdapterRegistry;
use candlestore::fixgaps::fetch::{Fetcher, HostPolicy, ReqwestTransport};
use candlestore::fixgaps::{FixGapsOptions, GapFixer};
use candlestore::indexer::index_archive;
use candlestore::models::{Config, GapFixStatus, MarketKey, Timeframe};
use candlestore::pipeline::{process_markets, ProcessOptions};
use candlestore::registry::sync_from_disk;
use candlestore::resample::ensure_timeframe;

#[derive(Parser)]
#[command(name = "candlestore", about = "Trade archive to candle store pipeline")]
struct Cli {
    /// Candle output root (env OUTPUT_ROOT)
    #[arg(long, env = "OUTPUT_ROOT")]
    output_root: Option<PathBuf>,
    /// Catalog database path (env DB_PATH)
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Default)]
struct Filters {
    #[arg(long)]
    collector: Option<String>,
    #[arg(long)]
    exchange: Option<String>,
    #[arg(long)]
    symbol: Option<String>,
}

impl Filters {
    fn to_market_filter(&self) -> MarketFilter {
        MarketFilter {
            collector: self.collector.clone(),
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            id: None,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Walk an archive root and classify its files into the catalog
    Index {
        /// Archive root directory
        root: PathBuf,
    },
    /// Fold trade files into candle binaries
    Process {
        #[command(flatten)]
        filters: Filters,
        /// Target timeframe, e.g. 1m
        #[arg(long, default_value = "1m")]
        timeframe: String,
        /// Rebuild from scratch, ignoring resume cutoffs
        #[arg(long)]
        force: bool,
    },
    /// Fetch missing trades for recorded gaps and patch binaries
    Fixgaps {
        #[command(flatten)]
        filters: Filters,
        /// Restrict to one event id
        #[arg(long)]
        id: Option<i64>,
        /// Also revisit rows in these states (missing_adapter, adapter_error, fixed)
        #[arg(long, value_delimiter = ',')]
        retry: Vec<String>,
        /// Walk and report without fetching or writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show registry rows, or rebuild them from on-disk companions
    Registry {
        #[command(flatten)]
        filters: Filters,
        /// Rebuild rows from companion descriptors
        #[arg(long)]
        sync: bool,
    },
    /// Materialise a coarser timeframe from an existing finer one
    Resample {
        #[command(flatten)]
        filters: Filters,
        /// Timeframe to materialise, e.g. 15m
        #[arg(long)]
        timeframe: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        error!(error = ?e, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(root) = cli.output_root {
        config.output_root = root;
    }
    if let Some(db) = cli.db_path {
        config.db_path = db;
    }

    let catalog = Catalog::open(&config.db_path)?;
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match cli.command {
        Command::Index { root } => {
            let stats = index_archive(&catalog, &root)?;
            info!(indexed = stats.files_indexed, skipped = stats.files_skipped, "index done");
        }
        Command::Process {
            filters,
            timeframe,
            force,
        } => {
            let options = ProcessOptions {
                timeframe: Timeframe::parse(&timeframe)?,
                force,
            };
            let stats = process_markets(
                &catalog,
                &config.output_root,
                &filters.to_market_filter(),
                &options,
                &cancel,
            )?;
            info!(
                processed = stats.markets_processed,
                failed = stats.markets_failed,
                records = stats.records_written,
                events = stats.events,
                "process done"
            );
        }
        Command::Fixgaps {
            filters,
            id,
            retry,
            dry_run,
        } => {
            let retry = retry
                .iter()
                .map(|s| {
                    GapFixStatus::from_str(s)
                        .with_context(|| format!("unknown retry status '{s}'"))
                })
                .collect::<Result<Vec<_>>>()?;
            let mut filter = filters.to_market_filter();
            filter.id = id;

            let fetcher = Arc::new(
                Fetcher::new(Arc::new(ReqwestTransport::new()?), config.debug)
                    .with_policy(
                        "api.kraken.com",
                        HostPolicy {
                            min_interval_ms: 1_100,
                            max_requests_per_minute: Some(50),
                            max_attempts: 6,
                            base_backoff_ms: 1_000,
                            max_backoff_ms: 60_000,
                        },
                    )
                    .with_policy(
                        "data.binance.vision",
                        HostPolicy {
                            min_interval_ms: 350,
                            max_requests_per_minute: None,
                            max_attempts: 4,
                            base_backoff_ms: 500,
                            max_backoff_ms: 30_000,
                        },
                    ),
            );
            let registry = AdapterRegistry::standard(fetcher, &config.work_dir);
            let fixer = GapFixer::new(&catalog, &config.output_root, &registry, config.debug);
            let stats = fixer
                .run(
                    &FixGapsOptions {
                        filter,
                        retry,
                        dry_run,
                    },
                    &cancel,
                )
                .await?;
            info!(
                selected = stats.selected_events,
                fixed = stats.fixed_events,
                missing_adapter = stats.missing_adapter,
                adapter_error = stats.adapter_error,
                recovered = stats.recovered_trades,
                patched = stats.binaries_patched,
                "fixgaps done"
            );
        }
        Command::Registry { filters, sync } => {
            if sync {
                let rows = sync_from_disk(&catalog, &config.output_root)?;
                info!(rows, "registry synced");
            }
            for row in catalog.registry_rows(&filters.to_market_filter())? {
                println!(
                    "{}/{}/{} {} [{} .. {})",
                    row.collector, row.exchange, row.symbol, row.timeframe, row.start_ts, row.end_ts
                );
            }
        }
        Command::Resample { filters, timeframe } => {
            let target = Timeframe::parse(&timeframe)?;
            let markets = catalog.market_keys(&filters.to_market_filter())?;
            for market in markets {
                resample_one(&catalog, &config, &market, &target)?;
            }
        }
    }
    Ok(())
}

fn resample_one(
    catalog: &Catalog,
    config: &Config,
    market: &MarketKey,
    target: &Timeframe,
) -> Result<()> {
    match ensure_timeframe(catalog, &config.output_root, market, target)? {
        Some(companion) => info!(
            market = %market,
            timeframe = %target,
            records = companion.records,
            "timeframe ready"
        ),
        None => info!(market = %market, "no data to resample"),
    }
    Ok(())
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}
