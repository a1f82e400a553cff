//! Candlestore: converts a collector-organised archive of per-exchange
//! trade logs into a queryable, time-partitioned candle store, detects
//! abnormal inter-trade gaps while folding, and heals them by refetching
//! missing trades from upstream venues, patching both the raw logs and the
//! derived candle binaries.

pub mod catalog;
pub mod codec;
pub mod fixgaps;
pub mod indexer;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod resample;
pub mod store;

pub use catalog::{Catalog, MarketFilter};
pub use models::{Config, DebugFlags, MarketKey, Side, Timeframe, Trade};
