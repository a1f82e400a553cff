//! Ingestion pipeline: line streaming, trade folding, gap detection, event
//! coalescing and the per-market processor that ties them together.

pub mod accumulator;
pub mod events;
pub mod gap_tracker;
pub mod line_reader;
pub mod processor;

pub use accumulator::CandleAccumulator;
pub use events::EventAccumulator;
pub use gap_tracker::{GapSignal, GapTracker, GapTrackerState};
pub use line_reader::LineReader;
pub use processor::{process_market, process_markets, ProcessOptions, ProcessStats};
