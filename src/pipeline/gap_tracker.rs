//! Adaptive inter-trade gap detector.
//!
//! Keeps an exponentially-weighted average of the inter-trade span per
//! market and flags spans that exceed what a stream with that density
//! should statistically produce. Bursts of same-timestamp trades are
//! averaged into one effective delta so they do not drag the baseline to
//! zero; deltas are capped at 8x the baseline so one outage does not
//! poison the average.

use serde::{Deserialize, Serialize};

use crate::models::Trade;

const MAX_SAMPLES: u32 = 1_000_000;
const WINDOW_FACTOR: f64 = 64.0;
const DELTA_CAP_FACTOR: f64 = 8.0;

/// A detected abnormal span, ending at the trade that exposed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapSignal {
    pub gap_ms: i64,
    /// Expected number of trades the span swallowed.
    pub gap_miss: i64,
    pub gap_end_ts: i64,
}

/// Serialisable tracker state, for resume snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapTrackerState {
    pub last_trade_ts: Option<i64>,
    pub avg_gap_ms: f64,
    pub samples: u32,
    pub same_ts_count: u32,
}

#[derive(Debug)]
pub struct GapTracker {
    timeframe_ms: i64,
    state: GapTrackerState,
}

impl GapTracker {
    pub fn new(timeframe_ms: i64) -> Self {
        Self {
            timeframe_ms,
            state: GapTrackerState::default(),
        }
    }

    pub fn resume(timeframe_ms: i64, state: GapTrackerState) -> Self {
        Self {
            timeframe_ms,
            state,
        }
    }

    pub fn snapshot(&self) -> GapTrackerState {
        self.state.clone()
    }

    pub fn avg_gap_ms(&self) -> f64 {
        self.state.avg_gap_ms
    }

    /// Feed one trade, in file order. Liquidation rows are ignored.
    pub fn observe(&mut self, trade: &Trade) -> Option<GapSignal> {
        if trade.liquidation {
            return None;
        }
        let ts = trade.ts;
        let s = &mut self.state;

        let Some(last) = s.last_trade_ts else {
            s.last_trade_ts = Some(ts);
            return None;
        };

        let span = ts - last;
        if span < 0 {
            s.same_ts_count = 0;
            return None;
        }
        if span == 0 {
            s.same_ts_count += 1;
            return None;
        }

        let effective_delta = span as f64 / (s.same_ts_count + 1) as f64;
        s.same_ts_count = 0;
        s.last_trade_ts = Some(ts);

        let baseline = s.avg_gap_ms;
        let window = (self.timeframe_ms as f64).max(baseline * WINDOW_FACTOR);

        let mut signal = None;
        if s.samples >= 2 && baseline > 0.0 {
            let expected_count = window / baseline;
            let log_n = expected_count.ln().max(1.0);
            let expected_max = baseline * log_n * log_n;
            if span as f64 > expected_max {
                signal = Some(GapSignal {
                    gap_ms: span,
                    gap_miss: ((span as f64 / baseline).floor() as i64 - 1).max(0),
                    gap_end_ts: ts,
                });
            }
        }

        if s.samples == 0 {
            s.avg_gap_ms = effective_delta;
        } else {
            let capped = effective_delta.min(baseline * DELTA_CAP_FACTOR);
            let alpha = capped / (window + capped);
            s.avg_gap_ms += (capped - baseline) * alpha;
        }
        s.samples = (s.samples + 1).min(MAX_SAMPLES);

        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn trade(ts: i64) -> Trade {
        Trade {
            ts,
            price: 100.0,
            size: 1.0,
            side: Side::Buy,
            liquidation: false,
        }
    }

    fn liq(ts: i64) -> Trade {
        Trade {
            liquidation: true,
            ..trade(ts)
        }
    }

    /// Steady 1 s cadence, then a 2 minute hole.
    #[test]
    fn test_detects_large_gap_after_steady_stream() {
        let mut tracker = GapTracker::new(60_000);
        let mut ts = 1_704_067_200_000;
        for _ in 0..100 {
            assert_eq!(tracker.observe(&trade(ts)), None);
            ts += 1_000;
        }
        let gap_end = ts + 120_000;
        let signal = tracker.observe(&trade(gap_end)).expect("gap expected");
        assert_eq!(signal.gap_end_ts, gap_end);
        assert_eq!(signal.gap_ms, 121_000);
        // baseline ~1s, so roughly 120 trades went missing
        assert!(signal.gap_miss >= 100, "gap_miss = {}", signal.gap_miss);
    }

    #[test]
    fn test_no_detection_before_two_samples() {
        let mut tracker = GapTracker::new(60_000);
        assert_eq!(tracker.observe(&trade(1_000)), None);
        // first span seeds the average, no baseline yet
        assert_eq!(tracker.observe(&trade(2_000)), None);
        // huge span with a single sample stays silent
        assert_eq!(tracker.observe(&trade(10_000_000)), None);
    }

    #[test]
    fn test_same_ts_burst_averages_delta() {
        let mut tracker = GapTracker::new(60_000);
        tracker.observe(&trade(1_000));
        for _ in 0..4 {
            tracker.observe(&trade(2_000));
        }
        // 3 same-ts repeats pending, next 800ms span spreads over 4 trades
        tracker.observe(&trade(2_800));
        // seeded at 1000, then pulled toward 200
        assert!(tracker.avg_gap_ms() < 1_000.0);
    }

    #[test]
    fn test_negative_span_skipped() {
        let mut tracker = GapTracker::new(60_000);
        tracker.observe(&trade(5_000));
        tracker.observe(&trade(6_000));
        let before = tracker.snapshot();
        assert_eq!(tracker.observe(&trade(4_000)), None);
        let after = tracker.snapshot();
        assert_eq!(before.avg_gap_ms, after.avg_gap_ms);
        assert_eq!(before.last_trade_ts, after.last_trade_ts);
    }

    #[test]
    fn test_liquidations_ignored() {
        let mut tracker = GapTracker::new(60_000);
        let mut ts = 1_000;
        for _ in 0..50 {
            tracker.observe(&trade(ts));
            ts += 1_000;
        }
        // a liquidation after a huge hole must not fire or move state
        let before = tracker.snapshot();
        assert_eq!(tracker.observe(&liq(ts + 10_000_000)), None);
        assert_eq!(tracker.snapshot(), before);
    }

    #[test]
    fn test_delta_cap_limits_baseline_growth() {
        let mut tracker = GapTracker::new(60_000);
        tracker.observe(&trade(0));
        tracker.observe(&trade(1_000)); // seeds avg = 1000
        let seeded = tracker.avg_gap_ms();
        tracker.observe(&trade(100_000_000)); // enormous span, capped at 8x
        let capped_max = seeded * DELTA_CAP_FACTOR;
        assert!(tracker.avg_gap_ms() <= capped_max);
    }

    #[test]
    fn test_snapshot_resume_round_trip() {
        let mut tracker = GapTracker::new(60_000);
        for i in 0..10 {
            tracker.observe(&trade(i * 1_000));
        }
        let snap = tracker.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let restored: GapTrackerState = serde_json::from_str(&json).unwrap();
        let mut resumed = GapTracker::resume(60_000, restored);

        let next = trade(11_000);
        assert_eq!(tracker.observe(&next), resumed.observe(&next));
        assert_eq!(tracker.snapshot(), resumed.snapshot());
    }
}
