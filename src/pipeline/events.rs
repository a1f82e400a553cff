//! Event accumulator: coalesces per-line anomalies into line-range records
//! before they hit the catalog. Adjacent lines of the same kind extend the
//! open range; anything else flushes it. Gap ranges keep the worst span
//! seen and the timestamp that ended it.

use std::collections::HashMap;

use crate::catalog::NewEvent;
use crate::models::EventKind;
use crate::pipeline::gap_tracker::GapSignal;

#[derive(Debug, Clone)]
struct OpenRange {
    start_line: i64,
    end_line: i64,
    gap_ms: Option<i64>,
    gap_miss: Option<i64>,
    gap_end_ts: Option<i64>,
}

#[derive(Debug, Default)]
pub struct EventAccumulator {
    open: HashMap<EventKind, OpenRange>,
    flushed: Vec<NewEvent>,
}

impl EventAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parse rejection at `line`.
    pub fn reject(&mut self, kind: EventKind, line: i64) {
        self.observe(kind, line, None);
    }

    /// Record a detected gap ending at `line`.
    pub fn gap(&mut self, line: i64, signal: GapSignal) {
        self.observe(EventKind::Gap, line, Some(signal));
    }

    fn observe(&mut self, kind: EventKind, line: i64, signal: Option<GapSignal>) {
        let mut extended = false;
        if let Some(range) = self.open.get_mut(&kind) {
            if line == range.end_line + 1 {
                range.end_line = line;
                if let Some(sig) = signal {
                    if range.gap_ms.map_or(true, |worst| sig.gap_ms > worst) {
                        range.gap_ms = Some(sig.gap_ms);
                        range.gap_miss = Some(sig.gap_miss);
                        range.gap_end_ts = Some(sig.gap_end_ts);
                    }
                }
                extended = true;
            }
        }
        if !extended {
            self.flush(kind);
            self.open_range(kind, line, signal);
        }
    }

    fn open_range(&mut self, kind: EventKind, line: i64, signal: Option<GapSignal>) {
        self.open.insert(
            kind,
            OpenRange {
                start_line: line,
                end_line: line,
                gap_ms: signal.map(|s| s.gap_ms),
                gap_miss: signal.map(|s| s.gap_miss),
                gap_end_ts: signal.map(|s| s.gap_end_ts),
            },
        );
    }

    fn flush(&mut self, kind: EventKind) {
        if let Some(range) = self.open.remove(&kind) {
            self.flushed.push(NewEvent {
                kind,
                start_line: range.start_line,
                end_line: range.end_line,
                gap_ms: range.gap_ms,
                gap_miss: range.gap_miss,
                gap_end_ts: range.gap_end_ts,
            });
        }
    }

    /// Flush open ranges and drain everything, in line order.
    pub fn finish(&mut self) -> Vec<NewEvent> {
        let kinds: Vec<EventKind> = self.open.keys().copied().collect();
        for kind in kinds {
            self.flush(kind);
        }
        let mut out = std::mem::take(&mut self.flushed);
        out.sort_by_key(|e| (e.start_line, e.end_line));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(gap_ms: i64, gap_end_ts: i64) -> GapSignal {
        GapSignal {
            gap_ms,
            gap_miss: gap_ms / 1_000 - 1,
            gap_end_ts,
        }
    }

    #[test]
    fn test_adjacent_lines_coalesce() {
        let mut acc = EventAccumulator::new();
        acc.reject(EventKind::PartsShort, 3);
        acc.reject(EventKind::PartsShort, 4);
        acc.reject(EventKind::PartsShort, 5);
        let events = acc.finish();
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].start_line, events[0].end_line), (3, 5));
    }

    #[test]
    fn test_non_adjacent_lines_split() {
        let mut acc = EventAccumulator::new();
        acc.reject(EventKind::PartsShort, 3);
        acc.reject(EventKind::PartsShort, 7);
        let events = acc.finish();
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].start_line, events[0].end_line), (3, 3));
        assert_eq!((events[1].start_line, events[1].end_line), (7, 7));
    }

    #[test]
    fn test_kinds_tracked_independently() {
        let mut acc = EventAccumulator::new();
        acc.reject(EventKind::PartsShort, 3);
        acc.reject(EventKind::NonFinite, 4);
        acc.reject(EventKind::PartsShort, 4);
        let events = acc.finish();
        // parts_short covers 3-4, non_finite covers 4-4
        assert_eq!(events.len(), 2);
        let parts = events
            .iter()
            .find(|e| e.kind == EventKind::PartsShort)
            .unwrap();
        assert_eq!((parts.start_line, parts.end_line), (3, 4));
    }

    #[test]
    fn test_gap_range_keeps_worst_span() {
        let mut acc = EventAccumulator::new();
        acc.gap(10, signal(60_000, 1_000_000));
        acc.gap(11, signal(180_000, 2_000_000));
        acc.gap(12, signal(90_000, 3_000_000));
        let events = acc.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].gap_ms, Some(180_000));
        assert_eq!(events[0].gap_end_ts, Some(2_000_000));
        assert_eq!(events[0].gap_miss, Some(179));
    }

    #[test]
    fn test_finish_emits_in_line_order() {
        let mut acc = EventAccumulator::new();
        acc.gap(20, signal(60_000, 1_000_000));
        acc.reject(EventKind::PartsShort, 3);
        acc.reject(EventKind::NonFinite, 10);
        let events = acc.finish();
        let starts: Vec<_> = events.iter().map(|e| e.start_line).collect();
        assert_eq!(starts, vec![3, 10, 20]);
    }

    #[test]
    fn test_finish_drains() {
        let mut acc = EventAccumulator::new();
        acc.reject(EventKind::PartsShort, 1);
        assert_eq!(acc.finish().len(), 1);
        assert!(acc.finish().is_empty());
    }
}
