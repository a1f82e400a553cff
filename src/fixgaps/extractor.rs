//! Gap window extractor: replays a source file once to convert event
//! line-ranges into precise `(from_ts, to_ts)` windows. Events whose lines
//! cannot be resolved fall back to the detector's recorded span; anything
//! still without a window is reported unresolved.

use anyhow::Result;
use std::path::Path;
use tracing::debug;

use crate::catalog::EventRow;
use crate::codec::{parse_line, ParsedLine};
use crate::fixgaps::GapWindow;
use crate::pipeline::LineReader;

#[derive(Debug, Default)]
pub struct ExtractedWindows {
    pub windows: Vec<GapWindow>,
    pub unresolved: Vec<i64>,
}

/// Replay `path` against `events` (sorted by `start_line`).
pub fn extract_windows(path: &Path, exchange: &str, events: &[EventRow]) -> Result<ExtractedWindows> {
    let mut out = ExtractedWindows::default();
    if events.is_empty() {
        return Ok(out);
    }

    let mut resolved = vec![false; events.len()];
    let mut cursor = 0usize;
    let mut last_valid_ts: Option<i64> = None;

    for item in LineReader::open(path)? {
        let (line_no, line) = item?;
        let line_no = line_no as i64;

        // drop events whose range has passed
        while cursor < events.len() && events[cursor].end_line < line_no {
            cursor += 1;
        }
        if cursor >= events.len() {
            break;
        }

        let trade = match parse_line(exchange, &line) {
            ParsedLine::Trade(t) if !t.liquidation => Some(t),
            _ => None,
        };

        if let Some(trade) = &trade {
            if let Some(last) = last_valid_ts {
                if trade.ts > last {
                    for (idx, event) in events.iter().enumerate().skip(cursor) {
                        if event.start_line > line_no {
                            break;
                        }
                        if line_no <= event.end_line && !resolved[idx] {
                            out.windows.push(GapWindow {
                                event_id: event.id,
                                from_ts: last,
                                to_ts: trade.ts,
                            });
                            resolved[idx] = true;
                        }
                    }
                }
            }
            last_valid_ts = Some(trade.ts);
        }
    }

    // detector-recorded span as fallback
    for (idx, event) in events.iter().enumerate() {
        if resolved[idx] {
            continue;
        }
        match (event.gap_end_ts, event.gap_ms) {
            (Some(end), Some(ms)) if ms > 0 => {
                out.windows.push(GapWindow {
                    event_id: event.id,
                    from_ts: end - ms,
                    to_ts: end,
                });
            }
            _ => out.unresolved.push(event.id),
        }
    }

    out.windows.sort_by_key(|w| (w.from_ts, w.to_ts, w.event_id));
    debug!(
        path = %path.display(),
        windows = out.windows.len(),
        unresolved = out.unresolved.len(),
        "windows extracted"
    );
    Ok(out)
}
