//! Trade merger: inserts recovered trades into a source file in timestamp
//! order, deduplicated against the file and against each other by exact
//! `(ts, price, size, side)` key. The rewrite is a single streaming pass
//! into a temp file (gzip back when the source is gzipped) finished by an
//! atomic rename; non-trade lines are carried over as a trailing block. A
//! non-monotonic source aborts before anything is written.

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::{RecoveredTrade, Side, TradeKey};
use crate::pipeline::line_reader::{is_gzip, LineReader};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub inserted_trades: Vec<RecoveredTrade>,
    pub inserted_min_ts: i64,
    pub inserted_max_ts: i64,
}

/// Merge `recovered` (sorted ascending) into the file at `path`. Returns
/// `None` when every candidate is already present.
pub fn merge_trades(path: &Path, recovered: &[RecoveredTrade]) -> Result<Option<MergeOutcome>> {
    // pass 1: existing keys + monotonicity check
    let existing = scan_existing_keys(path)?;

    let mut seen: HashSet<TradeKey> = HashSet::with_capacity(recovered.len());
    let mut fresh: Vec<&RecoveredTrade> = Vec::new();
    for trade in recovered {
        let key = trade.key();
        if existing.contains(&key) || !seen.insert(key) {
            continue;
        }
        fresh.push(trade);
    }
    if fresh.is_empty() {
        debug!(path = %path.display(), "no new trades to merge");
        return Ok(None);
    }

    // pass 2: streaming insertion into a temp file
    let tmp_path = temp_path(path);
    write_merged(path, &tmp_path, &fresh).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp_path);
    })?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename merged file into {}", path.display()))?;

    let outcome = MergeOutcome {
        inserted: fresh.len(),
        inserted_min_ts: fresh.first().unwrap().ts,
        inserted_max_ts: fresh.last().unwrap().ts,
        inserted_trades: fresh.into_iter().cloned().collect(),
    };
    info!(
        path = %path.display(),
        inserted = outcome.inserted,
        "recovered trades merged"
    );
    Ok(Some(outcome))
}

/// Raw key parse of an archive line; corrections deliberately not applied so
/// keys match the venue-side values recovered trades carry.
fn parse_raw_key(line: &str) -> Option<(i64, TradeKey)> {
    let mut parts = line.split_whitespace();
    let ts: i64 = parts.next()?.parse().ok()?;
    let price: f64 = parts.next()?.parse().ok()?;
    let size: f64 = parts.next()?.parse().ok()?;
    let side_bit = parts.next()?;
    if ts <= 0 || !price.is_finite() || !size.is_finite() {
        return None;
    }
    let side = Side::from_bit(u8::from(side_bit != "0"));
    Some((
        ts,
        TradeKey {
            ts,
            price_bits: price.to_bits(),
            size_bits: size.to_bits(),
            side,
        },
    ))
}

fn scan_existing_keys(path: &Path) -> Result<HashSet<TradeKey>> {
    let mut keys = HashSet::new();
    let mut last_ts = i64::MIN;
    for item in LineReader::open(path)? {
        let (line_no, line) = item?;
        if let Some((ts, key)) = parse_raw_key(&line) {
            if ts < last_ts {
                bail!(
                    "{} is not timestamp-monotonic at line {line_no}, refusing to merge",
                    path.display()
                );
            }
            last_ts = ts;
            keys.insert(key);
        }
    }
    Ok(keys)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".merge.tmp");
    path.with_file_name(name)
}

fn write_merged(path: &Path, tmp_path: &Path, fresh: &[&RecoveredTrade]) -> Result<()> {
    let out = File::create(tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    let mut sink: Box<dyn Write> = if is_gzip(path) {
        Box::new(GzEncoder::new(BufWriter::new(out), Compression::default()))
    } else {
        Box::new(BufWriter::new(out))
    };

    let mut pending = fresh.iter().peekable();
    let mut invalid_lines: Vec<String> = Vec::new();

    for item in LineReader::open(path)? {
        let (_, line) = item?;
        if line.is_empty() {
            continue;
        }
        match parse_raw_key(&line) {
            Some((ts, _)) => {
                while let Some(next) = pending.peek() {
                    if next.ts < ts {
                        writeln!(sink, "{}", next.to_line())?;
                        pending.next();
                    } else {
                        break;
                    }
                }
                writeln!(sink, "{line}")?;
            }
            None => invalid_lines.push(line),
        }
    }
    for trade in pending {
        writeln!(sink, "{}", trade.to_line())?;
    }
    // non-trade lines survive as a trailing block
    for line in invalid_lines {
        writeln!(sink, "{line}")?;
    }
    sink.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn write_plain(lines: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01-01");
        std::fs::write(&path, lines.join("\n")).unwrap();
        (dir, path)
    }

    fn read_lines(path: &Path) -> Vec<String> {
        LineReader::open(path)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect()
    }

    fn recovered(ts: i64, price: &str, size: &str) -> RecoveredTrade {
        RecoveredTrade::with_text(ts, Side::Buy, price, size).unwrap()
    }

    /// Seed scenario: one trade lands between the two existing lines.
    #[test]
    fn test_insert_in_middle() {
        let (_dir, path) = write_plain(&[
            "1704067200000 100 1 1 0",
            "1704067320000 102 1 0 0",
        ]);
        let outcome = merge_trades(&path, &[recovered(1_704_067_260_000, "101", "1")])
            .unwrap()
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.inserted_min_ts, 1_704_067_260_000);
        assert_eq!(outcome.inserted_max_ts, 1_704_067_260_000);
        assert_eq!(
            read_lines(&path),
            vec![
                "1704067200000 100 1 1 0",
                "1704067260000 101 1 0 0",
                "1704067320000 102 1 0 0",
            ]
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (_dir, path) = write_plain(&[
            "1704067200000 100 1 1 0",
            "1704067320000 102 1 0 0",
        ]);
        let trades = [recovered(1_704_067_260_000, "101", "1")];
        merge_trades(&path, &trades).unwrap().unwrap();
        let after_first = read_lines(&path);
        // second merge finds everything present
        assert!(merge_trades(&path, &trades).unwrap().is_none());
        assert_eq!(read_lines(&path), after_first);
    }

    #[test]
    fn test_duplicate_keys_within_recovered_deduped() {
        let (_dir, path) = write_plain(&["1704067200000 100 1 1 0"]);
        let trades = [
            recovered(1_704_067_260_000, "101", "1"),
            recovered(1_704_067_260_000, "101", "1"),
        ];
        let outcome = merge_trades(&path, &trades).unwrap().unwrap();
        assert_eq!(outcome.inserted, 1);
    }

    #[test]
    fn test_output_is_monotonic_with_head_and_tail_inserts() {
        let (_dir, path) = write_plain(&["1704067260000 101 1 1 0"]);
        let trades = [
            recovered(1_704_067_200_000, "100", "1"),
            recovered(1_704_067_320_000, "102", "1"),
        ];
        merge_trades(&path, &trades).unwrap().unwrap();
        let lines = read_lines(&path);
        let ts: Vec<i64> = lines
            .iter()
            .map(|l| l.split_whitespace().next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(
            ts,
            vec![1_704_067_200_000, 1_704_067_260_000, 1_704_067_320_000]
        );
    }

    #[test]
    fn test_invalid_lines_preserved_as_trailing_block() {
        let (_dir, path) = write_plain(&[
            "1704067200000 100 1 1 0",
            "corrupted line",
            "1704067320000 102 1 0 0",
        ]);
        merge_trades(&path, &[recovered(1_704_067_260_000, "101", "1")])
            .unwrap()
            .unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "corrupted line");
    }

    #[test]
    fn test_non_monotonic_source_aborts_without_writes() {
        let (_dir, path) = write_plain(&[
            "1704067320000 102 1 0 0",
            "1704067200000 100 1 1 0",
        ]);
        let before = read_lines(&path);
        assert!(merge_trades(&path, &[recovered(1_704_067_260_000, "101", "1")]).is_err());
        assert_eq!(read_lines(&path), before);
    }

    #[test]
    fn test_gzip_round_trip() {
        use flate2::write::GzEncoder;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01-01.gz");
        let mut enc =
            GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"1704067200000 100 1 1 0\n1704067320000 102 1 0 0\n")
            .unwrap();
        enc.finish().unwrap();

        merge_trades(&path, &[recovered(1_704_067_260_000, "101", "1")])
            .unwrap()
            .unwrap();
        // file stayed gzipped and readable
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "1704067260000 101 1 0 0");
    }

    #[test]
    fn test_equal_ts_keeps_existing_first() {
        let (_dir, path) = write_plain(&["1704067200000 100 1 1 0"]);
        // same ts, different price: a genuine new trade
        merge_trades(&path, &[recovered(1_704_067_200_000, "100.5", "1")])
            .unwrap()
            .unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines[0], "1704067200000 100 1 1 0");
        assert_eq!(lines[1], "1704067200000 100.5 1 0 0");
    }
}
