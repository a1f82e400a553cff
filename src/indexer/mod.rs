//! Archive indexer: walks a collector-organised archive and classifies
//! every trade log into a `files` row. Layout is
//! `<root>/<COLLECTOR>/<bucket>/<EXCHANGE>/<symbol>/<yyyy-mm-dd[-hh]>[.gz]`
//! with the date token carrying optional hour granularity.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, FileRow};

/// Bitget dropped its `-SPOT` symbol suffix on 2023-05-01.
const BITGET_SPOT_SUFFIX_CUTOFF: i64 = 1_682_899_200_000;
/// Rows per insert batch.
const BATCH: usize = 512;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub files_indexed: usize,
    pub files_skipped: usize,
}

/// Walk `root` and upsert every classified file into the catalog.
pub fn index_archive(catalog: &Catalog, root: &Path) -> Result<IndexStats> {
    let root_id = catalog.ensure_root(root)?;
    let mut stats = IndexStats::default();
    let mut batch: Vec<FileRow> = Vec::with_capacity(BATCH);

    for collector in subdirs(root)? {
        let collector_name = name_of(&collector).to_uppercase();
        for bucket in subdirs(&collector)? {
            for exchange in subdirs(&bucket)? {
                let exchange_name = name_of(&exchange).to_uppercase();
                for symbol_dir in subdirs(&exchange)? {
                    let raw_symbol = name_of(&symbol_dir).to_string();
                    for entry in std::fs::read_dir(&symbol_dir)
                        .with_context(|| format!("read {}", symbol_dir.display()))?
                    {
                        let path = entry?.path();
                        if !path.is_file() {
                            continue;
                        }
                        let file_name = name_of(&path);
                        let Some((start_ts, ext)) = classify_name(file_name) else {
                            debug!(path = %path.display(), "unclassifiable file name");
                            stats.files_skipped += 1;
                            continue;
                        };
                        let symbol =
                            normalize_symbol(&exchange_name, &raw_symbol, start_ts);
                        let relative_path = path
                            .strip_prefix(root)
                            .with_context(|| format!("{} outside root", path.display()))?
                            .to_string_lossy()
                            .to_string();
                        batch.push(FileRow {
                            root_id,
                            relative_path,
                            collector: collector_name.clone(),
                            exchange: exchange_name.clone(),
                            symbol,
                            start_ts,
                            ext: ext.to_string(),
                        });
                        if batch.len() >= BATCH {
                            stats.files_indexed += catalog.upsert_files(&batch)?;
                            batch.clear();
                        }
                    }
                }
            }
        }
    }
    stats.files_indexed += catalog.upsert_files(&batch)?;

    info!(
        root = %root.display(),
        indexed = stats.files_indexed,
        skipped = stats.files_skipped,
        "archive indexed"
    );
    Ok(stats)
}

fn subdirs(path: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(path) {
        Ok(e) => e,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "archive level missing");
            return Ok(out);
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    for entry in entries {
        let p = entry?.path();
        if p.is_dir() {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

fn name_of(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// `yyyy-mm-dd` or `yyyy-mm-dd-hh`, optionally `.gz`: returns the UTC start
/// of the covered period plus the extension.
pub fn classify_name(file_name: &str) -> Option<(i64, &'static str)> {
    let (token, ext) = match file_name.strip_suffix(".gz") {
        Some(stem) => (stem, "gz"),
        None => (file_name, ""),
    };
    let start_ts = match token.len() {
        10 => token
            .parse::<NaiveDate>()
            .ok()?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
            .timestamp_millis(),
        13 => NaiveDateTime::parse_from_str(&format!("{token}:00:00"), "%Y-%m-%d-%H:%M:%S")
            .ok()?
            .and_utc()
            .timestamp_millis(),
        _ => return None,
    };
    Some((start_ts, ext))
}

/// Exchange-specific symbol quirks.
pub fn normalize_symbol(exchange: &str, symbol: &str, start_ts: i64) -> String {
    match exchange {
        // Poloniex archives order quote before base
        "POLONIEX" => match symbol.split_once('_') {
            Some((quote, base)) => format!("{base}_{quote}"),
            None => symbol.to_string(),
        },
        // Bitget carried a -SPOT suffix until the cutoff; stripping it keeps
        // both eras under one market key
        "BITGET" if start_ts < BITGET_SPOT_SUFFIX_CUTOFF => {
            symbol.strip_suffix("-SPOT").unwrap_or(symbol).to_string()
        }
        _ => symbol.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MarketFilter;
    use crate::models::MarketKey;

    #[test]
    fn test_classify_day_and_hour_tokens() {
        assert_eq!(classify_name("2024-01-01"), Some((1_704_067_200_000, "")));
        assert_eq!(
            classify_name("2024-01-01-05"),
            Some((1_704_085_200_000, ""))
        );
        assert_eq!(
            classify_name("2024-01-01.gz"),
            Some((1_704_067_200_000, "gz"))
        );
        assert_eq!(classify_name("notes.txt"), None);
        assert_eq!(classify_name("2024-13-01"), None);
    }

    #[test]
    fn test_normalize_poloniex_reorders() {
        assert_eq!(normalize_symbol("POLONIEX", "USDT_BTC", 0), "BTC_USDT");
        assert_eq!(normalize_symbol("POLONIEX", "BTCUSDT", 0), "BTCUSDT");
    }

    #[test]
    fn test_normalize_bitget_suffix_cutoff() {
        assert_eq!(
            normalize_symbol("BITGET", "BTCUSDT-SPOT", BITGET_SPOT_SUFFIX_CUTOFF - 1),
            "BTCUSDT"
        );
        // post-cutoff directories never carry the suffix; one that does is
        // left untouched
        assert_eq!(
            normalize_symbol("BITGET", "BTCUSDT-SPOT", BITGET_SPOT_SUFFIX_CUTOFF),
            "BTCUSDT-SPOT"
        );
    }

    #[test]
    fn test_index_walks_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let dir = root.join("ram/0/binance/BTCUSDT");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("2024-01-01"), "x\n").unwrap();
        std::fs::write(dir.join("2024-01-01-06.gz"), "x\n").unwrap();
        std::fs::write(dir.join("README"), "x\n").unwrap();

        let catalog = Catalog::open_memory().unwrap();
        let stats = index_archive(&catalog, root).unwrap();
        assert_eq!(stats.files_indexed, 2);
        assert_eq!(stats.files_skipped, 1);

        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        let files = catalog.files_for_market(&market).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].relative_path, "ram/0/binance/BTCUSDT/2024-01-01");
        assert_eq!(files[1].ext, "gz");
        assert!(files[1].start_ts > files[0].start_ts);

        // reindex is idempotent
        let stats = index_archive(&catalog, root).unwrap();
        assert_eq!(stats.files_indexed, 2);
        assert_eq!(
            catalog.market_keys(&MarketFilter::default()).unwrap().len(),
            1
        );
    }
}
