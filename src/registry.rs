//! Registry maintenance: rebuild catalog registry rows from the companion
//! descriptors on disk, for when the database is recreated or drifted from
//! the output tree.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::catalog::Catalog;
use crate::models::MarketKey;
use crate::store::companion::list_companions;

/// Walk `<outputRoot>/<COLLECTOR>/<EXCHANGE>/<symbol>` and upsert a registry
/// row per companion found. Returns how many rows were written.
pub fn sync_from_disk(catalog: &Catalog, output_root: &Path) -> Result<usize> {
    let mut rows = 0usize;
    for collector in subdirs(output_root)? {
        for exchange in subdirs(&collector)? {
            for symbol in subdirs(&exchange)? {
                let market = MarketKey::new(
                    name_of(&collector),
                    name_of(&exchange),
                    name_of(&symbol),
                );
                for (tf, companion) in list_companions(output_root, &market)? {
                    catalog.upsert_registry(
                        &market,
                        &tf.label,
                        companion.start_ts,
                        companion.end_ts,
                    )?;
                    rows += 1;
                }
            }
        }
    }
    info!(rows, root = %output_root.display(), "registry synced from disk");
    Ok(rows)
}

fn subdirs(path: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(path) {
        Ok(e) => e,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MarketFilter;
    use crate::models::Timeframe;
    use crate::store::companion::{companion_path, market_dir, Companion};

    #[test]
    fn test_sync_from_disk_upserts_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        for label in ["1m", "5m"] {
            let tf = Timeframe::parse(label).unwrap();
            std::fs::create_dir_all(market_dir(tmp.path(), &market)).unwrap();
            Companion::new(&market, &tf, 0, tf.ms * 4)
                .save(&companion_path(tmp.path(), &market, &tf))
                .unwrap();
        }

        let catalog = Catalog::open_memory().unwrap();
        assert_eq!(sync_from_disk(&catalog, tmp.path()).unwrap(), 2);
        let rows = catalog.registry_rows(&MarketFilter::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timeframe, "1m");
        assert_eq!(rows[0].end_ts, 240_000);
    }

    #[test]
    fn test_sync_empty_root() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open_memory().unwrap();
        assert_eq!(sync_from_disk(&catalog, tmp.path()).unwrap(), 0);
    }
}
