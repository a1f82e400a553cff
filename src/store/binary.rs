//! Dense candle binary writer/reader.
//!
//! The writer stages the whole file at a temp path, flushing in batches of
//! 4096 records, and only renames over the target after a clean finish. The
//! reader tolerates a stale companion by comparing the expected byte length
//! against the file and re-reading the descriptor once on mismatch.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::store::companion::Companion;
use crate::store::{Candle, CANDLE_SIZE};

/// Candles buffered between flushes.
const WRITE_BATCH: usize = 4096;

pub struct CandleBinWriter {
    out: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    buffered: usize,
    written: u64,
    finished: bool,
}

impl CandleBinWriter {
    /// Start writing a fresh binary; the target is untouched until `finish`.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("bin.tmp");
        let file = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        Ok(Self {
            out: BufWriter::with_capacity(WRITE_BATCH * CANDLE_SIZE, file),
            tmp_path,
            final_path: path.to_path_buf(),
            buffered: 0,
            written: 0,
            finished: false,
        })
    }

    pub fn push(&mut self, candle: &Candle) -> Result<()> {
        self.out.write_all(&candle.to_bytes())?;
        self.written += 1;
        self.buffered += 1;
        if self.buffered >= WRITE_BATCH {
            self.out.flush()?;
            self.buffered = 0;
        }
        Ok(())
    }

    /// Records written so far.
    pub fn records(&self) -> u64 {
        self.written
    }

    /// Flush and atomically move the temp file over the target.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        std::fs::rename(&self.tmp_path, &self.final_path)
            .with_context(|| format!("rename into {}", self.final_path.display()))?;
        self.finished = true;
        Ok(self.written)
    }
}

impl Drop for CandleBinWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Append candles to an existing binary (resampler extension path).
pub fn append_candles(path: &Path, candles: &[Candle]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))?;
    let mut buf = Vec::with_capacity(candles.len().min(WRITE_BATCH) * CANDLE_SIZE);
    for chunk in candles.chunks(WRITE_BATCH) {
        buf.clear();
        for c in chunk {
            buf.extend_from_slice(&c.to_bytes());
        }
        file.write_all(&buf)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Overwrite `candles.len()` records starting at `first_idx` in place.
pub fn overwrite_range(path: &Path, first_idx: i64, candles: &[Candle]) -> Result<()> {
    if candles.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {} for patch", path.display()))?;
    let len = file.metadata()?.len();
    let offset = first_idx as u64 * CANDLE_SIZE as u64;
    let end = offset + candles.len() as u64 * CANDLE_SIZE as u64;
    if first_idx < 0 || end > len {
        bail!(
            "patch range [{offset}, {end}) outside binary {} (len {len})",
            path.display()
        );
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(candles.len() * CANDLE_SIZE);
    for c in candles {
        buf.extend_from_slice(&c.to_bytes());
    }
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// A candle decoded to floating point via the companion's scales.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedCandle {
    pub slot_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub buy_vol: f64,
    pub sell_vol: f64,
    pub buy_count: u32,
    pub sell_count: u32,
    pub liq_buy: f64,
    pub liq_sell: f64,
    pub gap: bool,
}

pub struct CandleBinReader {
    file: File,
    companion: Companion,
}

impl CandleBinReader {
    /// Open a binary against its companion. A length mismatch means the
    /// companion was read mid-commit; the caller supplies `reload` to fetch
    /// a fresh descriptor, after which a second mismatch is an error.
    pub fn open(
        bin_path: &Path,
        companion: Companion,
        reload: impl Fn() -> Result<Companion>,
    ) -> Result<Self> {
        let file = File::open(bin_path)
            .with_context(|| format!("open {}", bin_path.display()))?;
        let len = file.metadata()?.len();
        let companion = if len == companion.expected_bin_len() {
            companion
        } else {
            let fresh = reload()?;
            if len != fresh.expected_bin_len() {
                bail!(
                    "binary {} is {} bytes, companion says {}",
                    bin_path.display(),
                    len,
                    fresh.expected_bin_len()
                );
            }
            fresh
        };
        Ok(Self { file, companion })
    }

    pub fn companion(&self) -> &Companion {
        &self.companion
    }

    pub fn records(&self) -> i64 {
        self.companion.records
    }

    /// Read raw candles for the inclusive index range.
    pub fn read_range(&mut self, first_idx: i64, last_idx: i64) -> Result<Vec<Candle>> {
        if first_idx < 0 || last_idx >= self.companion.records || first_idx > last_idx {
            bail!(
                "index range [{first_idx}, {last_idx}] outside 0..{}",
                self.companion.records
            );
        }
        let count = (last_idx - first_idx + 1) as usize;
        let mut buf = vec![0u8; count * CANDLE_SIZE];
        self.file
            .seek(SeekFrom::Start(first_idx as u64 * CANDLE_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        let mut out = Vec::with_capacity(count);
        for chunk in buf.chunks_exact(CANDLE_SIZE) {
            out.push(Candle::from_bytes(chunk.try_into().unwrap()));
        }
        Ok(out)
    }

    /// Read and decode the inclusive index range to floating point.
    pub fn read_decoded(&mut self, first_idx: i64, last_idx: i64) -> Result<Vec<DecodedCandle>> {
        let raw = self.read_range(first_idx, last_idx)?;
        let c = &self.companion;
        Ok(raw
            .into_iter()
            .enumerate()
            .map(|(i, candle)| DecodedCandle {
                slot_ts: c.start_ts + (first_idx + i as i64) * c.timeframe_ms,
                open: candle.open as f64 / c.price_scale,
                high: candle.high as f64 / c.price_scale,
                low: candle.low as f64 / c.price_scale,
                close: candle.close as f64 / c.price_scale,
                buy_vol: candle.buy_vol as f64 / c.volume_scale,
                sell_vol: candle.sell_vol as f64 / c.volume_scale,
                buy_count: candle.buy_count,
                sell_count: candle.sell_count,
                liq_buy: candle.liq_buy as f64 / c.volume_scale,
                liq_sell: candle.liq_sell as f64 / c.volume_scale,
                gap: candle.is_gap(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketKey, Side, Timeframe};

    fn write_bin(path: &Path, candles: &[Candle]) {
        let mut w = CandleBinWriter::create(path).unwrap();
        for c in candles {
            w.push(c).unwrap();
        }
        w.finish().unwrap();
    }

    fn candle(price: i32) -> Candle {
        let mut c = Candle::default();
        c.apply_trade(price, 100, Side::Buy);
        c
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1m.bin");
        let candles = vec![candle(10), Candle::default(), candle(30)];
        write_bin(&path, &candles);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 56);

        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        let tf = Timeframe::parse("1m").unwrap();
        let companion = Companion::new(&market, &tf, 0, 180_000);
        let mut reader =
            CandleBinReader::open(&path, companion, || panic!("no reload needed")).unwrap();
        assert_eq!(reader.read_range(0, 2).unwrap(), candles);
        assert_eq!(reader.read_range(1, 1).unwrap(), vec![Candle::default()]);
    }

    #[test]
    fn test_decoded_scales_and_gap_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1m.bin");
        write_bin(&path, &[candle(500_000_000), Candle::default()]);

        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        let tf = Timeframe::parse("1m").unwrap();
        let companion = Companion::new(&market, &tf, 60_000, 180_000);
        let mut reader = CandleBinReader::open(&path, companion, || unreachable!()).unwrap();
        let decoded = reader.read_decoded(0, 1).unwrap();
        assert_eq!(decoded[0].open, 50_000.0);
        assert_eq!(decoded[0].slot_ts, 60_000);
        assert!(!decoded[0].gap);
        assert!(decoded[1].gap);
        assert_eq!(decoded[1].slot_ts, 120_000);
    }

    #[test]
    fn test_stale_companion_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1m.bin");
        write_bin(&path, &[candle(1), candle(2)]);

        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        let tf = Timeframe::parse("1m").unwrap();
        let stale = Companion::new(&market, &tf, 0, 60_000); // says 1 record
        let fresh = Companion::new(&market, &tf, 0, 120_000); // matches file
        let reader = CandleBinReader::open(&path, stale, || Ok(fresh.clone())).unwrap();
        assert_eq!(reader.records(), 2);
    }

    #[test]
    fn test_overwrite_range_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1m.bin");
        write_bin(&path, &[candle(1), candle(2), candle(3)]);

        overwrite_range(&path, 1, &[candle(99)]).unwrap();

        let market = MarketKey::new("RAM", "BINANCE", "BTCUSDT");
        let tf = Timeframe::parse("1m").unwrap();
        let companion = Companion::new(&market, &tf, 0, 180_000);
        let mut reader = CandleBinReader::open(&path, companion, || unreachable!()).unwrap();
        let got = reader.read_range(0, 2).unwrap();
        assert_eq!(got[0], candle(1));
        assert_eq!(got[1], candle(99));
        assert_eq!(got[2], candle(3));
    }

    #[test]
    fn test_overwrite_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1m.bin");
        write_bin(&path, &[candle(1)]);
        assert!(overwrite_range(&path, 1, &[candle(2)]).is_err());
    }

    #[test]
    fn test_unfinished_writer_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1m.bin");
        {
            let mut w = CandleBinWriter::create(&path).unwrap();
            w.push(&candle(1)).unwrap();
            // dropped without finish
        }
        assert!(!path.exists());
        assert!(!path.with_extension("bin.tmp").exists());
    }

    #[test]
    fn test_append_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("5m.bin");
        write_bin(&path, &[candle(1)]);
        append_candles(&path, &[candle(2), candle(3)]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 56);
    }
}
