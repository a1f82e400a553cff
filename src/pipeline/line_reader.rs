//! Line stream over an archive file, with transparent gunzip for `.gz`
//! paths. Yields `(line_number, line)` with numbering starting at 1, the
//! same numbering event rows carry.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

pub struct LineReader {
    inner: BufReader<Box<dyn Read + Send>>,
    path: PathBuf,
    line_no: u64,
    buf: String,
}

impl LineReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let reader: Box<dyn Read + Send> = if is_gzip(path) {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(Self {
            inner: BufReader::new(reader),
            path: path.to_path_buf(),
            line_no: 0,
            buf: String::new(),
        })
    }

    /// Restart the stream from line 1.
    pub fn restart(&self) -> Result<Self> {
        Self::open(&self.path)
    }

    pub fn line_no(&self) -> u64 {
        self.line_no
    }
}

impl Iterator for LineReader {
    type Item = Result<(u64, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.inner.read_line(&mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                self.line_no += 1;
                let line = self.buf.trim_end_matches(['\n', '\r']).to_string();
                Some(Ok((self.line_no, line)))
            }
            Err(e) => Some(Err(e).with_context(|| {
                format!("read {} line {}", self.path.display(), self.line_no + 1)
            })),
        }
    }
}

pub fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("gz")
}
