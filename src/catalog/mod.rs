//! Catalog store.
//!
//! SQLite-backed tables the pipeline runs on: `roots` (archive mount points),
//! `files` (classified trade logs), `registry` (materialised market/timeframe
//! ranges) and `events` (parse/gap anomaly ranges with their fix lifecycle).
//! Writers batch in explicit transactions; readers never observe a partial
//! batch (WAL).

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::models::{EventKind, GapFixStatus, MarketKey};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS roots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS files (
    root_id INTEGER NOT NULL,
    relative_path TEXT NOT NULL,
    collector TEXT NOT NULL,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    ext TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (root_id, relative_path)
);

CREATE INDEX IF NOT EXISTS idx_files_exchange_symbol ON files(exchange, symbol);
CREATE INDEX IF NOT EXISTS idx_files_start_ts ON files(start_ts);
CREATE INDEX IF NOT EXISTS idx_files_collector ON files(collector);

CREATE TABLE IF NOT EXISTS registry (
    collector TEXT NOT NULL,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (collector, exchange, symbol, timeframe)
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_id INTEGER NOT NULL,
    relative_path TEXT NOT NULL,
    collector TEXT NOT NULL,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    event_type TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    gap_ms INTEGER,
    gap_miss INTEGER,
    gap_end_ts INTEGER,
    gap_fix_status TEXT,
    gap_fix_error TEXT,
    gap_fix_recovered INTEGER,
    gap_fix_updated_at INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_events_fix_scan
    ON events(event_type, gap_fix_status, collector, exchange, symbol, root_id, relative_path, id);
"#;

// Columns older catalogs may be missing; added in place at startup.
const EVENT_MIGRATION_COLUMNS: &[(&str, &str)] = &[
    ("gap_miss", "INTEGER"),
    ("gap_end_ts", "INTEGER"),
    ("gap_fix_status", "TEXT"),
    ("gap_fix_error", "TEXT"),
    ("gap_fix_recovered", "INTEGER"),
    ("gap_fix_updated_at", "INTEGER"),
];

/// One classified archive file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRow {
    pub root_id: i64,
    pub relative_path: String,
    pub collector: String,
    pub exchange: String,
    pub symbol: String,
    pub start_ts: i64,
    pub ext: String,
}

impl FileRow {
    pub fn market(&self) -> MarketKey {
        MarketKey::new(&self.collector, &self.exchange, &self.symbol)
    }
}

/// One materialised `(market, timeframe)` range.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRow {
    pub collector: String,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub updated_at: i64,
}

/// An anomaly range ready for insertion (id not yet assigned).
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub start_line: i64,
    pub end_line: i64,
    pub gap_ms: Option<i64>,
    pub gap_miss: Option<i64>,
    pub gap_end_ts: Option<i64>,
}

/// A stored event row.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub id: i64,
    pub root_id: i64,
    pub relative_path: String,
    pub collector: String,
    pub exchange: String,
    pub symbol: String,
    pub kind: EventKind,
    pub start_line: i64,
    pub end_line: i64,
    pub gap_ms: Option<i64>,
    pub gap_miss: Option<i64>,
    pub gap_end_ts: Option<i64>,
    pub fix_status: Option<GapFixStatus>,
    pub fix_error: Option<String>,
    pub fix_recovered: Option<i64>,
}

/// Filters shared by the event and market queries.
#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub collector: Option<String>,
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub id: Option<i64>,
}

#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("open catalog {}", db_path.display()))?;
        let catalog = Self::init(conn)?;
        info!(path = %db_path.display(), "catalog opened");
        Ok(catalog)
    }

    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("apply catalog schema")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---------------------------------------------------------------------
    // roots & files
    // ---------------------------------------------------------------------

    /// Register an archive root, returning its id.
    pub fn ensure_root(&self, path: &Path) -> Result<i64> {
        let canonical = path.to_string_lossy().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO roots (path) VALUES (?1) ON CONFLICT(path) DO NOTHING",
            params![canonical],
        )?;
        let id = conn.query_row(
            "SELECT id FROM roots WHERE path = ?1",
            params![canonical],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn root_path(&self, root_id: i64) -> Result<PathBuf> {
        let conn = self.conn.lock();
        let path: String = conn
            .query_row(
                "SELECT path FROM roots WHERE id = ?1",
                params![root_id],
                |row| row.get(0),
            )
            .with_context(|| format!("unknown root {root_id}"))?;
        Ok(PathBuf::from(path))
    }

    /// Insert or replace classified files in one transaction.
    pub fn upsert_files(&self, rows: &[FileRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let mut count = 0usize;
        {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO files (root_id, relative_path, collector, exchange, symbol, start_ts, ext)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(root_id, relative_path) DO UPDATE SET
                    collector = excluded.collector,
                    exchange = excluded.exchange,
                    symbol = excluded.symbol,
                    start_ts = excluded.start_ts,
                    ext = excluded.ext
                "#,
            )?;
            for row in rows {
                stmt.execute(params![
                    row.root_id,
                    row.relative_path,
                    row.collector,
                    row.exchange,
                    row.symbol,
                    row.start_ts,
                    row.ext,
                ])?;
                count += 1;
            }
        }
        conn.execute("COMMIT", [])?;
        Ok(count)
    }

    /// Files of one market ordered by `(start_ts, relative_path)`.
    pub fn files_for_market(&self, market: &MarketKey) -> Result<Vec<FileRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT root_id, relative_path, collector, exchange, symbol, start_ts, ext
            FROM files
            WHERE collector = ?1 AND exchange = ?2 AND symbol = ?3
            ORDER BY start_ts ASC, relative_path ASC
            "#,
        )?;
        let rows = stmt
            .query_map(
                params![market.collector, market.exchange, market.symbol],
                file_row_from,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct market keys matching the filter.
    pub fn market_keys(&self, filter: &MarketFilter) -> Result<Vec<MarketKey>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT DISTINCT collector, exchange, symbol FROM files WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        push_market_filter(&mut sql, &mut args, filter);
        sql.push_str(" ORDER BY collector, exchange, symbol");
        let mut stmt = conn.prepare(&sql)?;
        let keys = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Ok(MarketKey {
                    collector: row.get(0)?,
                    exchange: row.get(1)?,
                    symbol: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    // ---------------------------------------------------------------------
    // registry
    // ---------------------------------------------------------------------

    pub fn upsert_registry(
        &self,
        market: &MarketKey,
        timeframe: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO registry (collector, exchange, symbol, timeframe, start_ts, end_ts, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(collector, exchange, symbol, timeframe) DO UPDATE SET
                start_ts = excluded.start_ts,
                end_ts = excluded.end_ts,
                updated_at = excluded.updated_at
            "#,
            params![
                market.collector,
                market.exchange,
                market.symbol,
                timeframe,
                start_ts,
                end_ts,
                now_secs(),
            ],
        )?;
        Ok(())
    }

    pub fn registry_range(&self, market: &MarketKey, timeframe: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT start_ts, end_ts FROM registry
            WHERE collector = ?1 AND exchange = ?2 AND symbol = ?3 AND timeframe = ?4
            "#,
        )?;
        let range = stmt
            .query_row(
                params![market.collector, market.exchange, market.symbol, timeframe],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(ignore_no_rows)?;
        Ok(range)
    }

    pub fn registry_rows(&self, filter: &MarketFilter) -> Result<Vec<RegistryRow>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT collector, exchange, symbol, timeframe, start_ts, end_ts, updated_at \
             FROM registry WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        push_market_filter(&mut sql, &mut args, filter);
        sql.push_str(" ORDER BY collector, exchange, symbol, timeframe");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Ok(RegistryRow {
                    collector: row.get(0)?,
                    exchange: row.get(1)?,
                    symbol: row.get(2)?,
                    timeframe: row.get(3)?,
                    start_ts: row.get(4)?,
                    end_ts: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---------------------------------------------------------------------
    // events
    // ---------------------------------------------------------------------

    /// Persist the events of one processed file in a single transaction.
    pub fn insert_events(&self, file: &FileRow, events: &[NewEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let mut count = 0usize;
        {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO events (
                    root_id, relative_path, collector, exchange, symbol,
                    event_type, start_line, end_line, gap_ms, gap_miss, gap_end_ts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;
            for e in events {
                stmt.execute(params![
                    file.root_id,
                    file.relative_path,
                    file.collector,
                    file.exchange,
                    file.symbol,
                    e.kind.as_str(),
                    e.start_line,
                    e.end_line,
                    e.gap_ms,
                    e.gap_miss,
                    e.gap_end_ts,
                ])?;
                count += 1;
            }
        }
        conn.execute("COMMIT", [])?;
        Ok(count)
    }

    /// Drop previous events of one file (used before reprocessing it).
    pub fn delete_events_for_file(&self, root_id: i64, relative_path: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM events WHERE root_id = ?1 AND relative_path = ?2",
            params![root_id, relative_path],
        )?;
        Ok(n)
    }

    /// Gap events eligible for fixing, in `(root_id, relative_path,
    /// start_line, id)` order. Unvisited rows (`gap_fix_status IS NULL`) are
    /// always selected; `retry` adds rows already in the given states.
    pub fn gap_events(
        &self,
        filter: &MarketFilter,
        retry: &[GapFixStatus],
    ) -> Result<Vec<EventRow>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            r#"
            SELECT id, root_id, relative_path, collector, exchange, symbol,
                   event_type, start_line, end_line, gap_ms, gap_miss, gap_end_ts,
                   gap_fix_status, gap_fix_error, gap_fix_recovered
            FROM events
            WHERE event_type = 'gap'
            "#,
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if !retry.is_empty() {
            let placeholders: Vec<String> = retry
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 1))
                .collect();
            for status in retry {
                args.push(Box::new(status.as_str().to_string()));
            }
            sql.push_str(&format!(
                " AND (gap_fix_status IS NULL OR gap_fix_status IN ({}))",
                placeholders.join(", ")
            ));
        } else {
            sql.push_str(" AND gap_fix_status IS NULL");
        }
        push_market_filter(&mut sql, &mut args, filter);
        if let Some(id) = filter.id {
            args.push(Box::new(id));
            sql.push_str(&format!(" AND id = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY root_id, relative_path, start_line, id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), event_row_from)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Update one event's fix lifecycle in place.
    pub fn update_event_fix(
        &self,
        id: i64,
        status: GapFixStatus,
        error: Option<&str>,
        recovered: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE events SET
                gap_fix_status = ?2,
                gap_fix_error = ?3,
                gap_fix_recovered = ?4,
                gap_fix_updated_at = ?5
            WHERE id = ?1
            "#,
            params![id, status.as_str(), error, recovered, now_secs()],
        )?;
        Ok(())
    }

    /// Events of any kind intersecting `[start_ts, end_ts]`, the query the
    /// timeline consumers issue. Gap rows match on their recorded end
    /// timestamp; parse rows match on their file's start.
    pub fn events_in_range(
        &self,
        filter: &MarketFilter,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<EventRow>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            r#"
            SELECT e.id, e.root_id, e.relative_path, e.collector, e.exchange, e.symbol,
                   e.event_type, e.start_line, e.end_line, e.gap_ms, e.gap_miss, e.gap_end_ts,
                   e.gap_fix_status, e.gap_fix_error, e.gap_fix_recovered
            FROM events e
            JOIN files f ON f.root_id = e.root_id AND f.relative_path = e.relative_path
            WHERE COALESCE(e.gap_end_ts, f.start_ts) BETWEEN ?1 AND ?2
            "#,
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(start_ts), Box::new(end_ts)];
        if let Some(c) = &filter.collector {
            args.push(Box::new(c.to_uppercase()));
            sql.push_str(&format!(" AND e.collector = ?{}", args.len()));
        }
        if let Some(ex) = &filter.exchange {
            args.push(Box::new(ex.to_uppercase()));
            sql.push_str(&format!(" AND e.exchange = ?{}", args.len()));
        }
        if let Some(s) = &filter.symbol {
            args.push(Box::new(s.clone()));
            sql.push_str(&format!(" AND e.symbol = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY e.root_id, e.relative_path, e.start_line, e.id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), event_row_from)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All events of one file (diagnostics and tests).
    pub fn events_for_file(&self, root_id: i64, relative_path: &str) -> Result<Vec<EventRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT id, root_id, relative_path, collector, exchange, symbol,
                   event_type, start_line, end_line, gap_ms, gap_miss, gap_end_ts,
                   gap_fix_status, gap_fix_error, gap_fix_recovered
            FROM events
            WHERE root_id = ?1 AND relative_path = ?2
            ORDER BY start_line, id
            "#,
        )?;
        let rows = stmt
            .query_map(params![root_id, relative_path], event_row_from)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn file_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        root_id: row.get(0)?,
        relative_path: row.get(1)?,
        collector: row.get(2)?,
        exchange: row.get(3)?,
        symbol: row.get(4)?,
        start_ts: row.get(5)?,
        ext: row.get(6)?,
    })
}

fn event_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    let kind_str: String = row.get(6)?;
    let status_str: Option<String> = row.get(12)?;
    Ok(EventRow {
        id: row.get(0)?,
        root_id: row.get(1)?,
        relative_path: row.get(2)?,
        collector: row.get(3)?,
        exchange: row.get(4)?,
        symbol: row.get(5)?,
        kind: EventKind::from_str(&kind_str).unwrap_or(EventKind::Gap),
        start_line: row.get(7)?,
        end_line: row.get(8)?,
        gap_ms: row.get(9)?,
        gap_miss: row.get(10)?,
        gap_end_ts: row.get(11)?,
        fix_status: status_str.as_deref().and_then(GapFixStatus::from_str),
        fix_error: row.get(13)?,
        fix_recovered: row.get(14)?,
    })
}

fn push_market_filter(
    sql: &mut String,
    args: &mut Vec<Box<dyn rusqlite::ToSql>>,
    filter: &MarketFilter,
) {
    if let Some(c) = &filter.collector {
        args.push(Box::new(c.to_uppercase()));
        sql.push_str(&format!(" AND collector = ?{}", args.len()));
    }
    if let Some(e) = &filter.exchange {
        args.push(Box::new(e.to_uppercase()));
        sql.push_str(&format!(" AND exchange = ?{}", args.len()));
    }
    if let Some(s) = &filter.symbol {
        args.push(Box::new(s.clone()));
        sql.push_str(&format!(" AND symbol = ?{}", args.len()));
    }
}

fn ignore_no_rows<T>(err: rusqlite::Error) -> Result<Option<T>, rusqlite::Error> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Bring an older catalog up to the current schema, then verify the `files`
/// NULL invariants. A violation is fatal: the archive must be re-indexed.
fn migrate(conn: &Connection) -> Result<()> {
    let columns_of = |table: &str| -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("SELECT name FROM pragma_table_info('{table}')"))?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cols)
    };

    let existing = columns_of("events")?;
    for (name, ty) in EVENT_MIGRATION_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            debug!(column = name, "migrating events table");
            conn.execute(&format!("ALTER TABLE events ADD COLUMN {name} {ty}"), [])?;
        }
    }

    let existing = columns_of("files")?;
    for (name, decl) in [("ext", "TEXT NOT NULL DEFAULT ''"), ("created_at", "INTEGER")] {
        if !existing.iter().any(|c| c == name) {
            debug!(column = name, "migrating files table");
            conn.execute(&format!("ALTER TABLE files ADD COLUMN {name} {decl}"), [])?;
        }
    }

    let nulls: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM files
        WHERE collector IS NULL OR exchange IS NULL OR symbol IS NULL OR start_ts IS NULL
        "#,
        [],
        |row| row.get(0),
    )?;
    if nulls > 0 {
        warn!(rows = nulls, "files table violates NULL invariants");
        bail!("catalog migration failed: {nulls} files rows have NULL identity columns");
    }
    Ok(())
}
