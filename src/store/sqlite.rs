use std::path::Path;

use rusqlite::{Connection, Row, params};

use super::{Event, HistoryRecord, RetentionReport, RowCounts, Sink, StoreError};
use crate::format::bytes_to_mb;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS process_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp REAL NOT NULL,
    datetime TEXT NOT NULL,
    pid INTEGER NOT NULL,
    name TEXT NOT NULL,
    username TEXT,
    status TEXT,
    memory_rss INTEGER,
    memory_percent REAL,
    cpu_percent REAL
);
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp REAL NOT NULL,
    datetime TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_process_snapshots_pid ON process_snapshots(pid);
CREATE INDEX IF NOT EXISTS idx_process_snapshots_timestamp ON process_snapshots(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
";

/// Indexed SQLite-backed sink.
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteSink { conn })
    }
}

fn history_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let memory_rss: i64 = row.get(6)?;
    let memory_rss = u64::try_from(memory_rss).unwrap_or(0);
    Ok(HistoryRecord {
        timestamp: row.get(0)?,
        datetime: row.get(1)?,
        pid: row.get(2)?,
        name: row.get(3)?,
        username: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        status: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        memory_rss,
        memory_rss_mb: bytes_to_mb(memory_rss),
        memory_percent: row.get(7)?,
        cpu_percent: row.get(8)?,
    })
}

impl Sink for SqliteSink {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn append_samples(&mut self, rows: &[HistoryRecord]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO process_snapshots (
                    timestamp, datetime, pid, name, username, status,
                    memory_rss, memory_percent, cpu_percent
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.timestamp,
                    row.datetime,
                    row.pid,
                    row.name,
                    row.username,
                    row.status,
                    i64::try_from(row.memory_rss).unwrap_or(i64::MAX),
                    row.memory_percent,
                    row.cpu_percent,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn append_event(&mut self, event: &Event) -> Result<(), StoreError> {
        let data = serde_json::to_string(&event.payload)?;
        self.conn.execute(
            "INSERT INTO events (timestamp, datetime, event_type, data) VALUES (?1, ?2, ?3, ?4)",
            params![event.timestamp, event.datetime, event.event_type, data],
        )?;
        Ok(())
    }

    fn history(&mut self, pid: u32, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, datetime, pid, name, username, status,
                    memory_rss, memory_percent, cpu_percent
             FROM process_snapshots
             WHERE pid = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![pid, limit], history_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn events(&mut self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, datetime, event_type, data
             FROM events
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raw = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(timestamp, datetime, event_type, data)| -> Result<Event, StoreError> {
                Ok(Event {
                    timestamp,
                    datetime,
                    event_type,
                    payload: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    fn enforce_retention(
        &mut self,
        cutoff: f64,
        max_rows: usize,
    ) -> Result<RetentionReport, StoreError> {
        let max_rows = i64::try_from(max_rows).unwrap_or(i64::MAX);
        let tx = self.conn.transaction()?;
        let expired_samples = tx.execute(
            "DELETE FROM process_snapshots WHERE timestamp < ?1",
            params![cutoff],
        )?;
        let expired_events = tx.execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff])?;
        let trimmed_samples = tx.execute(
            "DELETE FROM process_snapshots WHERE id NOT IN (
                SELECT id FROM process_snapshots ORDER BY timestamp DESC, id DESC LIMIT ?1
            )",
            params![max_rows],
        )?;
        let trimmed_events = tx.execute(
            "DELETE FROM events WHERE id NOT IN (
                SELECT id FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1
            )",
            params![max_rows],
        )?;
        tx.commit()?;

        // VACUUM cannot run inside a transaction.
        self.conn.execute_batch("VACUUM")?;

        Ok(RetentionReport {
            expired_samples,
            expired_events,
            trimmed_samples,
            trimmed_events,
        })
    }

    fn row_counts(&mut self) -> Result<RowCounts, StoreError> {
        let samples: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM process_snapshots", [], |row| row.get(0))?;
        let events: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(RowCounts {
            samples: usize::try_from(samples).unwrap_or(0),
            events: usize::try_from(events).unwrap_or(0),
        })
    }
}
