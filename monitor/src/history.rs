//! SQLite session history

use crate::error::{MonitorError, Result};
use crate::session::Row;
use crate::sink::Sink;
use chrono::{DateTime, Local};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub struct Database {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: i64,
    pub label: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub row_count: u64,
}

impl Database {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn open_default() -> rusqlite::Result<Self> {
        Self::open(&Self::default_path())
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "trainwatch")
            .map(|dirs| dirs.data_dir().join("history.db"))
            .unwrap_or_else(|| PathBuf::from("history.db"))
    }

    pub fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(include_str!("../schema.sql"))
    }

    fn now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    pub fn begin_session(&self, label: &str) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO sessions (label, started_at) VALUES (?1, ?2)",
            params![label, Self::now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_rows(&self, session_id: i64, rows: &[Row]) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO session_rows (session_id, timestamp, cpu_percent, ram_mb, source) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    session_id,
                    row.timestamp.timestamp(),
                    row.cpu_percent,
                    row.ram_mb,
                    row.source
                ])?;
            }
        }
        tx.execute(
            "UPDATE sessions SET row_count = row_count + ?1 WHERE id = ?2",
            params![rows.len() as i64, session_id],
        )?;
        tx.commit()
    }

    pub fn finish_session(&self, session_id: i64) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE sessions SET finished_at = ?1 WHERE id = ?2",
            params![Self::now(), session_id],
        )?;
        Ok(())
    }

    pub fn list_sessions(&self, limit: u32) -> rusqlite::Result<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, label, started_at, finished_at, row_count
             FROM sessions ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], Self::map_session)?;
        rows.collect()
    }

    pub fn get_session(&self, session_id: i64) -> rusqlite::Result<Option<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, label, started_at, finished_at, row_count FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![session_id], Self::map_session)?;
        let record = rows.next().transpose()?;
        Ok(record)
    }

    fn map_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            id: row.get(0)?,
            label: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            row_count: row.get::<_, i64>(4)?.max(0) as u64,
        })
    }

    pub fn session_rows(&self, session_id: i64) -> rusqlite::Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, cpu_percent, ram_mb, source
             FROM session_rows WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let ts: i64 = row.get(0)?;
            let timestamp = DateTime::from_timestamp(ts, 0)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ts))?
                .with_timezone(&Local);
            Ok(Row {
                timestamp,
                cpu_percent: row.get(1)?,
                ram_mb: row.get(2)?,
                source: row.get(3)?,
            })
        })?;
        rows.collect()
    }

    pub fn cleanup_old_sessions(&self, days: u32) -> rusqlite::Result<usize> {
        let cutoff = Self::now() - (days as i64 * 86400);
        self.conn.execute("DELETE FROM sessions WHERE started_at < ?1", params![cutoff])
    }
}

/// Records every delivered batch into the history database.
pub struct HistorySink {
    db: Database,
    session_id: Option<i64>,
}

impl HistorySink {
    pub fn new(db: Database) -> Self {
        Self { db, session_id: None }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl Sink for HistorySink {
    fn announce_target(&mut self, label: &str) {
        match self.db.begin_session(label) {
            Ok(id) => self.session_id = Some(id),
            Err(e) => {
                warn!("Failed to record session start: {}", e);
                self.session_id = None;
            }
        }
    }

    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()> {
        let Some(session_id) = self.session_id else {
            return Err(MonitorError::Export("no history session open".into()));
        };
        let result = self.db.insert_rows(session_id, rows).and_then(|_| {
            if is_final {
                self.db.finish_session(session_id)
            } else {
                Ok(())
            }
        });
        if is_final {
            self.session_id = None;
        }
        result.map_err(|e| MonitorError::Export(format!("history: {}", e)))
    }
}
