//! rollcall-store — SQLite-backed attendance log.
//!
//! One row per `(label, date)`. The UNIQUE constraint backs up the
//! check-then-append in `rollcall_core::persist`, so two writers racing on the
//! same person and day still leave a single row.

use chrono::{NaiveDate, NaiveTime};
use rollcall_core::{AttendanceRecord, AttendanceStore};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    date  TEXT NOT NULL,
    time  TEXT NOT NULL,
    UNIQUE(label, date)
);
CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance(date);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid {field} value in database: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

/// Per-person attendance totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSummary {
    pub label: String,
    pub days: u64,
    pub first: NaiveDate,
    pub last: NaiveDate,
}

pub struct SqliteAttendanceStore {
    conn: Connection,
}

impl SqliteAttendanceStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!("attendance schema ready");
        Ok(Self { conn })
    }

    /// Number of people recorded on `date`.
    pub fn count_on(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE date = ?1",
            params![date.format(DATE_FORMAT).to_string()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Days attended per person, alphabetically.
    pub fn summary(&self) -> Result<Vec<LabelSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT label, COUNT(*), MIN(date), MAX(date)
             FROM attendance GROUP BY label ORDER BY label",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (label, days, first, last) = row?;
            out.push(LabelSummary {
                label,
                days: days.max(0) as u64,
                first: parse_date(&first)?,
                last: parse_date(&last)?,
            });
        }
        Ok(out)
    }
}

impl AttendanceStore for SqliteAttendanceStore {
    type Error = StoreError;

    fn contains(&self, label: &str, date: NaiveDate) -> Result<bool, Self::Error> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM attendance WHERE label = ?1 AND date = ?2",
                params![label, date.format(DATE_FORMAT).to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<(), Self::Error> {
        let inserted = self.conn.execute(
            "INSERT INTO attendance (label, date, time) VALUES (?1, ?2, ?3)
             ON CONFLICT(label, date) DO NOTHING",
            params![
                record.label,
                record.date.format(DATE_FORMAT).to_string(),
                record.time.format(TIME_FORMAT).to_string()
            ],
        )?;
        if inserted == 0 {
            tracing::debug!(label = %record.label, date = %record.date, "attendance row already present");
        }
        Ok(())
    }

    fn list(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceRecord>, Self::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT label, date, time FROM attendance
             WHERE ?1 IS NULL OR date = ?1
             ORDER BY date DESC, time DESC, label",
        )?;
        let filter = date.map(|d| d.format(DATE_FORMAT).to_string());
        let rows = stmt.query_map(params![filter], raw_row)?;

        let mut out = Vec::new();
        for row in rows {
            let (label, date, time) = row?;
            out.push(AttendanceRecord {
                label,
                date: parse_date(&date)?,
                time: NaiveTime::parse_from_str(&time, TIME_FORMAT).map_err(|_| {
                    StoreError::InvalidValue {
                        field: "time",
                        value: time.clone(),
                    }
                })?,
            });
        }
        Ok(out)
    }
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| StoreError::InvalidValue {
        field: "date",
        value: value.to_string(),
    })
}
