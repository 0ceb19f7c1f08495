//! Append-only attendance ledger backed by SQLite.

use crate::types::{AttendanceEvent, SummaryRow};
use chrono::{Local, NaiveDateTime, Timelike};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

/// Timestamp column format (local time).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS attendance (
    name TEXT,
    timestamp TEXT
)";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ledger I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger row has unparseable timestamp {0:?}")]
    BadTimestamp(String),
}

pub struct AttendanceLedger {
    conn: Connection,
    /// Latest stamp issued by [`record_now`](Self::record_now).
    last_stamp: Option<NaiveDateTime>,
}

impl AttendanceLedger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "attendance ledger opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            last_stamp: None,
        })
    }

    /// Append one event.
    pub fn record(&self, label: &str, timestamp: NaiveDateTime) -> Result<(), LedgerError> {
        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        self.conn.execute(
            "INSERT INTO attendance (name, timestamp) VALUES (?1, ?2)",
            params![label, stamp],
        )?;
        tracing::debug!(label, timestamp = %stamp, "attendance recorded");
        Ok(())
    }

    /// Append one event stamped with the local clock, never earlier than
    /// the previous stamp from this handle.
    pub fn record_now(&mut self, label: &str) -> Result<AttendanceEvent, LedgerError> {
        // Second resolution, matching the stored column.
        let now = Local::now().naive_local();
        let now = now.with_nanosecond(0).unwrap_or(now);
        let timestamp = match self.last_stamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.record(label, timestamp)?;
        self.last_stamp = Some(timestamp);
        Ok(AttendanceEvent {
            label: label.to_string(),
            timestamp,
        })
    }

    /// One row per distinct label, ordered by label. Empty ledger yields
    /// an empty vector.
    pub fn summarize(&self) -> Result<Vec<SummaryRow>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, COUNT(*) FROM attendance GROUP BY name ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SummaryRow {
                    label: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All events in insertion order.
    pub fn events(&self) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, timestamp FROM attendance ORDER BY rowid")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(label, stamp)| {
                NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT)
                    .map(|timestamp| AttendanceEvent { label, timestamp })
                    .map_err(|_| LedgerError::BadTimestamp(stamp))
            })
            .collect()
    }

    /// Total number of rows.
    pub fn len(&self) -> Result<u64, LedgerError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_empty_summary_is_empty_not_error() {
        let ledger = AttendanceLedger::open_in_memory().unwrap();
        assert!(ledger.summarize().unwrap().is_empty());
        assert!(ledger.is_empty().unwrap());
    }

    #[test]
    fn test_summary_counts_per_label() {
        let ledger = AttendanceLedger::open_in_memory().unwrap();
        ledger.record("Bob", at(9, 0, 0)).unwrap();
        ledger.record("Alice", at(9, 1, 0)).unwrap();
        ledger.record("Alice", at(9, 1, 0)).unwrap();
        ledger.record("Alice", at(9, 2, 30)).unwrap();

        let summary = ledger.summarize().unwrap();
        assert_eq!(
            summary,
            vec![
                SummaryRow { label: "Alice".into(), count: 3 },
                SummaryRow { label: "Bob".into(), count: 1 },
            ]
        );
        let total: u64 = summary.iter().map(|r| r.count).sum();
        assert_eq!(total, ledger.len().unwrap());
    }

    #[test]
    fn test_timestamp_column_format() {
        let ledger = AttendanceLedger::open_in_memory().unwrap();
        ledger.record("Alice", at(7, 5, 9)).unwrap();
        let raw: String = ledger
            .conn
            .query_row("SELECT timestamp FROM attendance", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, "2024-03-05 07:05:09");
    }

    #[test]
    fn test_events_in_insertion_order() {
        let ledger = AttendanceLedger::open_in_memory().unwrap();
        ledger.record("Bob", at(10, 0, 0)).unwrap();
        ledger.record("Alice", at(9, 0, 0)).unwrap();
        let events = ledger.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], AttendanceEvent { label: "Bob".into(), timestamp: at(10, 0, 0) });
        assert_eq!(events[1].label, "Alice");
    }

    #[test]
    fn test_record_now_never_goes_backwards() {
        let mut ledger = AttendanceLedger::open_in_memory().unwrap();
        let future = Local::now().naive_local() + chrono::Duration::hours(1);
        ledger.last_stamp = Some(future);
        let event = ledger.record_now("Alice").unwrap();
        assert_eq!(event.timestamp, future);

        let first = ledger.record_now("Bob").unwrap();
        let second = ledger.record_now("Bob").unwrap();
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn test_rows_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data/attendance.db");
        {
            let ledger = AttendanceLedger::open(&path).unwrap();
            ledger.record("Alice", at(8, 0, 0)).unwrap();
        }
        let ledger = AttendanceLedger::open(&path).unwrap();
        assert_eq!(ledger.len().unwrap(), 1);
        assert_eq!(ledger.summarize().unwrap()[0].label, "Alice");
    }

    #[test]
    fn test_unparseable_timestamp_surfaces() {
        let ledger = AttendanceLedger::open_in_memory().unwrap();
        ledger
            .conn
            .execute("INSERT INTO attendance VALUES ('Alice', 'yesterday')", [])
            .unwrap();
        assert!(matches!(ledger.events(), Err(LedgerError::BadTimestamp(s)) if s == "yesterday"));
    }
}
