//! Snapshot archive on an embedded SQLite file.
//!
//! The file admits one writer at a time, so no connection is held open
//! between writes. Each write opens a connection, commits one transaction and
//! closes it, all while holding the process-wide write guard. Reads open
//! their own query-only connections and never take the guard.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::{Component, HealthEvent, PortfolioSnapshot, Severity, SnapshotTrigger};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StorageError;
use crate::Result;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        sequence INTEGER PRIMARY KEY,
        session_id TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        trigger_kind TEXT NOT NULL,
        position_count INTEGER NOT NULL,
        excluded_count INTEGER NOT NULL,
        payload TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS health_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp_ms INTEGER NOT NULL,
        severity TEXT NOT NULL,
        component TEXT NOT NULL,
        message TEXT NOT NULL,
        reconnect_attempt INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp_ms);
    CREATE INDEX IF NOT EXISTS idx_health_timestamp ON health_events(timestamp_ms);
"#;

/// Durable sink for snapshots and health events.
///
/// Calls block the current thread; async callers go through
/// [`crate::retry::retry_blocking`].
pub trait ArchiveStore: Send + Sync {
    fn append_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()>;

    fn append_health(&self, event: &HealthEvent) -> Result<()>;
}

/// Missing sequence numbers between two archived snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub after: u64,
    pub before: u64,
    pub missing: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub snapshot_count: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub health_event_count: u64,
}

/// Gaps in an ascending list of sequence numbers
pub fn find_gaps(sequences: &[u64]) -> Vec<SequenceGap> {
    sequences
        .windows(2)
        .filter(|w| w[1] > w[0] + 1)
        .map(|w| SequenceGap {
            after: w[0],
            before: w[1],
            missing: w[1] - w[0] - 1,
        })
        .collect()
}

pub struct SnapshotArchive {
    path: PathBuf,
    busy_timeout: Duration,
    write_guard: Mutex<()>,
}

impl SnapshotArchive {
    /// Create the archive file and schema if needed
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let archive = Self {
            path,
            busy_timeout,
            write_guard: Mutex::new(()),
        };

        {
            let _guard = archive.write_guard.lock();
            let conn = archive.write_connection()?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.execute_batch(SCHEMA)?;
        }

        info!(path = %archive.path.display(), "Snapshot archive ready");
        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_connection(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn read_connection(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }

    /// Snapshots with timestamps in `[from, to]`, oldest first
    pub fn snapshots_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PortfolioSnapshot>> {
        let conn = self.read_connection()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM snapshots
             WHERE timestamp_ms BETWEEN ?1 AND ?2
             ORDER BY sequence ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![from.timestamp_millis(), to.timestamp_millis(), limit as i64],
            |row| row.get::<_, String>(0),
        )?;

        let mut snapshots = Vec::new();
        for payload in rows {
            snapshots.push(serde_json::from_str(&payload?)?);
        }
        Ok(snapshots)
    }

    pub fn latest_snapshot(&self) -> Result<Option<PortfolioSnapshot>> {
        let conn = self.read_connection()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM snapshots ORDER BY sequence DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(StorageError::from))
            .transpose()
    }

    /// Highest archived sequence number, used to seed a new session
    pub fn latest_sequence(&self) -> Result<Option<u64>> {
        let conn = self.read_connection()?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(sequence) FROM snapshots", [], |row| row.get(0))?;
        Ok(max.map(|s| s as u64))
    }

    /// Health events with timestamps in `[from, to]`, oldest first
    pub fn health_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HealthEvent>> {
        let conn = self.read_connection()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp_ms, severity, component, message, reconnect_attempt
             FROM health_events
             WHERE timestamp_ms BETWEEN ?1 AND ?2
             ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![from.timestamp_millis(), to.timestamp_millis(), limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

        let mut events = Vec::new();
        for row in rows {
            let (timestamp_ms, severity, component, message, attempt) = row?;
            events.push(HealthEvent {
                timestamp: from_millis(timestamp_ms)?,
                severity: severity
                    .parse::<Severity>()
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?,
                component: component
                    .parse::<Component>()
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?,
                message,
                reconnect_attempt: attempt as u32,
            });
        }
        Ok(events)
    }

    /// Discontinuities among snapshots archived in `[from, to]`
    pub fn sequence_gaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<SequenceGap>> {
        let conn = self.read_connection()?;
        let mut stmt = conn.prepare(
            "SELECT sequence FROM snapshots
             WHERE timestamp_ms BETWEEN ?1 AND ?2
             ORDER BY sequence ASC",
        )?;
        let sequences = stmt
            .query_map(params![from.timestamp_millis(), to.timestamp_millis()], |row| {
                row.get::<_, i64>(0)
            })?
            .map(|r| r.map(|s| s as u64))
            .collect::<rusqlite::Result<Vec<u64>>>()?;
        Ok(find_gaps(&sequences))
    }

    pub fn statistics(&self) -> Result<ArchiveStats> {
        let conn = self.read_connection()?;
        let (count, first_seq, last_seq, first_ts, last_ts) = conn.query_row(
            "SELECT COUNT(*), MIN(sequence), MAX(sequence), MIN(timestamp_ms), MAX(timestamp_ms)
             FROM snapshots",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )?;
        let health_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM health_events", [], |row| row.get(0))?;

        Ok(ArchiveStats {
            snapshot_count: count as u64,
            first_sequence: first_seq.map(|s| s as u64),
            last_sequence: last_seq.map(|s| s as u64),
            first_timestamp: first_ts.map(from_millis).transpose()?,
            last_timestamp: last_ts.map(from_millis).transpose()?,
            health_event_count: health_count as u64,
        })
    }
}

impl ArchiveStore for SnapshotArchive {
    fn append_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        let trigger = match snapshot.trigger {
            SnapshotTrigger::Change => "change",
            SnapshotTrigger::Periodic => "periodic",
        };

        let _guard = self.write_guard.lock();
        let mut conn = self.write_connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshots
                (sequence, session_id, timestamp_ms, trigger_kind, position_count, excluded_count, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.sequence as i64,
                snapshot.session_id.to_string(),
                snapshot.timestamp.timestamp_millis(),
                trigger,
                snapshot.positions.len() as i64,
                snapshot.excluded.len() as i64,
                payload,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn append_health(&self, event: &HealthEvent) -> Result<()> {
        let _guard = self.write_guard.lock();
        let mut conn = self.write_connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO health_events
                (timestamp_ms, severity, component, message, reconnect_attempt)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.timestamp.timestamp_millis(),
                event.severity.as_str(),
                event.component.as_str(),
                event.message,
                event.reconnect_attempt as i64,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {} out of range", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration as ChronoDuration;
    use common::NetGreeks;
    use uuid::Uuid;

    fn archive() -> (tempfile::TempDir, SnapshotArchive) {
        let dir = tempfile::tempdir().unwrap();
        let archive =
            SnapshotArchive::open(dir.path().join("data/greeks.db"), Duration::from_millis(250))
                .unwrap();
        (dir, archive)
    }

    fn snapshot(sequence: u64, timestamp: DateTime<Utc>) -> PortfolioSnapshot {
        PortfolioSnapshot {
            session_id: Uuid::new_v4(),
            sequence,
            timestamp,
            trigger: SnapshotTrigger::Change,
            positions: Vec::new(),
            net: vec![NetGreeks::empty("ETH")],
            excluded: Vec::new(),
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_750_000_000_000).unwrap()
    }

    #[test]
    fn test_snapshot_round_trip_and_range_query() {
        let (_dir, archive) = archive();
        let t0 = base_time();
        for seq in 1..=5 {
            archive
                .append_snapshot(&snapshot(seq, t0 + ChronoDuration::seconds(seq as i64)))
                .unwrap();
        }

        let all = archive
            .snapshots_between(t0, t0 + ChronoDuration::minutes(1), 100)
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].sequence, 1);
        assert_eq!(all[0].net, vec![NetGreeks::empty("ETH")]);

        let window = archive
            .snapshots_between(
                t0 + ChronoDuration::seconds(2),
                t0 + ChronoDuration::seconds(4),
                100,
            )
            .unwrap();
        let seqs: Vec<u64> = window.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);

        let limited = archive
            .snapshots_between(t0, t0 + ChronoDuration::minutes(1), 2)
            .unwrap();
        assert_eq!(limited.len(), 2);

        assert_eq!(archive.latest_sequence().unwrap(), Some(5));
        assert_eq!(archive.latest_snapshot().unwrap().unwrap().sequence, 5);
    }

    #[test]
    fn test_empty_archive() {
        let (_dir, archive) = archive();
        assert_eq!(archive.latest_sequence().unwrap(), None);
        assert!(archive.latest_snapshot().unwrap().is_none());
        let stats = archive.statistics().unwrap();
        assert_eq!(stats.snapshot_count, 0);
        assert_eq!(stats.first_sequence, None);
    }

    #[test]
    fn test_duplicate_sequence_is_not_retryable() {
        let (_dir, archive) = archive();
        archive.append_snapshot(&snapshot(1, base_time())).unwrap();
        let err = archive.append_snapshot(&snapshot(1, base_time())).unwrap_err();
        assert_matches!(err, StorageError::Database(_));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_health_events_round_trip() {
        let (_dir, archive) = archive();
        let mut event =
            HealthEvent::warning(Component::Ingestion, "feed disconnected").with_reconnect_attempt(2);
        event.timestamp = base_time();
        archive.append_health(&event).unwrap();

        let events = archive
            .health_events_between(
                base_time() - ChronoDuration::seconds(1),
                base_time() + ChronoDuration::seconds(1),
                10,
            )
            .unwrap();
        assert_eq!(events, vec![event]);
        assert_eq!(archive.statistics().unwrap().health_event_count, 1);
    }

    #[test]
    fn test_gaps_and_statistics() {
        let (_dir, archive) = archive();
        let t0 = base_time();
        for seq in [10, 11, 14, 15, 20] {
            archive
                .append_snapshot(&snapshot(seq, t0 + ChronoDuration::seconds(seq as i64)))
                .unwrap();
        }

        let gaps = archive
            .sequence_gaps(t0, t0 + ChronoDuration::minutes(1))
            .unwrap();
        assert_eq!(
            gaps,
            vec![
                SequenceGap {
                    after: 11,
                    before: 14,
                    missing: 2
                },
                SequenceGap {
                    after: 15,
                    before: 20,
                    missing: 4
                },
            ]
        );

        let stats = archive.statistics().unwrap();
        assert_eq!(stats.snapshot_count, 5);
        assert_eq!(stats.first_sequence, Some(10));
        assert_eq!(stats.last_sequence, Some(20));
        assert_eq!(
            stats.last_timestamp,
            Some(t0 + ChronoDuration::seconds(20))
        );
    }

    #[test]
    fn test_find_gaps() {
        assert!(find_gaps(&[]).is_empty());
        assert!(find_gaps(&[1, 2, 3]).is_empty());
        assert_eq!(
            find_gaps(&[1, 3]),
            vec![SequenceGap {
                after: 1,
                before: 3,
                missing: 1
            }]
        );
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeks.db");
        {
            let archive = SnapshotArchive::open(&path, Duration::from_millis(100)).unwrap();
            archive.append_snapshot(&snapshot(41, base_time())).unwrap();
        }
        let archive = SnapshotArchive::open(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(archive.latest_sequence().unwrap(), Some(41));
    }
}
