//! SQLite persistence: WAL mode, 3 tables, indexed queries.
//!
//! Schema: sessions, devices, observations. Every observation records the
//! session that captured it; `(session_id, sequence_id)` is unique, so
//! re-saving the same export is a no-op.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::Serialize;
use thiserror::Error;

use beacon_core::{CellKey, ExportRecord, ExportRow};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT,
    started_at REAL NOT NULL,
    ended_at REAL,
    observation_count INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS devices (
    address TEXT PRIMARY KEY,
    name TEXT,
    first_seen REAL NOT NULL,
    last_seen REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS observations (
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    sequence_id INTEGER NOT NULL,
    address TEXT NOT NULL REFERENCES devices(address),
    name TEXT,
    rssi INTEGER NOT NULL,
    tx_power INTEGER NOT NULL,
    is_connectable INTEGER NOT NULL,
    local_x REAL NOT NULL,
    local_y REAL NOT NULL,
    local_z REAL NOT NULL,
    latitude REAL,
    longitude REAL,
    timestamp REAL NOT NULL,
    raw_data TEXT NOT NULL,
    cell_x INTEGER NOT NULL,
    cell_y INTEGER NOT NULL,
    cell_z INTEGER NOT NULL,
    PRIMARY KEY (session_id, sequence_id)
);

CREATE INDEX IF NOT EXISTS idx_observations_address ON observations(address);
CREATE INDEX IF NOT EXISTS idx_observations_cell ON observations(cell_x, cell_y, cell_z);
CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen);
"#;

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// SQLite database for beacon observations.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Database { conn })
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        Self::open(":memory:")
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start a new capture session. Returns session_id.
    pub fn start_session(&mut self, source: &str) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO sessions (source, started_at, observation_count) VALUES (?1, ?2, 0)",
            params![source, now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Close a session and record how many observations it holds.
    pub fn end_session(&mut self, session_id: i64) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?1,
                 observation_count = (SELECT COUNT(*) FROM observations WHERE session_id = ?2)
             WHERE id = ?2",
            params![now(), session_id],
        )?;
        Ok(())
    }

    pub fn sessions(&self) -> SqlResult<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.source, s.started_at, s.ended_at,
                    (SELECT COUNT(*) FROM observations o WHERE o.session_id = s.id)
             FROM sessions s ORDER BY s.id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(SessionRow {
                id: r.get(0)?,
                source: r.get(1)?,
                started_at: r.get(2)?,
                ended_at: r.get(3)?,
                observation_count: r.get(4)?,
            })
        })?;
        rows.collect()
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    /// Insert exported records in one transaction. Returns rows newly written.
    pub fn save_records(&mut self, session_id: i64, records: &[ExportRecord]) -> SqlResult<usize> {
        let seen_at = now();
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut device = tx.prepare_cached(
                "INSERT INTO devices (address, name, first_seen, last_seen) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(address) DO UPDATE SET name = excluded.name, last_seen = excluded.last_seen",
            )?;
            let mut obs = tx.prepare_cached(
                "INSERT OR IGNORE INTO observations
                    (session_id, sequence_id, address, name, rssi, tx_power, is_connectable,
                     local_x, local_y, local_z, latitude, longitude, timestamp, raw_data,
                     cell_x, cell_y, cell_z)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;

            for rec in records {
                let row = &rec.row;
                device.execute(params![row.address, row.name, seen_at])?;
                inserted += obs.execute(params![
                    session_id,
                    rec.sequence_id as i64,
                    row.address,
                    row.name,
                    row.rssi,
                    row.tx_power,
                    row.is_connectable,
                    row.local_x as f64,
                    row.local_y as f64,
                    row.local_z as f64,
                    row.latitude,
                    row.longitude,
                    row.timestamp,
                    row.raw_data,
                    rec.cell.x,
                    rec.cell.y,
                    rec.cell.z,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Load stored rows in capture order, optionally for one session.
    pub fn load_records(&self, session_id: Option<i64>) -> SqlResult<Vec<ExportRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_id, address, name, rssi, tx_power, is_connectable,
                    local_x, local_y, local_z, latitude, longitude, timestamp, raw_data,
                    cell_x, cell_y, cell_z
             FROM observations
             WHERE ?1 IS NULL OR session_id = ?1
             ORDER BY session_id, sequence_id",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok(ExportRecord {
                sequence_id: r.get::<_, i64>(0)? as u64,
                cell: CellKey::new(r.get(13)?, r.get(14)?, r.get(15)?),
                row: ExportRow {
                    address: r.get(1)?,
                    name: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    rssi: r.get(3)?,
                    tx_power: r.get(4)?,
                    is_connectable: r.get(5)?,
                    local_x: r.get::<_, f64>(6)? as f32,
                    local_y: r.get::<_, f64>(7)? as f32,
                    local_z: r.get::<_, f64>(8)? as f32,
                    latitude: r.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
                    longitude: r.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
                    timestamp: r.get(11)?,
                    raw_data: r.get(12)?,
                },
            })
        })?;
        rows.collect()
    }

    pub fn load_rows(&self, session_id: Option<i64>) -> SqlResult<Vec<ExportRow>> {
        Ok(self
            .load_records(session_id)?
            .into_iter()
            .map(|r| r.row)
            .collect())
    }

    /// Highest sequence id stored for a session.
    pub fn last_sequence(&self, session_id: i64) -> SqlResult<Option<u64>> {
        let max: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(sequence_id) FROM observations WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(max.map(|v| v as u64))
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    fn count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            sessions: self.count("sessions"),
            devices: self.count("devices"),
            observations: self.count("observations"),
        }
    }

    /// Per-device totals across all sessions, most observed first.
    pub fn device_totals(&self) -> SqlResult<Vec<DeviceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.address, d.name, COUNT(o.sequence_id), AVG(o.rssi), d.first_seen, d.last_seen
             FROM devices d LEFT JOIN observations o ON o.address = d.address
             GROUP BY d.address
             ORDER BY COUNT(o.sequence_id) DESC, d.address",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(DeviceRow {
                address: r.get(0)?,
                name: r.get(1)?,
                observations: r.get(2)?,
                average_rssi: r.get(3)?,
                first_seen: r.get(4)?,
                last_seen: r.get(5)?,
            })
        })?;
        rows.collect()
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct DbStats {
    pub sessions: i64,
    pub devices: i64,
    pub observations: i64,
}

#[derive(Debug, Serialize)]
pub struct SessionRow {
    pub id: i64,
    pub source: Option<String>,
    pub started_at: f64,
    pub ended_at: Option<f64>,
    pub observation_count: i64,
}

#[derive(Debug, Serialize)]
pub struct DeviceRow {
    pub address: String,
    pub name: Option<String>,
    pub observations: i64,
    pub average_rssi: Option<f64>,
    pub first_seen: f64,
    pub last_seen: f64,
}

// ---------------------------------------------------------------------------
// Async archive
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where the server flushes observations. One session per process.
#[async_trait]
pub trait SignalArchive: Send + Sync {
    fn session_id(&self) -> i64;

    /// Persist records; returns rows newly written.
    async fn save(&self, records: Vec<ExportRecord>) -> Result<usize, ArchiveError>;

    async fn stats(&self) -> Result<DbStats, ArchiveError>;

    /// Mark the session finished.
    async fn close(&self) -> Result<(), ArchiveError>;
}

/// `SignalArchive` over a SQLite file. Work runs on the blocking pool.
pub struct SqliteArchive {
    db: Arc<Mutex<Database>>,
    session_id: i64,
}

impl SqliteArchive {
    pub fn new(mut db: Database, source: &str) -> SqlResult<Self> {
        let session_id = db.start_session(source)?;
        Ok(SqliteArchive {
            db: Arc::new(Mutex::new(db)),
            session_id,
        })
    }

    pub fn open(path: &str, source: &str) -> SqlResult<Self> {
        SqliteArchive::new(Database::open(path)?, source)
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, ArchiveError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> SqlResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        let out = tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *guard)
        })
        .await??;
        Ok(out)
    }
}

#[async_trait]
impl SignalArchive for SqliteArchive {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn save(&self, records: Vec<ExportRecord>) -> Result<usize, ArchiveError> {
        if records.is_empty() {
            return Ok(0);
        }
        let session_id = self.session_id;
        self.with_db(move |db| db.save_records(session_id, &records))
            .await
    }

    async fn stats(&self) -> Result<DbStats, ArchiveError> {
        self.with_db(|db| Ok(db.stats())).await
    }

    async fn close(&self) -> Result<(), ArchiveError> {
        let session_id = self.session_id;
        self.with_db(move |db| db.end_session(session_id)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{GeoCoord, Pipeline, Position};

    fn test_db() -> Database {
        Database::open_memory().unwrap()
    }

    fn sample_records() -> Vec<ExportRecord> {
        let pipeline = Pipeline::default();
        let inputs = [
            "AA:01|one|-60|-4|true|0|1|-1|-1|-1|76:EhkQBQMYHCi2,6:AhUBAg==|||-1||-1",
            "AA:02|two|-75|0|false",
            "AA:01|one|-58|-4|true",
        ];
        for (i, raw) in inputs.iter().enumerate() {
            pipeline
                .handle_raw_advertisement(
                    raw,
                    Position::new(i as f32, 0.0, 0.0),
                    GeoCoord::new(35.5, -82.5),
                    i as f64,
                )
                .unwrap();
        }
        let records = pipeline.read().export_records(None);
        records
    }

    #[test]
    fn test_open_memory() {
        let db = test_db();
        let stats = db.stats();
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.observations, 0);
    }

    #[test]
    fn test_session_lifecycle() {
        let mut db = test_db();
        let id = db.start_session("test.txt").unwrap();
        assert!(id > 0);
        db.save_records(id, &sample_records()).unwrap();
        db.end_session(id).unwrap();

        let sessions = db.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].source.as_deref(), Some("test.txt"));
        assert_eq!(sessions[0].observation_count, 3);
        assert!(sessions[0].ended_at.is_some());
    }

    #[test]
    fn test_save_and_load() {
        let mut db = test_db();
        let id = db.start_session("mem").unwrap();
        let records = sample_records();
        assert_eq!(db.save_records(id, &records).unwrap(), 3);

        let loaded = db.load_records(Some(id)).unwrap();
        assert_eq!(loaded, records);
        assert_eq!(db.load_rows(None).unwrap().len(), 3);
        assert_eq!(db.last_sequence(id).unwrap(), Some(3));

        let stats = db.stats();
        assert_eq!(stats.devices, 2);
        assert_eq!(stats.observations, 3);
    }

    #[test]
    fn test_save_is_idempotent() {
        let mut db = test_db();
        let id = db.start_session("mem").unwrap();
        let records = sample_records();
        db.save_records(id, &records).unwrap();
        assert_eq!(db.save_records(id, &records).unwrap(), 0);
        assert_eq!(db.stats().observations, 3);
    }

    #[test]
    fn test_sessions_kept_apart() {
        let mut db = test_db();
        let a = db.start_session("a").unwrap();
        let b = db.start_session("b").unwrap();
        let records = sample_records();
        db.save_records(a, &records).unwrap();
        db.save_records(b, &records[..1]).unwrap();
        assert_eq!(db.load_rows(Some(a)).unwrap().len(), 3);
        assert_eq!(db.load_rows(Some(b)).unwrap().len(), 1);
        assert_eq!(db.load_rows(None).unwrap().len(), 4);
        assert_eq!(db.last_sequence(b).unwrap(), Some(1));
    }

    #[test]
    fn test_last_sequence_empty() {
        let mut db = test_db();
        let id = db.start_session("empty").unwrap();
        assert_eq!(db.last_sequence(id).unwrap(), None);
    }

    #[test]
    fn test_device_totals() {
        let mut db = test_db();
        let id = db.start_session("mem").unwrap();
        db.save_records(id, &sample_records()).unwrap();
        let devices = db.device_totals().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, "AA:01");
        assert_eq!(devices[0].observations, 2);
        assert_eq!(devices[0].average_rssi, Some(-59.0));
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("beacons.db");
        let path = path.to_str().unwrap();
        {
            let mut db = Database::open(path).unwrap();
            let id = db.start_session("file").unwrap();
            db.save_records(id, &sample_records()).unwrap();
        }
        let db = Database::open(path).unwrap();
        assert_eq!(db.stats().observations, 3);
    }

    #[tokio::test]
    async fn test_sqlite_archive() {
        let archive = SqliteArchive::new(test_db(), "serve").unwrap();
        assert_eq!(archive.save(Vec::new()).await.unwrap(), 0);
        assert_eq!(archive.save(sample_records()).await.unwrap(), 3);
        assert_eq!(archive.save(sample_records()).await.unwrap(), 0);
        let stats = archive.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.observations, 3);
        archive.close().await.unwrap();
    }
}
