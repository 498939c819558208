use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use experiment_core::{PreferencesStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum PersistenceError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

impl From<PersistenceError> for StoreError {
    fn from(value: PersistenceError) -> Self {
        match value {
            PersistenceError::Serde(err) => StoreError::Serialization(err),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// One finished upload attempt sequence for a session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub session_id: String,
    pub file_name: String,
    pub backup_path: String,
    pub uploaded: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub recorded_at: String,
}

/// Preferences kept in SQLite. Writes are staged in memory and committed in
/// one transaction by `flush`.
#[derive(Debug)]
pub struct SqlitePreferencesStore {
    conn: Connection,
    staged: BTreeMap<String, String>,
}

impl SqlitePreferencesStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let mut store = Self {
            conn,
            staged: BTreeMap::new(),
        };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self {
            conn,
            staged: BTreeMap::new(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        if let Some(value) = self.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        let value = self
            .conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn commit_staged(&mut self) -> Result<usize, PersistenceError> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let updated_at = now_stamp();
        let tx = self.conn.transaction()?;
        for (key, value) in &self.staged {
            tx.execute(
                "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, updated_at],
            )?;
        }
        tx.commit()?;
        let committed = self.staged.len();
        self.staged.clear();
        Ok(committed)
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn record_submission(&mut self, record: &SubmissionRecord) -> Result<(), PersistenceError> {
        self.conn.execute(
            "INSERT INTO submissions (
                session_id,
                file_name,
                backup_path,
                uploaded,
                attempts,
                last_error,
                recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.session_id.as_str(),
                record.file_name.as_str(),
                record.backup_path.as_str(),
                if record.uploaded { 1_i64 } else { 0_i64 },
                i64::from(record.attempts),
                record.last_error.as_deref(),
                record.recorded_at.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Logs whose latest submission did not reach the remote sink.
    pub fn pending_submissions(&self) -> Result<Vec<SubmissionRecord>, PersistenceError> {
        let mut statement = self.conn.prepare(
            "SELECT s.session_id, s.file_name, s.backup_path, s.uploaded, s.attempts, s.last_error, s.recorded_at
             FROM submissions s
             WHERE s.rowid = (
                SELECT MAX(rowid) FROM submissions latest WHERE latest.session_id = s.session_id
             )
             AND s.uploaded = 0
             ORDER BY s.session_id",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(SubmissionRecord {
                session_id: row.get(0)?,
                file_name: row.get(1)?,
                backup_path: row.get(2)?,
                uploaded: row.get::<_, i64>(3)? != 0,
                attempts: u32::try_from(row.get::<_, i64>(4)?).unwrap_or(u32::MAX),
                last_error: row.get(5)?,
                recorded_at: row.get(6)?,
            })
        })?;

        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        Ok(pending)
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS submissions (
                session_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                backup_path TEXT NOT NULL,
                uploaded INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_submissions_session
                ON submissions(session_id);
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at)
             VALUES (1, 'preferences_and_submissions', ?1)",
            params![now_stamp()],
        )?;
        Ok(())
    }
}

impl PreferencesStore for SqlitePreferencesStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load(key)?)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.staged.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.commit_staged()?;
        Ok(())
    }
}

pub(crate) fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
