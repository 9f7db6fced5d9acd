use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use mirror_sync::{
    ErrorKind, SiteId, StateError, StateStore, SyncOutcome, SyncState, TransferSummary,
};
use rusqlite::OptionalExtension;

use crate::schema;

const SELECT_COLUMNS: &str = "SELECT site_id, last_attempt_at, last_success_at, last_outcome,
            last_error, last_error_kind, consecutive_failures, last_marker,
            bytes_transferred, files_changed, duration_ms
     FROM sync_state";

/// A SQLite-backed store of per-site sync state.
pub struct SqliteStateStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStateStore {
    /// Open a store backed by a file on disk, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("unable to create {}: {e}", parent.display()))
            })?;
        }

        let conn =
            rusqlite::Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .get_mut()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))?;
        schema::migrations()
            .to_latest(conn)
            .map_err(|e| StoreError::Migration(e.to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))
    }

    /// Every stored row, keyed by site id.
    pub fn states(&self) -> Result<BTreeMap<SiteId, SyncState>, StoreError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY site_id"))
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], StateRow::from_row)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut states = BTreeMap::new();
        for row in rows {
            let row = row.map_err(|e| StoreError::Database(e.to_string()))?;
            let (id, state) = row.into_state()?;
            states.insert(id, state);
        }
        Ok(states)
    }

    pub fn state(&self, id: &SiteId) -> Result<Option<SyncState>, StoreError> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE site_id = ?1"),
                [id.as_str()],
                StateRow::from_row,
            )
            .optional()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.map(|row| row.into_state().map(|(_, state)| state))
            .transpose()
    }

    /// Insert or replace the row for `id`.
    pub fn upsert(&self, id: &SiteId, state: &SyncState) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let transfer = state.last_transfer.as_ref();

        conn.execute(
            "INSERT OR REPLACE INTO sync_state
                (site_id, last_attempt_at, last_success_at, last_outcome, last_error,
                 last_error_kind, consecutive_failures, last_marker,
                 bytes_transferred, files_changed, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                id.as_str(),
                state.last_attempt_at.map(|t| t.to_rfc3339()),
                state.last_success_at.map(|t| t.to_rfc3339()),
                state.last_outcome.map(|o| o.as_str()),
                state.last_error,
                state.last_error_kind.map(|k| k.as_str()),
                state.consecutive_failures,
                state.last_marker,
                transfer.map(|t| to_i64(t.bytes_transferred)),
                transfer.map(|t| to_i64(t.files_changed)),
                transfer.map(|t| to_i64(t.duration_ms)),
            ],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    /// Insert an empty row for `id` unless one exists.
    pub fn insert_missing(&self, id: &SiteId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO sync_state (site_id) VALUES (?1)",
            [id.as_str()],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Delete rows for sites not in `keep`, in one transaction.
    pub fn prune(&self, keep: &[SiteId]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let keep: HashSet<&str> = keep.iter().map(SiteId::as_str).collect();

        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let stored: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT site_id FROM sync_state")
                .map_err(|e| StoreError::Database(e.to_string()))?;
            stmt.query_map([], |row| row.get(0))
                .map_err(|e| StoreError::Database(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| StoreError::Database(e.to_string()))?
        };

        let mut removed = 0;
        for id in stored.iter().filter(|id| !keep.contains(id.as_str())) {
            removed += tx
                .execute("DELETE FROM sync_state WHERE site_id = ?1", [id])
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(removed)
    }
}

impl StateStore for SqliteStateStore {
    fn load_all(&self) -> Result<BTreeMap<SiteId, SyncState>, StateError> {
        Ok(self.states()?)
    }

    fn get(&self, id: &SiteId) -> Result<Option<SyncState>, StateError> {
        Ok(self.state(id)?)
    }

    fn put(&self, id: &SiteId, state: &SyncState) -> Result<(), StateError> {
        Ok(self.upsert(id, state)?)
    }

    fn ensure(&self, id: &SiteId) -> Result<(), StateError> {
        Ok(self.insert_missing(id)?)
    }

    fn retain(&self, keep: &[SiteId]) -> Result<usize, StateError> {
        Ok(self.prune(keep)?)
    }
}

/// A row as stored, before its text columns are parsed.
struct StateRow {
    site_id: String,
    last_attempt_at: Option<String>,
    last_success_at: Option<String>,
    last_outcome: Option<String>,
    last_error: Option<String>,
    last_error_kind: Option<String>,
    consecutive_failures: u32,
    last_marker: Option<String>,
    bytes_transferred: Option<i64>,
    files_changed: Option<i64>,
    duration_ms: Option<i64>,
}

impl StateRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            site_id: row.get(0)?,
            last_attempt_at: row.get(1)?,
            last_success_at: row.get(2)?,
            last_outcome: row.get(3)?,
            last_error: row.get(4)?,
            last_error_kind: row.get(5)?,
            consecutive_failures: row.get(6)?,
            last_marker: row.get(7)?,
            bytes_transferred: row.get(8)?,
            files_changed: row.get(9)?,
            duration_ms: row.get(10)?,
        })
    }

    fn into_state(self) -> Result<(SiteId, SyncState), StoreError> {
        let id = SiteId::new(self.site_id);
        let corrupt = |message: String| StoreError::Corrupt {
            site: id.clone(),
            message,
        };

        let last_outcome = self
            .last_outcome
            .map(|s| SyncOutcome::parse(&s).ok_or_else(|| corrupt(format!("unknown outcome `{s}`"))))
            .transpose()?;
        let last_error_kind = self
            .last_error_kind
            .map(|s| ErrorKind::parse(&s).ok_or_else(|| corrupt(format!("unknown error kind `{s}`"))))
            .transpose()?;
        let last_attempt_at = self
            .last_attempt_at
            .map(|s| parse_timestamp(&s).map_err(&corrupt))
            .transpose()?;
        let last_success_at = self
            .last_success_at
            .map(|s| parse_timestamp(&s).map_err(&corrupt))
            .transpose()?;

        let last_transfer = match (self.bytes_transferred, self.files_changed, self.duration_ms) {
            (Some(bytes), Some(files), Some(duration)) => Some(TransferSummary {
                bytes_transferred: to_u64(bytes),
                files_changed: to_u64(files),
                duration_ms: to_u64(duration),
            }),
            _ => None,
        };

        let state = SyncState {
            last_attempt_at,
            last_success_at,
            last_outcome,
            last_error: self.last_error,
            last_error_kind,
            consecutive_failures: self.consecutive_failures,
            last_marker: self.last_marker,
            last_transfer,
        };
        Ok((id, state))
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp `{s}`: {e}"))
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// Errors specific to store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("corrupt row for {site}: {message}")]
    Corrupt { site: SiteId, message: String },
}

impl From<StoreError> for StateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt { site, message } => StateError::Corrupt { site, message },
            other => StateError::Storage(other.to_string()),
        }
    }
}
