//! Key-value state store behind the persistence boundary.
//!
//! The runtime persists per-settlement queues on every mutation and reloads
//! them at startup. Corruption or absence is "no data", never fatal; a save
//! that fails is logged and dropped rather than propagated into the loops.

use std::fmt;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

/// Synchronous-from-the-caller's-perspective persistence. Missing or
/// unreadable data loads as `None`; failed saves are logged, not surfaced.
pub trait StateStore {
    fn load(&self, key: &str) -> Option<Value>;
    fn save(&mut self, key: &str, value: &Value);
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Test and ephemeral-session store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: std::collections::BTreeMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn save(&mut self, key: &str, value: &Value) {
        self.entries.insert(key.to_string(), value.clone());
    }
}

// ---------------------------------------------------------------------------
// Sqlite store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&mut self) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name) VALUES(1, 'initial_v1')",
            [],
        )?;

        Ok(())
    }

    fn try_load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn try_save(&mut self, key: &str, value: &Value) -> Result<(), StoreError> {
        let payload = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO agent_state (key, payload_json)
             VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                payload_json = excluded.payload_json",
            params![key, payload],
        )?;
        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self, key: &str) -> Option<Value> {
        match self.try_load(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, %err, "treating unreadable persisted state as absent");
                None
            }
        }
    }

    fn save(&mut self, key: &str, value: &Value) {
        if let Err(err) = self.try_save(key, value) {
            warn!(key, %err, "dropping failed state save");
        }
    }
}
