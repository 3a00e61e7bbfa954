// ABOUTME: SQLite-backed DurableStore holding every key in a single entries table.
// ABOUTME: Enforces an optional byte quota and maps SQLite failures onto StoreError.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use crate::store::{DurableStore, StoreError, check_quota};

/// A key/value table in a SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota: Option<u64>,
}

impl SqliteStore {
    /// Open or create a store at `path`, creating the schema if needed.
    pub fn open(path: &Path, quota: Option<u64>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| map_err("", 0, quota, e))?;
        Self::init(conn, quota)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory(quota: Option<u64>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| map_err("", 0, quota, e))?;
        Self::init(conn, quota)
    }

    fn init(conn: Connection, quota: Option<u64>) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
             );",
        )
        .map_err(|e| map_err("", 0, quota, e))?;

        Ok(Self {
            conn: Mutex::new(conn),
            quota,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

/// Translate a SQLite error. A full database is a quota problem; anything
/// else means the medium cannot be used.
fn map_err(key: &str, needed: u64, quota: Option<u64>, err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => StoreError::QuotaExceeded {
            key: key.to_string(),
            needed,
            limit: quota,
        },
        _ => StoreError::Unavailable(format!("sqlite: {}", err)),
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM entries WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| map_err(key, 0, self.quota, e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let needed = (key.len() + value.len()) as u64;

        if self.quota.is_some() {
            let used: i64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
                     FROM entries WHERE key != ?1",
                    params![key],
                    |row| row.get(0),
                )
                .map_err(|e| map_err(key, needed, self.quota, e))?;
            check_quota(self.quota, key, value, used.max(0) as u64)?;
        }

        conn.execute(
            "INSERT INTO entries (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| map_err(key, needed, self.quota, e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM entries WHERE key = ?1", params![key])
            .map_err(|e| map_err(key, 0, self.quota, e))?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(|e| map_err(prefix, 0, self.quota, e))?;
        let rows = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(|e| map_err(prefix, 0, self.quota, e))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(|e| map_err(prefix, 0, self.quota, e))?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = SqliteStore::open(&path, None).unwrap();
            store.set("app_state", r#"{"version":1}"#).await.unwrap();
            store.set("app_state", r#"{"version":2}"#).await.unwrap();
        }

        let store = SqliteStore::open(&path, None).unwrap();
        assert_eq!(
            store.get("app_state").await.unwrap().as_deref(),
            Some(r#"{"version":2}"#)
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_match_literal_prefix() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        for key in ["app_b", "app_a", "app%_x", "appbackup_a_1", "zzz"] {
            store.set(key, "v").await.unwrap();
        }

        // `%` and `_` are not wildcards here.
        assert_eq!(store.keys("app_").await.unwrap(), vec!["app_a", "app_b"]);
        assert_eq!(store.keys("app%").await.unwrap(), vec!["app%_x"]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = SqliteStore::open_in_memory(None).unwrap();
        store.set("k", "v").await.unwrap();
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn quota_is_enforced() {
        let store = SqliteStore::open_in_memory(Some(16)).unwrap();
        store.set("a", "1234567").await.unwrap();

        let err = store.set("b", "123456789").await.unwrap_err();
        assert!(err.is_quota(), "expected quota error, got {:?}", err);

        // Overwriting the existing key within budget still works.
        store.set("a", "123456789012345").await.unwrap();
        store.probe().await.unwrap_err();
    }
}
