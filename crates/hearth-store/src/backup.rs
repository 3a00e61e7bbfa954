// ABOUTME: Bounded per-key backups of snapshots, taken before migrations overwrite stored data.
// ABOUTME: Creating a backup evicts the oldest ones beyond the cap; any backup can be restored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hearth_core::{CodecError, KeySpace, Snapshot, encode_snapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{DurableStore, StoreError};

/// Errors that can occur while creating, reading or restoring backups.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to encode backup record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("backup {key} is unreadable: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupReason {
    /// Copy of stored data taken right before migrating it.
    PreMigration,
    /// Requested explicitly by the application.
    Manual,
    /// Stored data that a load replaced with defaults (for example a
    /// snapshot written by a newer build).
    Superseded,
}

/// A retained copy of a snapshot, stored as JSON under its backup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub original_key: String,
    pub snapshot: Snapshot,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub reason: BackupReason,
}

/// A backup record together with the key it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupEntry {
    pub key: String,
    pub record: BackupRecord,
}

/// Owns every backup key in one application namespace. Applications read
/// and restore through the manager; they never write backup keys directly.
pub struct BackupManager {
    store: Arc<dyn DurableStore>,
    keys: KeySpace,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(store: Arc<dyn DurableStore>, keys: KeySpace, max_backups: usize) -> Self {
        Self {
            store,
            keys,
            max_backups,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    /// Store a copy of `snapshot` as a backup of `name` and evict the oldest
    /// backups beyond the cap. Returns the new backup key.
    pub async fn create(
        &self,
        name: &str,
        snapshot: &Snapshot,
        reason: BackupReason,
    ) -> Result<String, BackupError> {
        let existing = self.backup_keys(name).await?;

        // Creation times must strictly increase so keys never collide and
        // key order stays creation order.
        let newest = existing
            .last()
            .and_then(|key| self.keys.parse_backup(key))
            .map(|(_, ms)| ms);
        let mut created_ms = Utc::now().timestamp_millis();
        if let Some(newest) = newest
            && created_ms <= newest
        {
            created_ms = newest.saturating_add(1);
        }
        let created_at = DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now);

        let record = BackupRecord {
            original_key: self.keys.primary(name),
            snapshot: snapshot.clone(),
            created_at,
            reason,
        };
        let text = serde_json::to_string(&record).map_err(BackupError::Encode)?;
        let key = self.keys.backup(name, created_ms);

        self.store.set(&key, &text).await?;
        tracing::info!(
            "created {:?} backup {} of version {}",
            reason,
            key,
            snapshot.version
        );

        let evicted = self.prune(name, self.max_backups).await?;
        if evicted > 0 {
            tracing::debug!("evicted {} old backups of {}", evicted, name);
        }

        Ok(key)
    }

    /// Backups of `name`, newest first. Unreadable records are logged and
    /// skipped.
    pub async fn list(&self, name: &str) -> Result<Vec<BackupEntry>, BackupError> {
        let keys = self.backup_keys(name).await?;
        let mut entries = Vec::with_capacity(keys.len());

        for key in keys.into_iter().rev() {
            match self.get(&key).await {
                Ok(record) => entries.push(BackupEntry { key, record }),
                // Removed between listing and reading.
                Err(BackupError::NotFound(_)) => {}
                Err(BackupError::Corrupt { key, source }) => {
                    tracing::warn!("skipping unreadable backup {}: {}", key, source);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }

    /// Read one backup record.
    pub async fn get(&self, backup_key: &str) -> Result<BackupRecord, BackupError> {
        let text = self
            .store
            .get(backup_key)
            .await?
            .ok_or_else(|| BackupError::NotFound(backup_key.to_string()))?;
        serde_json::from_str(&text).map_err(|source| BackupError::Corrupt {
            key: backup_key.to_string(),
            source,
        })
    }

    /// Write the snapshot held by `backup_key` to `target_key`, keeping its
    /// original version and save time. Returns the restored snapshot.
    pub async fn restore(&self, backup_key: &str, target_key: &str) -> Result<Snapshot, BackupError> {
        let record = self.get(backup_key).await?;
        let text = encode_snapshot(&record.snapshot)?;
        self.store.set(target_key, &text).await?;
        tracing::info!(
            "restored backup {} into {} at version {}",
            backup_key,
            target_key,
            record.snapshot.version
        );
        Ok(record.snapshot)
    }

    /// Delete the oldest backups of `name` until at most `keep` remain.
    /// Returns how many were deleted.
    pub async fn prune(&self, name: &str, keep: usize) -> Result<usize, BackupError> {
        let keys = self.backup_keys(name).await?;
        let excess = keys.len().saturating_sub(keep);
        for key in &keys[..excess] {
            self.store.remove(key).await?;
        }
        Ok(excess)
    }

    /// Number of backups currently held for `name`.
    pub async fn count(&self, name: &str) -> Result<usize, BackupError> {
        Ok(self.backup_keys(name).await?.len())
    }

    /// Backup keys of exactly `name`, oldest first.
    async fn backup_keys(&self, name: &str) -> Result<Vec<String>, BackupError> {
        let mut keys: Vec<String> = self
            .store
            .keys(&self.keys.backup_prefix(name))
            .await?
            .into_iter()
            .filter(|key| self.keys.is_backup_of(name, key))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
