// ABOUTME: Startup load pipeline turning whatever is stored under a key into current-version state.
// ABOUTME: Decodes, backs up, migrates, applies the gap policy, and writes the upgrade back.

use hearth_core::{GapPolicy, MigrationError, MigrationTable, Snapshot, decode, encode, migrate};
use serde_json::Value;

use crate::backup::{BackupError, BackupManager, BackupReason};

/// Why a load fell back to a default snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultReason {
    /// Nothing stored under the key.
    Missing,
    /// The medium could not be read.
    Unavailable,
    /// The stored blob did not decode.
    Corrupt,
    /// Stored data was written by a newer schema than this build knows.
    TooNew { found: u32 },
    /// Migration hit a gap and the session's policy discards partial data.
    MigrationGap { from: u32, missing: u32 },
    /// Migration failed for another reason.
    MigrationFailed,
}

/// Where the loaded snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// Stored data was already at the current version.
    Stored,
    /// Stored data was upgraded from `from`.
    Migrated { from: u32 },
    /// Migration stopped at `missing` and the partial result was kept. The
    /// snapshot version is below the current version.
    Partial { from: u32, missing: u32 },
    Default(DefaultReason),
}

/// Result of loading one key. Loading never fails: every problem resolves
/// to a default snapshot or an explicitly flagged partial one.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub snapshot: Snapshot,
    pub source: LoadSource,
    /// Backup taken during this load, if any.
    pub backup_key: Option<String>,
}

impl LoadOutcome {
    pub fn is_default(&self) -> bool {
        matches!(self.source, LoadSource::Default(_))
    }
}

/// Runs the load pipeline for keys in one namespace.
pub struct SnapshotLoader<'a> {
    backups: &'a BackupManager,
    table: &'a MigrationTable,
    current_version: u32,
    gap_policy: GapPolicy,
}

impl<'a> SnapshotLoader<'a> {
    pub fn new(
        backups: &'a BackupManager,
        table: &'a MigrationTable,
        current_version: u32,
        gap_policy: GapPolicy,
    ) -> Self {
        Self {
            backups,
            table,
            current_version,
            gap_policy,
        }
    }

    /// Load `name`, falling back to `default_payload` at the current version.
    ///
    /// Sequence:
    /// 1. Read the primary key (unreadable or missing: default)
    /// 2. Decode (corrupt: default)
    /// 3. Newer than this build: back it up as superseded, default
    /// 4. Older: back it up, then migrate
    /// 5. On a gap, apply the gap policy
    /// 6. Write any upgraded snapshot back to the primary key
    pub async fn load(&self, name: &str, default_payload: &Value) -> LoadOutcome {
        let key = self.backups.keys().primary(name);
        let store = self.backups.store();
        let current = self.current_version;

        let text = match store.get(&key).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::info!("no snapshot stored at {}, starting from defaults", key);
                return self.fallback(default_payload, DefaultReason::Missing, None);
            }
            Err(e) => {
                tracing::warn!("could not read {}: {}, starting from defaults", key, e);
                return self.fallback(default_payload, DefaultReason::Unavailable, None);
            }
        };

        let stored = match decode(&text) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("discarding corrupt snapshot at {}: {}", key, e);
                return self.fallback(default_payload, DefaultReason::Corrupt, None);
            }
        };

        let from = stored.version;
        if from == current {
            tracing::info!("loaded {} at version {}", key, from);
            return LoadOutcome {
                snapshot: stored,
                source: LoadSource::Stored,
                backup_key: None,
            };
        }

        if from > current {
            tracing::warn!(
                "{} holds version {} but this build supports {}, starting from defaults",
                key,
                from,
                current
            );
            let backup_key = self.backup(name, &stored, BackupReason::Superseded).await;
            return self.fallback(default_payload, DefaultReason::TooNew { found: from }, backup_key);
        }

        let backup_key = self.backup(name, &stored, BackupReason::PreMigration).await;

        match migrate(stored, self.table, current) {
            Ok(migrated) => {
                tracing::info!("migrated {} from version {} to {}", key, from, current);
                self.write_back(&key, &migrated).await;
                LoadOutcome {
                    snapshot: migrated,
                    source: LoadSource::Migrated { from },
                    backup_key,
                }
            }
            Err(MigrationError::Gap {
                missing, partial, ..
            }) => match self.gap_policy {
                GapPolicy::KeepPartial => {
                    tracing::warn!(
                        "keeping {} partially migrated at version {} (no step from {})",
                        key,
                        partial.version,
                        missing
                    );
                    if partial.version > from {
                        self.write_back(&key, &partial).await;
                    }
                    LoadOutcome {
                        snapshot: *partial,
                        source: LoadSource::Partial { from, missing },
                        backup_key,
                    }
                }
                GapPolicy::UseDefault => {
                    tracing::warn!(
                        "discarding {} at version {}: no migration from version {}",
                        key,
                        from,
                        missing
                    );
                    self.fallback(
                        default_payload,
                        DefaultReason::MigrationGap { from, missing },
                        backup_key,
                    )
                }
            },
            Err(e) => {
                tracing::error!("migration of {} failed: {}", key, e);
                self.fallback(default_payload, DefaultReason::MigrationFailed, backup_key)
            }
        }
    }

    fn fallback(
        &self,
        default_payload: &Value,
        reason: DefaultReason,
        backup_key: Option<String>,
    ) -> LoadOutcome {
        LoadOutcome {
            snapshot: Snapshot::new(self.current_version, default_payload.clone()),
            source: LoadSource::Default(reason),
            backup_key,
        }
    }

    /// Take a backup, pruning older backups of the same key one at a time
    /// while the medium reports it is full. Failure is logged, not fatal.
    async fn backup(&self, name: &str, snapshot: &Snapshot, reason: BackupReason) -> Option<String> {
        loop {
            match self.backups.create(name, snapshot, reason).await {
                Ok(key) => return Some(key),
                Err(BackupError::Store(e)) if e.is_quota() => {
                    let held = self.backups.count(name).await.unwrap_or(0);
                    if held == 0 {
                        tracing::warn!("no room to back up {}: {}", name, e);
                        return None;
                    }
                    if let Err(e) = self.backups.prune(name, held - 1).await {
                        tracing::warn!("could not prune backups of {}: {}", name, e);
                        return None;
                    }
                }
                Err(e) => {
                    tracing::warn!("could not back up {}: {}", name, e);
                    return None;
                }
            }
        }
    }

    async fn write_back(&self, key: &str, snapshot: &Snapshot) {
        let text = match encode(snapshot.version, &snapshot.payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("could not encode upgraded {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.backups.store().set(key, &text).await {
            tracing::warn!("could not write upgraded {}: {}", key, e);
        }
    }
}
