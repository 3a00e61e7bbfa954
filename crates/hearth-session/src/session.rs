// ABOUTME: Host-facing session for one persisted key: load, autosave, flush, backups and restore.
// ABOUTME: Explicitly opened and closed; the autosave scheduler only starts once loading has finished.

use std::sync::Arc;

use hearth_core::{KeySpace, SaveStatus, decode, is_valid_part};
use hearth_store::{
    BackupEntry, BackupError, BackupManager, BackupReason, ChangeBus, ContextId, DefaultReason,
    DurableStore, LoadOutcome, LoadSource, MemoryStore, ObservedStore, SnapshotLoader,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use ulid::Ulid;

use crate::config::SessionConfig;
use crate::notifier::{CrossContextNotifier, ExternalChange};
use crate::scheduler::{self, AutoSaveHandle, Flushed, SaveError, SchedulerState, SnapshotWriter};

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has not been loaded")]
    NotLoaded,

    #[error("session is already loaded")]
    AlreadyLoaded,

    #[error("{0} is not a backup of this session's key")]
    ForeignBackup(String),

    #[error("nothing is stored under {0}")]
    NothingStored(String),

    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("save error: {0}")]
    Save(#[from] SaveError),
}

/// Whether writes reach the real medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Durable,
    /// The medium failed its probe, or stored state could not be read at
    /// load. State lives only as long as the process.
    MemoryOnly,
}

struct Active {
    outcome: LoadOutcome,
    autosave: AutoSaveHandle,
    notifier: Option<CrossContextNotifier>,
}

/// One application key on one medium.
pub struct Session {
    config: SessionConfig,
    backups: BackupManager,
    bus: ChangeBus,
    context: ContextId,
    mode: StorageMode,
    active: Option<Active>,
}

impl Session {
    /// Open a session on `medium`. If the medium does not accept writes the
    /// session falls back to an in-process store instead of failing.
    pub async fn open(
        medium: Arc<dyn DurableStore>,
        bus: ChangeBus,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        if config.current_version == 0 {
            return Err(SessionError::InvalidConfig(
                "current version must be at least 1".to_string(),
            ));
        }
        if config.max_backups == 0 {
            return Err(SessionError::InvalidConfig(
                "max backups must be at least 1".to_string(),
            ));
        }
        if !is_valid_part(&config.name) {
            return Err(SessionError::InvalidConfig(format!(
                "name may only contain letters, digits, '_' and '-'; got {:?}",
                config.name
            )));
        }
        if !is_valid_part(&config.prefix) {
            return Err(SessionError::InvalidConfig(format!(
                "prefix may only contain letters, digits, '_' and '-'; got {:?}",
                config.prefix
            )));
        }
        if let Err(e) = config.migrations.validate(config.current_version) {
            tracing::warn!("migration table for {} is incomplete: {}", config.name, e);
        }

        let context = Ulid::new();
        let (store, mode): (Arc<dyn DurableStore>, StorageMode) = match medium.probe().await {
            Ok(()) => (
                Arc::new(ObservedStore::new(medium, context, bus.clone())),
                StorageMode::Durable,
            ),
            Err(e) => {
                tracing::warn!(
                    "storage unavailable ({}), {} will only be kept in memory",
                    e,
                    config.name
                );
                (Arc::new(MemoryStore::new()), StorageMode::MemoryOnly)
            }
        };

        let keys = KeySpace::new(config.prefix.clone());
        let backups = BackupManager::new(store, keys, config.max_backups);

        Ok(Self {
            config,
            backups,
            bus,
            context,
            mode,
            active: None,
        })
    }

    /// Load the stored state, migrating it if needed, then start autosaving.
    pub async fn load(&mut self) -> Result<&LoadOutcome, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyLoaded);
        }
        let active = self.activate().await;
        Ok(&self.active.insert(active).outcome)
    }

    /// Hand the latest state to the autosave scheduler.
    pub fn schedule_save(&self, data: Value) -> Result<(), SessionError> {
        self.active()?.autosave.mark_dirty(data)?;
        Ok(())
    }

    /// Write scheduled state now.
    pub async fn flush(&self) -> Result<Flushed, SessionError> {
        Ok(self.active()?.autosave.flush().await?)
    }

    pub fn save_status(&self) -> SaveStatus {
        self.active
            .as_ref()
            .map(|active| active.autosave.status())
            .unwrap_or_default()
    }

    pub fn subscribe_status(&self) -> Result<watch::Receiver<SaveStatus>, SessionError> {
        Ok(self.active()?.autosave.subscribe_status())
    }

    /// Changes other instances make to this session's key. `None` before
    /// loading and for memory-only sessions.
    pub fn subscribe_external(&self) -> Option<broadcast::Receiver<ExternalChange>> {
        self.active
            .as_ref()
            .and_then(|active| active.notifier.as_ref())
            .map(CrossContextNotifier::subscribe)
    }

    pub async fn scheduler_state(&self) -> Result<SchedulerState, SessionError> {
        Ok(self.active()?.autosave.state().await?)
    }

    /// Backups of this session's key, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>, SessionError> {
        Ok(self.backups.list(&self.config.name).await?)
    }

    /// Back up what is currently stored, after flushing scheduled state.
    pub async fn backup_now(&self) -> Result<String, SessionError> {
        if let Some(active) = &self.active {
            active.autosave.flush().await?;
        }
        let key = self.key();
        let text = self
            .backups
            .store()
            .get(&key)
            .await
            .map_err(BackupError::from)?
            .ok_or(SessionError::NothingStored(key))?;
        let snapshot = decode(&text).map_err(BackupError::from)?;
        Ok(self
            .backups
            .create(&self.config.name, &snapshot, BackupReason::Manual)
            .await?)
    }

    /// Replace the stored state with a backup and reload from it. Pending
    /// autosave data is discarded; an in-flight write finishes first so it
    /// cannot land on top of the restored state.
    pub async fn restore_backup(&mut self, backup_key: &str) -> Result<&LoadOutcome, SessionError> {
        if !self
            .backups
            .keys()
            .is_backup_of(&self.config.name, backup_key)
        {
            return Err(SessionError::ForeignBackup(backup_key.to_string()));
        }
        // Fail before touching the running session if the backup is gone.
        self.backups.get(backup_key).await?;

        if let Some(active) = self.active.take() {
            active.autosave.discard().await?;
            active.autosave.shutdown().await?;
        }

        let key = self.key();
        if let Err(e) = self.backups.restore(backup_key, &key).await {
            // Keep the session usable on whatever is stored now.
            let active = self.activate().await;
            self.active = Some(active);
            return Err(e.into());
        }

        let active = self.activate().await;
        Ok(&self.active.insert(active).outcome)
    }

    /// Write pending state and stop autosaving.
    pub async fn close(mut self) -> Result<Flushed, SessionError> {
        match self.active.take() {
            Some(active) => Ok(active.autosave.shutdown().await?),
            None => Ok(Flushed::Clean),
        }
    }

    pub fn key(&self) -> String {
        self.backups.keys().primary(&self.config.name)
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Result of the most recent load or restore.
    pub fn outcome(&self) -> Option<&LoadOutcome> {
        self.active.as_ref().map(|active| &active.outcome)
    }

    fn active(&self) -> Result<&Active, SessionError> {
        self.active.as_ref().ok_or(SessionError::NotLoaded)
    }

    async fn activate(&mut self) -> Active {
        let outcome = {
            let config = &self.config;
            let loader = SnapshotLoader::new(
                &self.backups,
                &config.migrations,
                config.current_version,
                config.gap_policy,
            );
            loader.load(&config.name, &config.default_payload).await
        };

        // Stored data could not be read, so saving the defaults would
        // overwrite it. Keep this session in memory instead.
        if self.mode == StorageMode::Durable
            && outcome.source == LoadSource::Default(DefaultReason::Unavailable)
        {
            tracing::warn!(
                "could not read {}, keeping this session in memory so stored data is not overwritten",
                self.key()
            );
            self.mode = StorageMode::MemoryOnly;
            self.backups = BackupManager::new(
                Arc::new(MemoryStore::new()),
                self.backups.keys().clone(),
                self.config.max_backups,
            );
        }

        let config = &self.config;

        // A partially migrated snapshot keeps being saved at its own version
        // so a later build with the missing step can finish the job.
        let key = self.key();
        let writer = SnapshotWriter::new(
            Arc::clone(self.backups.store()),
            key.clone(),
            outcome.snapshot.version,
        );
        let autosave = scheduler::spawn(writer, config.debounce);

        let notifier = match self.mode {
            StorageMode::Durable => Some(CrossContextNotifier::spawn(&self.bus, key, self.context)),
            StorageMode::MemoryOnly => None,
        };

        Active {
            outcome,
            autosave,
            notifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{GapPolicy, MigrationTable, Snapshot, encode};
    use serde_json::json;
    use std::time::Duration;

    fn config(version: u32) -> SessionConfig {
        SessionConfig::new("app", "state", version)
            .with_debounce(Duration::from_secs(60))
            .with_default_payload(json!({"items": []}))
    }

    fn v1_to_v2() -> MigrationTable {
        MigrationTable::new()
            .with_step(1, "add language", |mut payload| {
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("language".to_string(), json!("en"));
                }
                payload
            })
            .unwrap()
    }

    async fn open(medium: &Arc<MemoryStore>, config: SessionConfig) -> Session {
        Session::open(medium.clone(), ChangeBus::default(), config)
            .await
            .unwrap()
    }

    async fn stored(medium: &MemoryStore, key: &str) -> Snapshot {
        decode(&medium.get(key).await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn fresh_session_loads_defaults_and_saves() {
        let medium = Arc::new(MemoryStore::new());
        let mut session = open(&medium, config(1)).await;
        assert_eq!(session.mode(), StorageMode::Durable);

        let outcome = session.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Default(DefaultReason::Missing));
        assert_eq!(outcome.snapshot.payload, json!({"items": []}));

        session.schedule_save(json!({"items": [1]})).unwrap();
        assert_eq!(session.flush().await.unwrap(), Flushed::Written);
        assert_eq!(session.save_status(), SaveStatus::Saved);

        let snap = stored(&medium, "app_state").await;
        assert_eq!(snap.version, 1);
        assert_eq!(snap.payload, json!({"items": [1]}));
    }

    #[tokio::test]
    async fn operations_before_load_are_rejected() {
        let medium = Arc::new(MemoryStore::new());
        let mut session = open(&medium, config(1)).await;

        assert!(matches!(
            session.schedule_save(json!({})),
            Err(SessionError::NotLoaded)
        ));
        assert!(matches!(session.flush().await, Err(SessionError::NotLoaded)));
        assert_eq!(session.save_status(), SaveStatus::Idle);
        assert!(session.subscribe_external().is_none());

        session.load().await.unwrap();
        assert!(matches!(session.load().await, Err(SessionError::AlreadyLoaded)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let medium: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let err = Session::open(medium.clone(), ChangeBus::default(), config(0))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::InvalidConfig(_)));

        let err = Session::open(medium, ChangeBus::default(), config(1).with_max_backups(0))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::InvalidConfig(_)));
    }

    /// Serves a medium but fails the first read of one key.
    struct FirstReadFails {
        inner: MemoryStore,
        key: &'static str,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl DurableStore for FirstReadFails {
        async fn get(&self, key: &str) -> Result<Option<String>, hearth_store::StoreError> {
            if key == self.key && !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(hearth_store::StoreError::Unavailable("database is locked".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), hearth_store::StoreError> {
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), hearth_store::StoreError> {
            self.inner.remove(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, hearth_store::StoreError> {
            self.inner.keys(prefix).await
        }
    }

    #[tokio::test]
    async fn unreadable_state_is_never_overwritten() {
        let medium = Arc::new(FirstReadFails {
            inner: MemoryStore::new(),
            key: "app_state",
            failed: Default::default(),
        });
        let precious = encode(1, &json!({"items": ["precious"]})).unwrap();
        medium.inner.set("app_state", &precious).await.unwrap();

        let mut session = Session::open(medium.clone(), ChangeBus::default(), config(1))
            .await
            .unwrap();
        assert_eq!(session.mode(), StorageMode::Durable);

        let outcome = session.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Default(DefaultReason::Unavailable));
        assert_eq!(session.mode(), StorageMode::MemoryOnly);
        assert!(session.subscribe_external().is_none());

        session.schedule_save(json!({"items": []})).unwrap();
        assert_eq!(session.flush().await.unwrap(), Flushed::Written);
        session.close().await.unwrap();

        assert_eq!(
            medium.inner.get("app_state").await.unwrap().as_deref(),
            Some(precious.as_str())
        );
    }

    #[tokio::test]
    async fn names_and_prefixes_must_be_valid_key_parts() {
        let medium: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        for bad in [
            SessionConfig {
                name: "my state".to_string(),
                ..config(1)
            },
            SessionConfig {
                name: String::new(),
                ..config(1)
            },
            SessionConfig::new("a/b", "state", 1),
            SessionConfig::new("", "state", 1),
        ] {
            let err = Session::open(medium.clone(), ChangeBus::default(), bad)
                .await
                .err()
                .unwrap();
            assert!(matches!(err, SessionError::InvalidConfig(_)), "{}", err);
        }
    }

    #[tokio::test]
    async fn unavailable_medium_falls_back_to_memory() {
        let medium = Arc::new(MemoryStore::new());
        medium.set_available(false);
        let mut session = open(&medium, config(1)).await;
        assert_eq!(session.mode(), StorageMode::MemoryOnly);

        session.load().await.unwrap();
        session.schedule_save(json!({"items": [1]})).unwrap();
        assert_eq!(session.flush().await.unwrap(), Flushed::Written);
        assert!(session.subscribe_external().is_none());

        medium.set_available(true);
        assert!(medium.is_empty());
    }

    #[tokio::test]
    async fn older_snapshot_is_backed_up_migrated_and_written_back() {
        let medium = Arc::new(MemoryStore::new());
        medium
            .set("app_state", &encode(1, &json!({"items": []})).unwrap())
            .await
            .unwrap();

        let mut session = open(&medium, config(2).with_migrations(v1_to_v2())).await;
        let outcome = session.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Migrated { from: 1 });
        assert_eq!(outcome.snapshot.payload["language"], "en");

        let backups = session.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].record.reason, BackupReason::PreMigration);
        assert_eq!(backups[0].record.snapshot.version, 1);
        assert_eq!(stored(&medium, "app_state").await.version, 2);
    }

    #[tokio::test]
    async fn partial_migration_keeps_saving_at_partial_version() {
        let medium = Arc::new(MemoryStore::new());
        medium
            .set("app_state", &encode(1, &json!({"items": []})).unwrap())
            .await
            .unwrap();

        let mut session = open(
            &medium,
            config(3)
                .with_migrations(v1_to_v2())
                .with_gap_policy(GapPolicy::KeepPartial),
        )
        .await;
        let outcome = session.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Partial { from: 1, missing: 2 });
        assert_eq!(outcome.snapshot.version, 2);

        session.schedule_save(json!({"items": [1]})).unwrap();
        session.flush().await.unwrap();
        assert_eq!(stored(&medium, "app_state").await.version, 2);
    }

    #[tokio::test]
    async fn restore_discards_pending_and_reloads_backup() {
        let medium = Arc::new(MemoryStore::new());
        let mut session = open(&medium, config(1)).await;
        session.load().await.unwrap();

        session.schedule_save(json!({"items": ["keep"]})).unwrap();
        session.flush().await.unwrap();
        let backup_key = session.backup_now().await.unwrap();

        session.schedule_save(json!({"items": ["later"]})).unwrap();
        session.flush().await.unwrap();
        session.schedule_save(json!({"items": ["never saved"]})).unwrap();

        let outcome = session.restore_backup(&backup_key).await.unwrap();
        assert_eq!(outcome.source, LoadSource::Stored);
        assert_eq!(outcome.snapshot.payload, json!({"items": ["keep"]}));
        assert_eq!(
            stored(&medium, "app_state").await.payload,
            json!({"items": ["keep"]})
        );

        // The session keeps autosaving after a restore.
        session.schedule_save(json!({"items": ["after"]})).unwrap();
        assert_eq!(session.flush().await.unwrap(), Flushed::Written);
    }

    #[tokio::test]
    async fn restore_rejects_other_keys_and_missing_backups() {
        let medium = Arc::new(MemoryStore::new());
        let mut session = open(&medium, config(1)).await;
        session.load().await.unwrap();

        assert!(matches!(
            session.restore_backup("appbackup_prefs_0000000000001").await,
            Err(SessionError::ForeignBackup(_))
        ));
        assert!(matches!(
            session.restore_backup("appbackup_state_0000000000001").await,
            Err(SessionError::Backup(BackupError::NotFound(_)))
        ));

        // Still loaded and saving.
        session.schedule_save(json!({"items": []})).unwrap();
        assert_eq!(session.flush().await.unwrap(), Flushed::Written);
    }

    #[tokio::test]
    async fn backup_now_requires_stored_state() {
        let medium = Arc::new(MemoryStore::new());
        let session = open(&medium, config(1)).await;
        assert!(matches!(
            session.backup_now().await,
            Err(SessionError::NothingStored(_))
        ));
    }

    #[tokio::test]
    async fn close_writes_pending_state() {
        let medium = Arc::new(MemoryStore::new());
        let mut session = open(&medium, config(1)).await;
        session.load().await.unwrap();

        session.schedule_save(json!({"items": ["closing"]})).unwrap();
        assert_eq!(session.close().await.unwrap(), Flushed::Written);
        assert_eq!(
            stored(&medium, "app_state").await.payload,
            json!({"items": ["closing"]})
        );
    }

    #[tokio::test]
    async fn writes_from_another_session_are_reported() {
        let medium: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let bus = ChangeBus::default();
        let mut first = Session::open(medium.clone(), bus.clone(), config(1)).await.unwrap();
        let mut second = Session::open(medium, bus, config(1)).await.unwrap();
        first.load().await.unwrap();
        second.load().await.unwrap();
        let mut changes = first.subscribe_external().unwrap();

        first.schedule_save(json!({"from": "first"})).unwrap();
        first.flush().await.unwrap();
        second.schedule_save(json!({"from": "second"})).unwrap();
        second.flush().await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "app_state");
        let snap = decode(change.new_value.as_deref().unwrap()).unwrap();
        assert_eq!(snap.payload, json!({"from": "second"}));
    }
}
