// ABOUTME: Configuration for hearth sessions, loaded from HEARTH_* environment variables.
// ABOUTME: HearthConfig picks the medium and defaults; SessionConfig is what one Session is built with.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hearth_core::{GapPolicy, MigrationTable, is_valid_part};
use hearth_store::{DurableStore, FileStore, MemoryStore, SqliteStore, StoreError};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "hearth";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid number: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("HEARTH_BACKEND must be one of sqlite, file, memory; got {0}")]
    InvalidBackend(String),

    #[error("HEARTH_GAP_POLICY must be keep-partial or use-default; got {0}")]
    InvalidGapPolicy(String),

    #[error("HEARTH_PREFIX may only contain letters, digits, '_' and '-'; got {0:?}")]
    InvalidPrefix(String),

    #[error("HEARTH_MAX_BACKUPS must be at least 1")]
    ZeroBackups,
}

/// Which persistence medium backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    File,
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Backend::Sqlite),
            "file" => Ok(Backend::File),
            "memory" => Ok(Backend::Memory),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

/// Process-level configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct HearthConfig {
    pub home: PathBuf,
    pub backend: Backend,
    pub prefix: String,
    pub debounce: Duration,
    pub max_backups: usize,
    pub quota_bytes: Option<u64>,
    pub gap_policy: GapPolicy,
}

impl HearthConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - HEARTH_HOME: data directory (default: ~/.hearth)
    /// - HEARTH_BACKEND: sqlite, file or memory (default: sqlite)
    /// - HEARTH_PREFIX: application key prefix (default: hearth)
    /// - HEARTH_DEBOUNCE_MS: autosave debounce window (default: 500)
    /// - HEARTH_MAX_BACKUPS: backups kept per key (default: 5)
    /// - HEARTH_QUOTA_BYTES: storage quota in bytes (optional)
    /// - HEARTH_GAP_POLICY: keep-partial or use-default (default: use-default)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as `from_env` but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());

        let home = get("HEARTH_HOME").map(PathBuf::from).unwrap_or_else(|| {
            get("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".hearth")
        });

        let backend = match get("HEARTH_BACKEND") {
            Some(value) => value.parse()?,
            None => Backend::Sqlite,
        };

        let prefix = get("HEARTH_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if !is_valid_part(&prefix) {
            return Err(ConfigError::InvalidPrefix(prefix));
        }

        let debounce = match get("HEARTH_DEBOUNCE_MS") {
            Some(value) => Duration::from_millis(parse_number("HEARTH_DEBOUNCE_MS", &value)?),
            None => DEFAULT_DEBOUNCE,
        };

        let max_backups = match get("HEARTH_MAX_BACKUPS") {
            Some(value) => parse_number("HEARTH_MAX_BACKUPS", &value)? as usize,
            None => DEFAULT_MAX_BACKUPS,
        };
        if max_backups == 0 {
            return Err(ConfigError::ZeroBackups);
        }

        let quota_bytes = get("HEARTH_QUOTA_BYTES")
            .map(|value| parse_number("HEARTH_QUOTA_BYTES", &value))
            .transpose()?;

        let gap_policy = match get("HEARTH_GAP_POLICY").as_deref() {
            None | Some("use-default") => GapPolicy::UseDefault,
            Some("keep-partial") => GapPolicy::KeepPartial,
            Some(other) => return Err(ConfigError::InvalidGapPolicy(other.to_string())),
        };

        Ok(Self {
            home,
            backend,
            prefix,
            debounce,
            max_backups,
            quota_bytes,
            gap_policy,
        })
    }

    /// Open the configured medium under `home`.
    pub fn open_store(&self) -> Result<Arc<dyn DurableStore>, StoreError> {
        let store: Arc<dyn DurableStore> = match self.backend {
            Backend::Sqlite => Arc::new(SqliteStore::open(
                &self.home.join("hearth.db"),
                self.quota_bytes,
            )?),
            Backend::File => Arc::new(FileStore::open(&self.home.join("kv"), self.quota_bytes)?),
            Backend::Memory => match self.quota_bytes {
                Some(bytes) => Arc::new(MemoryStore::with_quota(bytes)),
                None => Arc::new(MemoryStore::new()),
            },
        };
        Ok(store)
    }

    /// Session settings for `name` using this process configuration.
    pub fn session_config(
        &self,
        name: impl Into<String>,
        current_version: u32,
        migrations: MigrationTable,
    ) -> SessionConfig {
        SessionConfig::new(self.prefix.clone(), name, current_version)
            .with_migrations(migrations)
            .with_debounce(self.debounce)
            .with_max_backups(self.max_backups)
            .with_gap_policy(self.gap_policy)
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })
}

/// Everything one `Session` needs, injected at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub prefix: String,
    pub name: String,
    pub current_version: u32,
    pub migrations: Arc<MigrationTable>,
    pub gap_policy: GapPolicy,
    pub debounce: Duration,
    pub max_backups: usize,
    /// Payload used whenever a load falls back to defaults.
    pub default_payload: Value,
}

impl SessionConfig {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>, current_version: u32) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            current_version,
            migrations: Arc::new(MigrationTable::new()),
            gap_policy: GapPolicy::default(),
            debounce: DEFAULT_DEBOUNCE,
            max_backups: DEFAULT_MAX_BACKUPS,
            default_payload: Value::Object(Default::default()),
        }
    }

    pub fn with_migrations(mut self, migrations: MigrationTable) -> Self {
        self.migrations = Arc::new(migrations);
        self
    }

    pub fn with_gap_policy(mut self, gap_policy: GapPolicy) -> Self {
        self.gap_policy = gap_policy;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    pub fn with_default_payload(mut self, payload: Value) -> Self {
        self.default_payload = payload;
        self
    }
}
