// ABOUTME: Persistence layer for hearth, wrapping key/value media behind a fault-tolerant trait.
// ABOUTME: Provides memory, SQLite and file media, the change bus, backup management, and snapshot loading.

pub mod backup;
pub mod file;
pub mod loader;
pub mod memory;
pub mod observed;
pub mod sqlite;
pub mod store;

pub use backup::{BackupEntry, BackupError, BackupManager, BackupReason, BackupRecord};
pub use file::FileStore;
pub use loader::{DefaultReason, LoadOutcome, LoadSource, SnapshotLoader};
pub use memory::MemoryStore;
pub use observed::{ChangeBus, ContextId, ObservedStore, StorageEvent};
pub use sqlite::SqliteStore;
pub use store::{DurableStore, PROBE_KEY, StoreError};
