// ABOUTME: Session layer for hearth: debounced autosave, cross-context notices, and configuration.
// ABOUTME: Session is the explicit, instance-scoped entry point a host application drives.

pub mod config;
pub mod notifier;
pub mod scheduler;
pub mod session;

pub use config::{Backend, ConfigError, HearthConfig, SessionConfig};
pub use notifier::{CrossContextNotifier, ExternalChange};
pub use scheduler::{AutoSaveHandle, Flushed, SaveError, SchedulerPhase, SchedulerState, SnapshotWriter};
pub use session::{Session, SessionError, StorageMode};
