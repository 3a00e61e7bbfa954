// ABOUTME: Core library for hearth, containing the persisted data model shared by every crate.
// ABOUTME: Defines snapshots and their codec, the migration engine, key naming, and save status.

pub mod keys;
pub mod migration;
pub mod snapshot;
pub mod status;

pub use keys::{KeySpace, is_valid_part};
pub use migration::{GapPolicy, MigrationError, MigrationStep, MigrationTable, migrate};
pub use snapshot::{CodecError, Snapshot, decode, encode, encode_snapshot};
pub use status::SaveStatus;
