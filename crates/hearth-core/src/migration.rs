// ABOUTME: Schema migration engine that upgrades old snapshots one version at a time.
// ABOUTME: Steps live in an ordered table; a missing step halts the chain and returns the partial result.

use serde_json::Value;
use thiserror::Error;

use crate::snapshot::Snapshot;

/// Payload transform for a single version step.
pub type Transform = Box<dyn Fn(Value) -> Value + Send + Sync>;

/// Errors produced while building a migration table or running a migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// No step is registered for a version the chain had to pass through.
    /// `partial` is the snapshot as far as it could be upgraded.
    #[error("no migration registered from version {missing} (target version {target})")]
    Gap {
        missing: u32,
        target: u32,
        partial: Box<Snapshot>,
    },

    #[error("snapshot version {found} is newer than supported version {current}")]
    TooNew { found: u32, current: u32 },

    #[error("a migration from version {0} is already registered")]
    DuplicateStep(u32),

    #[error("migration steps must start at version 1 or later")]
    ZeroVersion,

    #[error("migration table has no step from version {missing} (needed to reach {target})")]
    Incomplete { missing: u32, target: u32 },
}

/// What the loader does with a snapshot whose migration stopped at a gap.
/// There is no implicit choice: every session is configured with one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GapPolicy {
    /// Keep the partially migrated data at the version it reached.
    KeepPartial,
    /// Discard the partial data and start from a default snapshot. The
    /// pre-migration backup still holds the original.
    #[default]
    UseDefault,
}

/// Upgrades a payload from `from_version` to `from_version + 1`.
pub struct MigrationStep {
    from_version: u32,
    description: String,
    transform: Transform,
}

impl MigrationStep {
    pub fn new<F>(from_version: u32, description: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self {
            from_version,
            description: description.into(),
            transform: Box::new(transform),
        }
    }

    pub fn from_version(&self) -> u32 {
        self.from_version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Apply the step. The version always advances by exactly one and the
    /// save timestamp is carried over unchanged.
    pub fn apply(&self, snapshot: Snapshot) -> Snapshot {
        Snapshot {
            version: snapshot.version + 1,
            payload: (self.transform)(snapshot.payload),
            saved_at: snapshot.saved_at,
        }
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from_version", &self.from_version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Ordered list of migration steps, sorted by `from_version`.
#[derive(Debug, Default)]
pub struct MigrationTable {
    steps: Vec<MigrationStep>,
}

impl MigrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a step, keeping the table sorted. Rejects version 0 and
    /// a second step for the same source version.
    pub fn register(&mut self, step: MigrationStep) -> Result<(), MigrationError> {
        if step.from_version == 0 {
            return Err(MigrationError::ZeroVersion);
        }
        match self
            .steps
            .binary_search_by_key(&step.from_version, |s| s.from_version)
        {
            Ok(_) => Err(MigrationError::DuplicateStep(step.from_version)),
            Err(idx) => {
                self.steps.insert(idx, step);
                Ok(())
            }
        }
    }

    /// Builder-style `register` for tables assembled at startup.
    pub fn with_step(
        mut self,
        from_version: u32,
        description: impl Into<String>,
        transform: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Result<Self, MigrationError> {
        self.register(MigrationStep::new(from_version, description, transform))?;
        Ok(self)
    }

    pub fn step_for(&self, from_version: u32) -> Option<&MigrationStep> {
        self.steps
            .binary_search_by_key(&from_version, |s| s.from_version)
            .ok()
            .map(|idx| &self.steps[idx])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check that every version in `1..current` has a step.
    pub fn validate(&self, current: u32) -> Result<(), MigrationError> {
        for version in 1..current {
            if self.step_for(version).is_none() {
                return Err(MigrationError::Incomplete {
                    missing: version,
                    target: current,
                });
            }
        }
        Ok(())
    }
}

/// Upgrade `snapshot` until it reaches `current`.
///
/// Already-current snapshots are returned untouched. If a step is missing the
/// chain stops immediately and the gap error carries the snapshot as far as it
/// got; it never skips ahead to `current`.
pub fn migrate(
    snapshot: Snapshot,
    table: &MigrationTable,
    current: u32,
) -> Result<Snapshot, MigrationError> {
    if snapshot.version > current {
        return Err(MigrationError::TooNew {
            found: snapshot.version,
            current,
        });
    }

    let mut snapshot = snapshot;
    while snapshot.version < current {
        let Some(step) = table.step_for(snapshot.version) else {
            tracing::warn!(
                "migration halted: no step from version {} towards {}",
                snapshot.version,
                current
            );
            return Err(MigrationError::Gap {
                missing: snapshot.version,
                target: current,
                partial: Box::new(snapshot),
            });
        };
        tracing::debug!(
            "applying migration {} -> {}: {}",
            step.from_version,
            step.from_version + 1,
            step.description
        );
        snapshot = step.apply(snapshot);
    }

    Ok(snapshot)
}
