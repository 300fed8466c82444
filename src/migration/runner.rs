//! Migration runner
//!
//! Applies pending migrations against a live manager and keeps the stored
//! schema version and the migration history current after every step.

use crate::entry::now_millis;
use crate::error::{Result, StashError};
use crate::manager::StorageManager;

use super::{Direction, Migration, MigrationRecord, SchemaVersion};

/// Migrations strictly above `stored` and at most `target`, ascending
pub fn pending(
    migrations: &[Migration],
    stored: SchemaVersion,
    target: SchemaVersion,
) -> Vec<&Migration> {
    let mut steps: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.version > stored && m.version <= target)
        .collect();
    steps.sort_by_key(|m| m.version);
    steps
}

/// Drives the registered migrations of one manager
pub struct MigrationRunner<'a> {
    manager: &'a StorageManager,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(manager: &'a StorageManager) -> Self {
        Self { manager }
    }

    /// Apply every registered migration above the stored version
    ///
    /// The stored version ends at the higher of `target` and the last
    /// applied step. Returns the number of steps applied. The first failing
    /// step stops the run; the versions applied before it stay recorded.
    pub fn run(&self, target: SchemaVersion) -> Result<usize> {
        let stored = self.manager.stored_schema_version();
        let ceiling = self
            .manager
            .migrations()
            .iter()
            .map(|m| m.version)
            .fold(target, SchemaVersion::max);

        let steps = pending(self.manager.migrations(), stored, ceiling);
        if steps.is_empty() {
            if stored > target {
                tracing::warn!(
                    "Stored schema {} is newer than running schema {}, leaving it untouched",
                    stored,
                    target
                );
            }
            if stored < target {
                self.manager.set_stored_schema_version(target)?;
            }
            return Ok(0);
        }

        tracing::info!(
            "Migrating schema {} -> {} ({} steps)",
            stored,
            ceiling,
            steps.len()
        );
        if ceiling > target {
            tracing::warn!(
                "Migration {} is above running schema {}; stored schema follows the migrations",
                ceiling,
                target
            );
        }

        for migration in &steps {
            tracing::info!("Applying migration {}: {}", migration.version, migration.description);
            let outcome = migration.apply_up(self.manager);
            self.record(migration.version, Direction::Up, &outcome)?;

            if let Err(e) = outcome {
                return Err(StashError::Migration {
                    version: migration.version.to_string(),
                    reason: e.to_string(),
                });
            }
            self.manager.set_stored_schema_version(migration.version)?;
        }

        if self.manager.stored_schema_version() < target {
            self.manager.set_stored_schema_version(target)?;
        }

        Ok(steps.len())
    }

    /// Undo migrations down to `target`, newest first
    ///
    /// Every migration above `target` must carry a down step.
    pub fn rollback(&self, target: SchemaVersion) -> Result<usize> {
        let stored = self.manager.stored_schema_version();
        if target >= stored {
            return Ok(0);
        }

        let mut steps = pending(self.manager.migrations(), target, stored);
        steps.reverse();

        for migration in &steps {
            tracing::info!("Rolling back migration {}: {}", migration.version, migration.description);

            let outcome = match migration.apply_down(self.manager) {
                Some(outcome) => outcome,
                None => Err(StashError::Migration {
                    version: migration.version.to_string(),
                    reason: "migration has no down step".to_string(),
                }),
            };
            self.record(migration.version, Direction::Down, &outcome)?;

            if let Err(e) = outcome {
                return Err(match e {
                    e @ StashError::Migration { .. } => e,
                    e => StashError::Migration {
                        version: migration.version.to_string(),
                        reason: e.to_string(),
                    },
                });
            }

            let below = self
                .manager
                .migrations()
                .iter()
                .map(|m| m.version)
                .filter(|v| *v < migration.version)
                .max()
                .unwrap_or(SchemaVersion::INITIAL);
            self.manager.set_stored_schema_version(below.max(target))?;
        }

        self.manager.set_stored_schema_version(target)?;
        Ok(steps.len())
    }

    fn record(&self, version: SchemaVersion, direction: Direction, outcome: &Result<()>) -> Result<()> {
        self.manager.record_migration(MigrationRecord {
            version,
            direction,
            timestamp: now_millis(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        })
    }
}
