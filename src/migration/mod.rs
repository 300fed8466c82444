//! Migration Module
//!
//! Versioned, ordered transformations of stored data.
//!
//! ## Responsibilities
//! - Compare the stored schema version against the running one
//! - Apply pending `up` steps in ascending version order
//! - Record every attempt (success or failure) in a history
//! - Roll back through `down` steps to an older version
//!
//! A failed migration is fatal to initialization: running on top of a
//! half-migrated, incompatible schema is never allowed.

mod runner;
mod version;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::manager::StorageManager;

pub use runner::{pending, MigrationRunner};
pub use version::SchemaVersion;

/// A migration step body
pub type MigrationFn = Arc<dyn Fn(&StorageManager) -> Result<()> + Send + Sync>;

/// One registered migration
///
/// Cloning shares the step bodies.
#[derive(Clone)]
pub struct Migration {
    pub version: SchemaVersion,
    pub description: String,
    up: MigrationFn,
    down: Option<MigrationFn>,
}

impl Migration {
    pub fn new<F>(version: SchemaVersion, description: impl Into<String>, up: F) -> Self
    where
        F: Fn(&StorageManager) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            version,
            description: description.into(),
            up: Arc::new(up),
            down: None,
        }
    }

    /// Attach the step that undoes this migration
    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: Fn(&StorageManager) -> Result<()> + Send + Sync + 'static,
    {
        self.down = Some(Arc::new(down));
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    pub(crate) fn apply_up(&self, manager: &StorageManager) -> Result<()> {
        (self.up)(manager)
    }

    pub(crate) fn apply_down(&self, manager: &StorageManager) -> Option<Result<()>> {
        self.down.as_ref().map(|down| down(manager))
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("reversible", &self.is_reversible())
            .finish()
    }
}

/// Which way a migration step ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// One attempt to apply a migration step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: SchemaVersion,
    pub direction: Direction,
    pub timestamp: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
