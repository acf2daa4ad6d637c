//! Schema migration steps.
//!
//! Each step is registered here and applied in name order, so names carry a
//! `YYYYMMDDHHMMSS-` prefix.

mod m20251202120000_remove_color_unique_constraint;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::repository::{DbResult, MigrationError, QueryInterface};

pub use m20251202120000_remove_color_unique_constraint::RemoveColorUniqueConstraint;

/// A reversible unit of schema change.
///
/// Steps mutate schema only through the query interface they are handed;
/// the runner owns connections and transactions.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn up(&self, query_interface: &dyn QueryInterface) -> DbResult<()>;

    async fn down(&self, query_interface: &dyn QueryInterface) -> DbResult<()>;
}

/// Registered migration steps, ordered by name.
#[derive(Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<&'static str, Box<dyn MigrationStep>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: impl MigrationStep + 'static) -> Result<(), MigrationError> {
        let name = step.name();
        if self.steps.contains_key(name) {
            return Err(MigrationError::DuplicateMigration(name.to_string()));
        }
        self.steps.insert(name, Box::new(step));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn MigrationStep> {
        self.steps.get(name).map(|s| s.as_ref())
    }

    /// Steps in application order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn MigrationStep> {
        self.steps.values().map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub fn registry() -> Result<MigrationRegistry, MigrationError> {
    let mut reg = MigrationRegistry::new();
    reg.register(m20251202120000_remove_color_unique_constraint::migration())?;
    Ok(reg)
}
