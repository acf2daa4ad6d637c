//! Migration runner.
//!
//! Applies and reverts registered steps, each inside its own transaction,
//! and records applied steps in a state table in that same transaction.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use super::{DbError, DbResult, QueryInterface};
use crate::migrations::{MigrationRegistry, MigrationStep};

/// Default name of the table recording applied migrations.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("Migration {name} failed ({direction}): {source}")]
    Step {
        name: String,
        direction: Direction,
        source: DbError,
    },
    #[error("Applied migration {0} is not registered")]
    UnknownMigration(String),
    #[error("Duplicate migration name: {0}")]
    DuplicateMigration(String),
}

/// A row of the migration state table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// State of one migration as reported by [`Migrator::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
    /// False when the state table names a step the registry does not know.
    pub registered: bool,
}

impl MigrationStatus {
    pub fn is_pending(&self) -> bool {
        self.registered && self.applied_at.is_none()
    }
}

/// Storage for which migrations have been applied.
#[async_trait]
pub trait MigrationStateStore: Send + Sync {
    async fn ensure_state_table(&self) -> DbResult<()>;

    /// Applied migrations ordered by name.
    async fn applied_migrations(&self) -> DbResult<Vec<AppliedMigration>>;

    async fn mark_applied(&self, name: &str) -> DbResult<()>;

    async fn mark_unapplied(&self, name: &str) -> DbResult<()>;
}

pub struct Migrator<'a, Q> {
    registry: &'a MigrationRegistry,
    db: &'a Q,
}

impl<'a, Q> Migrator<'a, Q>
where
    Q: QueryInterface + MigrationStateStore,
{
    pub fn new(registry: &'a MigrationRegistry, db: &'a Q) -> Self {
        Self { registry, db }
    }

    /// Every registered step plus any applied step missing from the registry.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>, MigrationError> {
        self.db.ensure_state_table().await?;
        let applied = self.db.applied_migrations().await?;

        let mut statuses: Vec<MigrationStatus> = self
            .registry
            .iter()
            .map(|step| MigrationStatus {
                name: step.name().to_string(),
                applied_at: applied
                    .iter()
                    .find(|a| a.name == step.name())
                    .map(|a| a.applied_at),
                registered: true,
            })
            .collect();

        for a in applied {
            if self.registry.get(&a.name).is_none() {
                statuses.push(MigrationStatus {
                    name: a.name,
                    applied_at: Some(a.applied_at),
                    registered: false,
                });
            }
        }

        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    /// Names of registered steps not yet applied, in order.
    pub async fn pending(&self) -> Result<Vec<String>, MigrationError> {
        Ok(self
            .status()
            .await?
            .into_iter()
            .filter(MigrationStatus::is_pending)
            .map(|s| s.name)
            .collect())
    }

    /// Apply all pending steps in order. Stops at the first failure.
    pub async fn migrate_forward(&self) -> Result<Vec<String>, MigrationError> {
        self.db.ensure_state_table().await?;
        let applied: HashSet<String> = self
            .db
            .applied_migrations()
            .await?
            .into_iter()
            .map(|a| a.name)
            .collect();

        let mut ran = Vec::new();
        for step in self.registry.iter() {
            if applied.contains(step.name()) {
                continue;
            }

            info!("Applying migration: {}", step.name());
            self.run_step(step, Direction::Up).await?;
            ran.push(step.name().to_string());
        }

        if ran.is_empty() {
            info!("No pending migrations");
        }

        Ok(ran)
    }

    /// Revert the `steps` most recently applied migrations, newest first.
    pub async fn migrate_backward(&self, steps: usize) -> Result<Vec<String>, MigrationError> {
        self.db.ensure_state_table().await?;
        let mut applied = self.db.applied_migrations().await?;
        applied.sort_by(|a, b| b.name.cmp(&a.name));

        let targets: Vec<&dyn MigrationStep> = applied
            .iter()
            .take(steps)
            .map(|a| {
                self.registry
                    .get(&a.name)
                    .ok_or_else(|| MigrationError::UnknownMigration(a.name.clone()))
            })
            .collect::<Result<_, _>>()?;

        let mut reverted = Vec::new();
        for step in targets {
            info!("Reverting migration: {}", step.name());
            self.run_step(step, Direction::Down).await?;
            reverted.push(step.name().to_string());
        }

        if reverted.is_empty() {
            info!("No applied migrations to revert");
        }

        Ok(reverted)
    }

    async fn run_step(
        &self,
        step: &dyn MigrationStep,
        direction: Direction,
    ) -> Result<(), MigrationError> {
        let query_interface: &dyn QueryInterface = self.db;
        let name = step.name();

        query_interface.begin().await?;

        let result = match direction {
            Direction::Up => match step.up(query_interface).await {
                Ok(()) => self.db.mark_applied(name).await,
                Err(e) => Err(e),
            },
            Direction::Down => match step.down(query_interface).await {
                Ok(()) => self.db.mark_unapplied(name).await,
                Err(e) => Err(e),
            },
        };

        let result = match result {
            Ok(()) => query_interface.commit().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                if let Err(e) = query_interface.rollback().await {
                    warn!("Rollback of {} failed: {}", name, e);
                }
                Err(MigrationError::Step {
                    name: name.to_string(),
                    direction,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::migrations::registry;
    use crate::repository::{ConstraintInfo, Dialect, SqliteQueryInterface};

    /// SQLite interface whose COMMIT always fails, as under a busy database.
    struct BusyCommit {
        inner: SqliteQueryInterface,
        rollbacks: Mutex<usize>,
    }

    #[async_trait]
    impl QueryInterface for BusyCommit {
        fn dialect(&self) -> Dialect {
            self.inner.dialect()
        }

        async fn execute(&self, sql: &str) -> DbResult<()> {
            self.inner.execute(sql).await
        }

        async fn table_exists(&self, table: &str) -> DbResult<bool> {
            self.inner.table_exists(table).await
        }

        async fn show_constraints(&self, table: &str) -> DbResult<Vec<ConstraintInfo>> {
            self.inner.show_constraints(table).await
        }

        async fn remove_constraint(&self, table: &str, name: &str) -> DbResult<()> {
            self.inner.remove_constraint(table, name).await
        }

        async fn commit(&self) -> DbResult<()> {
            Err(DbError::Connection("database is locked".into()))
        }

        async fn rollback(&self) -> DbResult<()> {
            *self.rollbacks.lock().unwrap() += 1;
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl MigrationStateStore for BusyCommit {
        async fn ensure_state_table(&self) -> DbResult<()> {
            self.inner.ensure_state_table().await
        }

        async fn applied_migrations(&self) -> DbResult<Vec<AppliedMigration>> {
            self.inner.applied_migrations().await
        }

        async fn mark_applied(&self, name: &str) -> DbResult<()> {
            self.inner.mark_applied(name).await
        }

        async fn mark_unapplied(&self, name: &str) -> DbResult<()> {
            self.inner.mark_unapplied(name).await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let inner = SqliteQueryInterface::open_in_memory().unwrap();
        inner
            .execute(
                r#"CREATE TABLE "Queues" ("id" INTEGER PRIMARY KEY, "color" TEXT, "companyId" INTEGER);
                CREATE UNIQUE INDEX "Queues_color_key" ON "Queues" ("color", "companyId");"#,
            )
            .await
            .unwrap();
        let db = BusyCommit {
            inner: inner.clone(),
            rollbacks: Mutex::new(0),
        };
        let reg = registry().unwrap();

        let err = Migrator::new(&reg, &db).migrate_forward().await.unwrap_err();
        match err {
            MigrationError::Step {
                direction, source, ..
            } => {
                assert_eq!(direction, Direction::Up);
                assert!(source.is_connection());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(*db.rollbacks.lock().unwrap(), 1);

        // Connection is usable again and nothing from the step stuck.
        assert!(inner.applied_migrations().await.unwrap().is_empty());
        assert_eq!(inner.show_constraints("Queues").await.unwrap().len(), 1);
        inner.begin().await.unwrap();
        inner.rollback().await.unwrap();
    }
}
