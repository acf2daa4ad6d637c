//! Repository layer: the schema-modification capability handed to migrations.
//!
//! A [`QueryInterface`] is the only way a migration step touches the
//! database. Backends render DDL through their [`Dialect`] and classify
//! driver failures into [`DbError`].

pub mod error;
pub mod migrations;
#[cfg(feature = "postgres")]
pub mod pg_tls;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;
pub mod util;

use async_trait::async_trait;

pub use error::{DbError, DbResult};
pub use migrations::{AppliedMigration, MigrationError, MigrationStateStore, Migrator};
#[cfg(feature = "postgres")]
pub use postgres::PostgresQueryInterface;
pub use sqlite::SqliteQueryInterface;

/// SQL dialect of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Kind of constraint a migration can add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
}

/// A named constraint over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub fields: Vec<String>,
}

impl Constraint {
    pub fn unique(name: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: ConstraintKind::Unique,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// A uniqueness constraint as observed in the database catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConstraintInfo {
    pub name: String,
    /// Columns in declaration order.
    pub fields: Vec<String>,
}

/// Quote an identifier so mixed-case names like `companyId` survive.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quoted_list(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Dialect {
    /// DDL removing a named constraint from a table.
    ///
    /// SQLite cannot alter table constraints, so named uniqueness
    /// constraints live as named unique indexes there.
    pub fn remove_constraint_sql(&self, table: &str, name: &str) -> String {
        match self {
            Dialect::Sqlite => format!("DROP INDEX {}", quote_ident(name)),
            Dialect::Postgres => format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                quote_ident(table),
                quote_ident(name)
            ),
        }
    }

    /// DDL adding a constraint to a table.
    pub fn add_constraint_sql(&self, table: &str, constraint: &Constraint) -> String {
        let columns = quoted_list(&constraint.fields);
        match (self, constraint.kind) {
            (Dialect::Sqlite, ConstraintKind::Unique) => format!(
                "CREATE UNIQUE INDEX {} ON {} ({})",
                quote_ident(&constraint.name),
                quote_ident(table),
                columns
            ),
            (Dialect::Postgres, ConstraintKind::Unique) => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                quote_ident(table),
                quote_ident(&constraint.name),
                columns
            ),
        }
    }
}

/// Schema-modification capability bound to one database connection.
///
/// Transaction boundaries belong to whoever holds the interface; migration
/// steps only call the schema methods.
#[async_trait]
pub trait QueryInterface: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Execute one or more statements.
    async fn execute(&self, sql: &str) -> DbResult<()>;

    async fn table_exists(&self, table: &str) -> DbResult<bool>;

    /// List the uniqueness constraints on a table, sorted by name.
    async fn show_constraints(&self, table: &str) -> DbResult<Vec<ConstraintInfo>>;

    async fn remove_constraint(&self, table: &str, name: &str) -> DbResult<()> {
        self.execute(&self.dialect().remove_constraint_sql(table, name))
            .await
    }

    async fn add_constraint(&self, table: &str, constraint: &Constraint) -> DbResult<()> {
        self.execute(&self.dialect().add_constraint_sql(table, constraint))
            .await
    }

    async fn begin(&self) -> DbResult<()> {
        self.execute("BEGIN").await
    }

    async fn commit(&self) -> DbResult<()> {
        self.execute("COMMIT").await
    }

    async fn rollback(&self) -> DbResult<()> {
        self.execute("ROLLBACK").await
    }
}

/// A query interface for whichever backend the database URL names.
pub enum AnyQueryInterface {
    Sqlite(SqliteQueryInterface),
    #[cfg(feature = "postgres")]
    Postgres(PostgresQueryInterface),
}

impl AnyQueryInterface {
    /// Connect to a database URL (`sqlite:` path or `postgres://`).
    pub async fn connect(
        database_url: &str,
        no_tls: bool,
        migrations_table: &str,
    ) -> DbResult<Self> {
        if util::is_postgres_url(database_url) {
            return Self::connect_postgres(database_url, no_tls, migrations_table).await;
        }

        let path = database_url
            .strip_prefix("sqlite:")
            .unwrap_or(database_url)
            .to_string();
        let sqlite = SqliteQueryInterface::open(&path)
            .await?
            .with_migrations_table(migrations_table);
        Ok(AnyQueryInterface::Sqlite(sqlite))
    }

    #[cfg(feature = "postgres")]
    async fn connect_postgres(
        database_url: &str,
        no_tls: bool,
        migrations_table: &str,
    ) -> DbResult<Self> {
        let pg = PostgresQueryInterface::connect(database_url, no_tls)
            .await?
            .with_migrations_table(migrations_table);
        Ok(AnyQueryInterface::Postgres(pg))
    }

    #[cfg(not(feature = "postgres"))]
    async fn connect_postgres(
        _database_url: &str,
        _no_tls: bool,
        _migrations_table: &str,
    ) -> DbResult<Self> {
        Err(DbError::Connection(
            "PostgreSQL support not compiled. Use --features postgres".into(),
        ))
    }

    fn inner(&self) -> &dyn QueryInterface {
        match self {
            AnyQueryInterface::Sqlite(q) => q,
            #[cfg(feature = "postgres")]
            AnyQueryInterface::Postgres(q) => q,
        }
    }

    fn state(&self) -> &dyn MigrationStateStore {
        match self {
            AnyQueryInterface::Sqlite(q) => q,
            #[cfg(feature = "postgres")]
            AnyQueryInterface::Postgres(q) => q,
        }
    }
}

#[async_trait]
impl QueryInterface for AnyQueryInterface {
    fn dialect(&self) -> Dialect {
        self.inner().dialect()
    }

    async fn execute(&self, sql: &str) -> DbResult<()> {
        self.inner().execute(sql).await
    }

    async fn table_exists(&self, table: &str) -> DbResult<bool> {
        self.inner().table_exists(table).await
    }

    async fn show_constraints(&self, table: &str) -> DbResult<Vec<ConstraintInfo>> {
        self.inner().show_constraints(table).await
    }

    async fn remove_constraint(&self, table: &str, name: &str) -> DbResult<()> {
        self.inner().remove_constraint(table, name).await
    }

    async fn add_constraint(&self, table: &str, constraint: &Constraint) -> DbResult<()> {
        self.inner().add_constraint(table, constraint).await
    }
}

#[async_trait]
impl MigrationStateStore for AnyQueryInterface {
    async fn ensure_state_table(&self) -> DbResult<()> {
        self.state().ensure_state_table().await
    }

    async fn applied_migrations(&self) -> DbResult<Vec<AppliedMigration>> {
        self.state().applied_migrations().await
    }

    async fn mark_applied(&self, name: &str) -> DbResult<()> {
        self.state().mark_applied(name).await
    }

    async fn mark_unapplied(&self, name: &str) -> DbResult<()> {
        self.state().mark_unapplied(name).await
    }
}
