//! SQLite query interface.
//!
//! rusqlite is blocking, so every call runs on a blocking task against a
//! shared connection. SQLite cannot add or drop table constraints after
//! creation; a named uniqueness constraint is a named unique index.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension};

use super::migrations::{AppliedMigration, MigrationStateStore, DEFAULT_MIGRATIONS_TABLE};
use super::util::parse_datetime;
use super::{quote_ident, Constraint, ConstraintInfo, DbError, DbResult, Dialect, QueryInterface};

#[derive(Clone)]
pub struct SqliteQueryInterface {
    conn: Arc<Mutex<Connection>>,
    migrations_table: String,
}

impl SqliteQueryInterface {
    /// Open (or create) a database file.
    pub async fn open(path: &str) -> DbResult<Self> {
        let path = path.to_string();
        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await?
            .map_err(|e| DbError::Connection(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Connection::open_in_memory()
            .map(Self::from_connection)
            .map_err(|e| DbError::Connection(e.to_string()))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }

    /// Record applied migrations in a different table.
    pub fn with_migrations_table(mut self, table: &str) -> Self {
        self.migrations_table = table.to_string();
        self
    }

    /// Run a closure against the connection on a blocking task.
    pub async fn with_conn<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| DbError::Connection("sqlite connection lock poisoned".into()))?;
            f(&conn)
        })
        .await?
    }
}

/// Map a rusqlite error onto the shared taxonomy.
fn classify(e: rusqlite::Error) -> DbError {
    match e {
        rusqlite::Error::SqliteFailure(err, msg) => {
            let msg = msg.unwrap_or_else(|| err.to_string());
            match err.code {
                ErrorCode::ConstraintViolation if msg.contains("UNIQUE") => {
                    DbError::UniqueViolation(msg)
                }
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked => DbError::Connection(msg),
                _ => match msg.strip_prefix("no such table: ") {
                    Some(table) => {
                        DbError::TableNotFound(table.trim_start_matches("main.").to_string())
                    }
                    None => DbError::Query(msg),
                },
            }
        }
        other => DbError::Query(other.to_string()),
    }
}

fn table_exists_sync(conn: &Connection, table: &str) -> DbResult<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        [table],
        |row| row.get(0),
    )
    .map_err(classify)
}

#[async_trait]
impl QueryInterface for SqliteQueryInterface {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str) -> DbResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(classify))
            .await
    }

    async fn table_exists(&self, table: &str) -> DbResult<bool> {
        let table = table.to_string();
        self.with_conn(move |conn| table_exists_sync(conn, &table))
            .await
    }

    async fn show_constraints(&self, table: &str) -> DbResult<Vec<ConstraintInfo>> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            if !table_exists_sync(conn, &table)? {
                return Err(DbError::TableNotFound(table));
            }

            let mut stmt = conn
                .prepare(&format!("PRAGMA index_list({})", quote_ident(&table)))
                .map_err(classify)?;
            let unique_indexes: Vec<String> = stmt
                .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, bool>(2)?)))
                .map_err(classify)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(classify)?
                .into_iter()
                .filter_map(|(name, unique)| unique.then_some(name))
                .collect();

            let mut constraints = Vec::with_capacity(unique_indexes.len());
            for name in unique_indexes {
                let mut pragma = conn
                    .prepare(&format!("PRAGMA index_info({})", quote_ident(&name)))
                    .map_err(classify)?;
                let fields = pragma
                    .query_map([], |row| {
                        // NULL for expression columns
                        row.get::<_, Option<String>>(2)
                            .map(|opt| opt.unwrap_or_else(|| "<expr>".to_string()))
                    })
                    .map_err(classify)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(classify)?;
                constraints.push(ConstraintInfo { name, fields });
            }

            constraints.sort();
            Ok(constraints)
        })
        .await
    }

    async fn remove_constraint(&self, table: &str, name: &str) -> DbResult<()> {
        let table = table.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            if !table_exists_sync(conn, &table)? {
                return Err(DbError::TableNotFound(table));
            }

            // DROP INDEX is not scoped to a table; make sure the index is ours.
            let owner: Option<String> = conn
                .query_row(
                    "SELECT tbl_name FROM sqlite_master WHERE type = 'index' AND name = ?1",
                    [&name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(classify)?;
            if !owner.is_some_and(|t| t.eq_ignore_ascii_case(&table)) {
                return Err(DbError::constraint_not_found(&table, &name));
            }

            conn.execute_batch(&Dialect::Sqlite.remove_constraint_sql(&table, &name))
                .map_err(classify)
        })
        .await
    }

    async fn add_constraint(&self, table: &str, constraint: &Constraint) -> DbResult<()> {
        let table = table.to_string();
        let constraint = constraint.clone();
        self.with_conn(move |conn| {
            if !table_exists_sync(conn, &table)? {
                return Err(DbError::TableNotFound(table));
            }

            conn.execute_batch(&Dialect::Sqlite.add_constraint_sql(&table, &constraint))
                .map_err(|e| match classify(e) {
                    DbError::Query(msg) if msg.contains("already exists") => {
                        DbError::constraint_already_exists(&table, &constraint.name)
                    }
                    other => other,
                })
        })
        .await
    }
}

#[async_trait]
impl MigrationStateStore for SqliteQueryInterface {
    async fn ensure_state_table(&self) -> DbResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY NOT NULL,
                applied_at TEXT NOT NULL
            )",
            quote_ident(&self.migrations_table)
        );
        self.execute(&sql).await
    }

    async fn applied_migrations(&self) -> DbResult<Vec<AppliedMigration>> {
        let sql = format!(
            "SELECT name, applied_at FROM {} ORDER BY name",
            quote_ident(&self.migrations_table)
        );
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(classify)?;
            let rows = stmt
                .query_map([], |row| {
                    let name: String = row.get(0)?;
                    let applied_at: String = row.get(1)?;
                    Ok(AppliedMigration {
                        name,
                        applied_at: parse_datetime(&applied_at),
                    })
                })
                .map_err(classify)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(classify)?;
            Ok(rows)
        })
        .await
    }

    async fn mark_applied(&self, name: &str) -> DbResult<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (name, applied_at) VALUES (?1, ?2)",
            quote_ident(&self.migrations_table)
        );
        let name = name.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(&sql, [&name, &now]).map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn mark_unapplied(&self, name: &str) -> DbResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE name = ?1",
            quote_ident(&self.migrations_table)
        );
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(&sql, [&name]).map_err(classify)?;
            Ok(())
        })
        .await
    }
}
