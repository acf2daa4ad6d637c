//! PostgreSQL query interface over a single tokio-postgres client.

use std::error::Error;

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use super::migrations::{AppliedMigration, MigrationStateStore, DEFAULT_MIGRATIONS_TABLE};
use super::util::parse_datetime;
use super::{quote_ident, Constraint, ConstraintInfo, DbError, DbResult, Dialect, QueryInterface};

pub struct PostgresQueryInterface {
    client: Client,
    migrations_table: String,
}

impl PostgresQueryInterface {
    pub async fn connect(database_url: &str, no_tls: bool) -> DbResult<Self> {
        let client = super::pg_tls::connect_raw(database_url, no_tls)
            .await
            .map_err(|e| DbError::Connection(error_message(&e)))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }

    pub fn with_migrations_table(mut self, table: &str) -> Self {
        self.migrations_table = table.to_string();
        self
    }
}

/// Extract the real message from a tokio-postgres error.
///
/// The Display impl only says "db error" for server-side failures.
fn error_message(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        format!(
            "{}: {}{}{}",
            db_err.severity(),
            db_err.message(),
            db_err
                .detail()
                .map(|d| format!(" DETAIL: {}", d))
                .unwrap_or_default(),
            db_err
                .hint()
                .map(|h| format!(" HINT: {}", h))
                .unwrap_or_default(),
        )
    } else {
        let mut msg = e.to_string();
        let mut source = e.source();
        while let Some(src) = source {
            msg = format!("{}: {}", msg, src);
            source = src.source();
        }
        msg
    }
}

/// What a failed statement was aimed at, when the caller knows.
#[derive(Debug, Default, Clone, Copy)]
struct Target<'a> {
    table: Option<&'a str>,
    constraint: Option<&'a str>,
}

/// Map a SQLSTATE onto the shared taxonomy. `None` means the failure never
/// reached the server.
fn classify_state(code: Option<&SqlState>, message: String, target: Target<'_>) -> DbError {
    let Some(code) = code else {
        return DbError::Connection(message);
    };

    if let (Some(table), Some(name)) = (target.table, target.constraint) {
        if *code == SqlState::UNDEFINED_OBJECT {
            return DbError::constraint_not_found(table, name);
        }
        if *code == SqlState::DUPLICATE_TABLE || *code == SqlState::DUPLICATE_OBJECT {
            return DbError::constraint_already_exists(table, name);
        }
    }

    if *code == SqlState::UNIQUE_VIOLATION {
        DbError::UniqueViolation(message)
    } else if *code == SqlState::UNDEFINED_TABLE {
        let table = match target.table {
            Some(table) => table.to_string(),
            None => missing_relation(&message).unwrap_or(message),
        };
        DbError::TableNotFound(table)
    } else {
        DbError::Query(message)
    }
}

/// Pull the relation name out of `relation "X" does not exist`.
fn missing_relation(message: &str) -> Option<String> {
    let (_, rest) = message.split_once("relation \"")?;
    let (name, _) = rest.split_once('"')?;
    Some(name.to_string())
}

fn classify(e: tokio_postgres::Error) -> DbError {
    classify_state(e.code(), error_message(&e), Target::default())
}

/// Classify a failure of a statement against a known table.
fn classify_table(e: tokio_postgres::Error, table: &str) -> DbError {
    let target = Target {
        table: Some(table),
        constraint: None,
    };
    classify_state(e.code(), error_message(&e), target)
}

/// Classify a constraint DDL failure with the table and constraint it targeted.
fn classify_constraint(e: tokio_postgres::Error, table: &str, name: &str) -> DbError {
    let target = Target {
        table: Some(table),
        constraint: Some(name),
    };
    classify_state(e.code(), error_message(&e), target)
}

#[async_trait]
impl QueryInterface for PostgresQueryInterface {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str) -> DbResult<()> {
        self.client.batch_execute(sql).await.map_err(classify)
    }

    async fn table_exists(&self, table: &str) -> DbResult<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1)",
                &[&table],
            )
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }

    async fn show_constraints(&self, table: &str) -> DbResult<Vec<ConstraintInfo>> {
        if !self.table_exists(table).await? {
            return Err(DbError::TableNotFound(table.to_string()));
        }

        let rows = self
            .client
            .query(
                "SELECT tc.constraint_name::text, kcu.column_name::text \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                  AND tc.table_name = kcu.table_name \
                 WHERE tc.table_schema = current_schema() \
                   AND tc.table_name = $1 \
                   AND tc.constraint_type = 'UNIQUE' \
                 ORDER BY tc.constraint_name, kcu.ordinal_position",
                &[&table],
            )
            .await
            .map_err(|e| classify_table(e, table))?;

        let mut constraints: Vec<ConstraintInfo> = Vec::new();
        for row in rows {
            let name: String = row.get(0);
            let column: String = row.get(1);
            match constraints.last_mut() {
                Some(last) if last.name == name => last.fields.push(column),
                _ => constraints.push(ConstraintInfo {
                    name,
                    fields: vec![column],
                }),
            }
        }

        Ok(constraints)
    }

    async fn remove_constraint(&self, table: &str, name: &str) -> DbResult<()> {
        let sql = Dialect::Postgres.remove_constraint_sql(table, name);
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| classify_constraint(e, table, name))
    }

    async fn add_constraint(&self, table: &str, constraint: &Constraint) -> DbResult<()> {
        let sql = Dialect::Postgres.add_constraint_sql(table, constraint);
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| classify_constraint(e, table, &constraint.name))
    }
}

#[async_trait]
impl MigrationStateStore for PostgresQueryInterface {
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
        let rows = self.client.query(&sql, &[]).await.map_err(classify)?;

        Ok(rows
            .iter()
            .map(|row| AppliedMigration {
                name: row.get(0),
                applied_at: parse_datetime(row.get(1)),
            })
            .collect())
    }

    async fn mark_applied(&self, name: &str) -> DbResult<()> {
        let sql = format!(
            "INSERT INTO {} (name, applied_at) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            quote_ident(&self.migrations_table)
        );
        let now = chrono::Utc::now().to_rfc3339();
        self.client
            .execute(&sql, &[&name, &now])
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn mark_unapplied(&self, name: &str) -> DbResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE name = $1",
            quote_ident(&self.migrations_table)
        );
        self.client
            .execute(&sql, &[&name])
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues_color_key() -> Target<'static> {
        Target {
            table: Some("Queues"),
            constraint: Some("Queues_color_key"),
        }
    }

    #[test]
    fn test_no_code_is_connection_error() {
        let err = classify_state(None, "connection refused".into(), queues_color_key());
        assert!(err.is_connection());
    }

    #[test]
    fn test_undefined_object_is_constraint_not_found() {
        let err = classify_state(
            Some(&SqlState::UNDEFINED_OBJECT),
            "ERROR: constraint \"Queues_color_key\" of relation \"Queues\" does not exist".into(),
            queues_color_key(),
        );
        match err {
            DbError::ConstraintNotFound { table, name } => {
                assert_eq!(table, "Queues");
                assert_eq!(name, "Queues_color_key");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_duplicates_are_constraint_already_exists() {
        for code in [SqlState::DUPLICATE_TABLE, SqlState::DUPLICATE_OBJECT] {
            let err = classify_state(
                Some(&code),
                "ERROR: relation \"Queues_color_key\" already exists".into(),
                queues_color_key(),
            );
            assert!(
                matches!(err, DbError::ConstraintAlreadyExists { ref name, .. } if name == "Queues_color_key"),
                "{:?} gave {:?}",
                code,
                err
            );
        }
    }

    #[test]
    fn test_undefined_table_carries_table_name() {
        let message = "ERROR: relation \"Queues\" does not exist".to_string();

        let err = classify_state(
            Some(&SqlState::UNDEFINED_TABLE),
            message.clone(),
            queues_color_key(),
        );
        assert!(matches!(err, DbError::TableNotFound(ref t) if t == "Queues"));

        // Without a known target the name comes from the server message.
        let err = classify_state(Some(&SqlState::UNDEFINED_TABLE), message, Target::default());
        assert!(matches!(err, DbError::TableNotFound(ref t) if t == "Queues"));
    }

    #[test]
    fn test_unique_violation() {
        let err = classify_state(
            Some(&SqlState::UNIQUE_VIOLATION),
            "ERROR: could not create unique index \"Queues_color_key\"".into(),
            queues_color_key(),
        );
        assert!(matches!(err, DbError::UniqueViolation(_)));
    }

    #[test]
    fn test_other_codes_are_query_errors() {
        let err = classify_state(
            Some(&SqlState::SYNTAX_ERROR),
            "ERROR: syntax error".into(),
            queues_color_key(),
        );
        assert!(matches!(err, DbError::Query(ref m) if m == "ERROR: syntax error"));

        // Duplicate object outside constraint DDL stays a plain query error.
        let err = classify_state(
            Some(&SqlState::DUPLICATE_OBJECT),
            "ERROR: duplicate".into(),
            Target::default(),
        );
        assert!(matches!(err, DbError::Query(_)));

        let table_only = Target {
            table: Some("Queues"),
            constraint: None,
        };
        let err = classify_state(
            Some(&SqlState::UNDEFINED_OBJECT),
            "ERROR: type does not exist".into(),
            table_only,
        );
        assert!(matches!(err, DbError::Query(_)));
    }

    #[test]
    fn test_missing_relation() {
        assert_eq!(
            missing_relation("ERROR: relation \"Queues\" does not exist").as_deref(),
            Some("Queues")
        );
        assert_eq!(missing_relation("ERROR: something else"), None);
    }
}
