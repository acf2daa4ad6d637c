//! Queues color constraint tests
//!
//! Runs the color constraint step against a real SQLite schema and checks
//! the resulting constraints and row-level behavior.

use queue_schema::migrations::{MigrationStep, RemoveColorUniqueConstraint};
use queue_schema::repository::{ConstraintInfo, DbError, QueryInterface, SqliteQueryInterface};

const NAME: &str = "Queues_color_key";

/// Create the Queues table with no uniqueness on color.
async fn queues_table() -> SqliteQueryInterface {
    let qi = SqliteQueryInterface::open_in_memory().unwrap();
    qi.execute(
        r#"CREATE TABLE "Queues" (
            "id" INTEGER PRIMARY KEY,
            "name" TEXT NOT NULL,
            "color" TEXT NOT NULL,
            "companyId" INTEGER
        )"#,
    )
    .await
    .unwrap();
    qi
}

/// Queues table already carrying the scoped color constraint.
async fn constrained_queues() -> SqliteQueryInterface {
    let qi = queues_table().await;
    qi.execute(r#"CREATE UNIQUE INDEX "Queues_color_key" ON "Queues" ("color", "companyId")"#)
        .await
        .unwrap();
    qi
}

async fn insert_queue(
    qi: &SqliteQueryInterface,
    name: &str,
    color: &str,
    company_id: i64,
) -> Result<(), DbError> {
    qi.execute(&format!(
        r#"INSERT INTO "Queues" ("name", "color", "companyId") VALUES ('{}', '{}', {})"#,
        name, color, company_id
    ))
    .await
}

async fn queue_count(qi: &SqliteQueryInterface) -> i64 {
    qi.with_conn(|conn| {
        conn.query_row(r#"SELECT COUNT(*) FROM "Queues""#, [], |row| row.get(0))
            .map_err(|e| DbError::Query(e.to_string()))
    })
    .await
    .unwrap()
}

fn scoped_constraint() -> ConstraintInfo {
    ConstraintInfo {
        name: NAME.to_string(),
        fields: vec!["color".to_string(), "companyId".to_string()],
    }
}

fn has_color_key(constraints: &[ConstraintInfo]) -> bool {
    constraints.iter().any(|c| c.name == NAME)
}

#[tokio::test]
async fn up_allows_duplicate_colors_in_one_company() {
    // Single-column uniqueness on color is the pre-migration shape seen in the field.
    let qi = queues_table().await;
    qi.execute(r#"CREATE UNIQUE INDEX "Queues_color_key" ON "Queues" ("color")"#)
        .await
        .unwrap();
    insert_queue(&qi, "Sales", "#FF0000", 1).await.unwrap();
    let err = insert_queue(&qi, "Support", "#FF0000", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UniqueViolation(_)));

    RemoveColorUniqueConstraint.up(&qi).await.unwrap();

    insert_queue(&qi, "Support", "#FF0000", 1).await.unwrap();
    assert_eq!(queue_count(&qi).await, 2);
    assert!(!has_color_key(&qi.show_constraints("Queues").await.unwrap()));
}

#[tokio::test]
async fn down_fails_on_duplicate_pairs_and_changes_nothing() {
    let qi = constrained_queues().await;
    RemoveColorUniqueConstraint.up(&qi).await.unwrap();
    insert_queue(&qi, "Sales", "#FF0000", 1).await.unwrap();
    insert_queue(&qi, "Support", "#FF0000", 1).await.unwrap();

    let err = RemoveColorUniqueConstraint.down(&qi).await.unwrap_err();
    assert!(matches!(err, DbError::UniqueViolation(_)), "got {err:?}");

    assert!(qi.show_constraints("Queues").await.unwrap().is_empty());
    assert_eq!(queue_count(&qi).await, 2);
}

#[tokio::test]
async fn down_scopes_uniqueness_per_company() {
    let qi = constrained_queues().await;
    RemoveColorUniqueConstraint.up(&qi).await.unwrap();
    insert_queue(&qi, "Sales", "#FF0000", 1).await.unwrap();
    insert_queue(&qi, "Sales", "#FF0000", 2).await.unwrap();

    RemoveColorUniqueConstraint.down(&qi).await.unwrap();

    assert_eq!(
        qi.show_constraints("Queues").await.unwrap(),
        vec![scoped_constraint()]
    );
    let err = insert_queue(&qi, "Support", "#FF0000", 2)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UniqueViolation(_)));
    insert_queue(&qi, "Support", "#FF0000", 3).await.unwrap();
    assert_eq!(queue_count(&qi).await, 3);
}

#[tokio::test]
async fn up_then_down_restores_constraint_set() {
    let qi = constrained_queues().await;
    qi.execute(r#"CREATE UNIQUE INDEX "Queues_name_key" ON "Queues" ("name", "companyId")"#)
        .await
        .unwrap();
    let before = qi.show_constraints("Queues").await.unwrap();

    RemoveColorUniqueConstraint.up(&qi).await.unwrap();
    let after_up = qi.show_constraints("Queues").await.unwrap();
    assert_eq!(after_up.len(), 1);
    assert_eq!(after_up[0].name, "Queues_name_key");

    RemoveColorUniqueConstraint.down(&qi).await.unwrap();
    assert_eq!(qi.show_constraints("Queues").await.unwrap(), before);
}

#[tokio::test]
async fn down_then_up_restores_constraint_set() {
    let qi = queues_table().await;
    let before = qi.show_constraints("Queues").await.unwrap();

    RemoveColorUniqueConstraint.down(&qi).await.unwrap();
    assert_eq!(
        qi.show_constraints("Queues").await.unwrap(),
        vec![scoped_constraint()]
    );

    RemoveColorUniqueConstraint.up(&qi).await.unwrap();
    assert_eq!(qi.show_constraints("Queues").await.unwrap(), before);
}

#[tokio::test]
async fn up_twice_reports_missing_constraint() {
    let qi = constrained_queues().await;
    RemoveColorUniqueConstraint.up(&qi).await.unwrap();

    let err = RemoveColorUniqueConstraint.up(&qi).await.unwrap_err();
    match err {
        DbError::ConstraintNotFound { table, name } => {
            assert_eq!(table, "Queues");
            assert_eq!(name, NAME);
        }
        other => panic!("expected ConstraintNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn down_twice_reports_existing_constraint() {
    let qi = queues_table().await;
    RemoveColorUniqueConstraint.down(&qi).await.unwrap();

    let err = RemoveColorUniqueConstraint.down(&qi).await.unwrap_err();
    assert!(
        matches!(err, DbError::ConstraintAlreadyExists { ref name, .. } if name == NAME),
        "got {err:?}"
    );
    assert_eq!(
        qi.show_constraints("Queues").await.unwrap(),
        vec![scoped_constraint()]
    );
}

#[tokio::test]
async fn missing_queues_table() {
    let qi = SqliteQueryInterface::open_in_memory().unwrap();

    let err = RemoveColorUniqueConstraint.up(&qi).await.unwrap_err();
    assert!(matches!(err, DbError::TableNotFound(ref t) if t == "Queues"));

    let err = RemoveColorUniqueConstraint.down(&qi).await.unwrap_err();
    assert!(matches!(err, DbError::TableNotFound(ref t) if t == "Queues"));
}
