//! Drop the `Queues_color_key` uniqueness constraint so queue colors are no
//! longer globally unique. Reverting restores it scoped per company.

use async_trait::async_trait;

use super::MigrationStep;
use crate::repository::{Constraint, DbResult, QueryInterface};

pub const TABLE: &str = "Queues";
pub const CONSTRAINT_NAME: &str = "Queues_color_key";
/// Columns of the constraint recreated by `down`.
pub const SCOPED_FIELDS: [&str; 2] = ["color", "companyId"];

pub struct RemoveColorUniqueConstraint;

pub fn migration() -> RemoveColorUniqueConstraint {
    RemoveColorUniqueConstraint
}

#[async_trait]
impl MigrationStep for RemoveColorUniqueConstraint {
    fn name(&self) -> &'static str {
        "20251202120000-remove-color-unique-constraint"
    }

    async fn up(&self, query_interface: &dyn QueryInterface) -> DbResult<()> {
        query_interface
            .remove_constraint(TABLE, CONSTRAINT_NAME)
            .await
    }

    async fn down(&self, query_interface: &dyn QueryInterface) -> DbResult<()> {
        query_interface
            .add_constraint(TABLE, &Constraint::unique(CONSTRAINT_NAME, &SCOPED_FIELDS))
            .await
    }
}
