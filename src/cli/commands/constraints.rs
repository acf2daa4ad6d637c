//! Constraint inspection command.

use console::style;

use queue_schema::config::Settings;
use queue_schema::repository::QueryInterface;

use super::migrate::open_database;

/// Print the uniqueness constraints on a table.
pub async fn cmd_constraints(settings: &Settings, table: &str) -> anyhow::Result<()> {
    let db = open_database(settings).await?;
    let constraints = db.show_constraints(table).await?;

    if constraints.is_empty() {
        println!("{} No unique constraints on {}", style("!").yellow(), table);
        return Ok(());
    }

    println!("{} Unique constraints on {}:", style("→").cyan(), table);
    for c in constraints {
        println!("  {} ({})", style(&c.name).bold(), c.fields.join(", "));
    }

    Ok(())
}
