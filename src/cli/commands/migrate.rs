//! Database migration commands.

use console::style;

use queue_schema::config::Settings;
use queue_schema::migrations;
use queue_schema::repository::util::redact_url_password;
use queue_schema::repository::{AnyQueryInterface, Migrator};

/// Connect to the configured database.
pub(super) async fn open_database(settings: &Settings) -> anyhow::Result<AnyQueryInterface> {
    settings.ensure_directories()?;
    let db = AnyQueryInterface::connect(
        &settings.database_url(),
        settings.no_tls,
        &settings.migrations_table,
    )
    .await?;
    Ok(db)
}

fn print_database(settings: &Settings) {
    println!(
        "  Database: {}",
        redact_url_password(&settings.database_url())
    );
}

/// Apply pending migrations, or with `check` just list them.
pub async fn cmd_migrate(settings: &Settings, check: bool) -> anyhow::Result<()> {
    println!("{} Database migration", style("→").cyan());
    print_database(settings);

    let db = open_database(settings).await?;
    let registry = migrations::registry()?;
    let migrator = Migrator::new(&registry, &db);

    if check {
        let pending = migrator.pending().await?;
        if pending.is_empty() {
            println!("\n{} Schema is up to date.", style("✓").green());
        } else {
            println!(
                "\n{} {} pending migration(s). Run 'queue-schema migrate' to apply:",
                style("!").yellow(),
                pending.len()
            );
            for name in pending {
                println!("  {}", name);
            }
        }
        return Ok(());
    }

    println!("\n{} Running migrations...", style("→").cyan());
    match migrator.migrate_forward().await {
        Ok(applied) if applied.is_empty() => {
            println!("{} Schema is already up to date.", style("✓").green());
            Ok(())
        }
        Ok(applied) => {
            for name in &applied {
                println!("  {} {}", style("✓").green(), name);
            }
            println!(
                "{} Applied {} migration(s).",
                style("✓").green(),
                applied.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Migration failed: {}", style("✗").red(), e);
            Err(anyhow::anyhow!("Migration failed: {}", e))
        }
    }
}

/// Revert the last `steps` applied migrations.
pub async fn cmd_undo(settings: &Settings, steps: usize) -> anyhow::Result<()> {
    println!("{} Reverting migrations", style("→").cyan());
    print_database(settings);

    let db = open_database(settings).await?;
    let registry = migrations::registry()?;
    let migrator = Migrator::new(&registry, &db);

    match migrator.migrate_backward(steps).await {
        Ok(reverted) if reverted.is_empty() => {
            println!("{} Nothing to revert.", style("✓").green());
            Ok(())
        }
        Ok(reverted) => {
            for name in &reverted {
                println!("  {} {}", style("↺").yellow(), name);
            }
            println!(
                "{} Reverted {} migration(s).",
                style("✓").green(),
                reverted.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Revert failed: {}", style("✗").red(), e);
            Err(anyhow::anyhow!("Revert failed: {}", e))
        }
    }
}

/// Show every migration and whether it has been applied.
pub async fn cmd_status(settings: &Settings) -> anyhow::Result<()> {
    println!("{} Migration status", style("→").cyan());
    print_database(settings);
    println!();

    let db = open_database(settings).await?;
    let registry = migrations::registry()?;
    let migrator = Migrator::new(&registry, &db);

    for status in migrator.status().await? {
        match (status.applied_at, status.registered) {
            (Some(at), true) => println!(
                "  {} {} {}",
                style("up").green(),
                status.name,
                style(at.format("%Y-%m-%d %H:%M:%S")).dim()
            ),
            (Some(at), false) => println!(
                "  {} {} {} (not registered)",
                style("??").red(),
                status.name,
                style(at.format("%Y-%m-%d %H:%M:%S")).dim()
            ),
            (None, _) => println!("  {} {}", style("down").yellow(), status.name),
        }
    }

    Ok(())
}
