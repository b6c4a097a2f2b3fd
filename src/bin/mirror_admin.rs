use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use immich_mirror::{
    config::{ConfigLoader, DuplicateMatch},
    db,
    engine::maintenance,
    file_mirror::FileMirror,
    telemetry,
};
use uuid::Uuid;

/// Maintenance commands for the mirror's tracking data. Every mutating
/// command previews its effect and only acts when `--yes` is given.
#[derive(Debug, Parser)]
#[command(name = "mirror-admin", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show mapping, skip and failure counts
    Status,
    /// Remove every mirrored asset and person of one target user
    DeleteSynced {
        #[arg(long)]
        target_user: Uuid,
        #[arg(long)]
        yes: bool,
    },
    /// Clear skip-list entries so the sources are considered again
    ClearSkipped {
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        yes: bool,
    },
    /// Remove mirrors that duplicate the target user's own uploads
    DedupSynced {
        #[arg(long)]
        target_user: Uuid,
        /// Compare capture time to the second instead of by date
        #[arg(long)]
        match_time: bool,
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    let pool = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::ensure_tracking_tables(&pool).await?;
    let files = FileMirror::new(&config.storage);

    let outcome = run(cli.command, &pool, &files).await;
    db::close(pool).await;
    outcome
}

async fn run(command: Command, pool: &sea_orm::DatabaseConnection, files: &FileMirror) -> Result<()> {
    match command {
        Command::Status => {
            let status = maintenance::status(pool).await?;
            println!("Mapped assets:    {}", status.mapped_assets);
            println!("Mapped persons:   {}", status.mapped_persons);
            println!("Failing records:  {}", status.failing_records);
            for (reason, count) in &status.skipped {
                println!("Skipped ({reason}): {count}");
            }
            for target in &status.targets {
                println!(
                    "  {} <{}>: {} assets, {} persons",
                    target.target_user_id, target.email, target.assets, target.persons
                );
            }
        }
        Command::DeleteSynced { target_user, yes } => {
            let inventory = maintenance::preview_synced(pool, target_user).await?;
            println!("Synced assets:    {}", inventory.assets.len());
            println!("Mirrored persons: {}", inventory.persons.len());
            if inventory.is_empty() {
                println!("Nothing to delete.");
            } else if !yes {
                println!("Dry run, no changes made. Re-run with --yes to delete.");
            } else {
                let report = maintenance::delete_synced(pool, files, target_user).await?;
                println!(
                    "Deleted {} assets ({} failed) and {} persons.",
                    report.assets_deleted, report.assets_failed, report.persons_deleted
                );
            }
        }
        Command::ClearSkipped { reason, yes } => {
            let status = maintenance::status(pool).await?;
            let matching: i64 = status
                .skipped
                .iter()
                .filter(|(r, _)| reason.as_deref().is_none_or(|wanted| wanted == r))
                .map(|(_, count)| count)
                .sum();
            println!("Matching skip entries: {matching}");
            if matching == 0 {
                println!("Nothing to clear.");
            } else if !yes {
                println!("Dry run, no changes made. Re-run with --yes to clear.");
            } else {
                let cleared = maintenance::clear_skipped(pool, reason.as_deref()).await?;
                println!("Cleared {cleared} skip entries.");
            }
        }
        Command::DedupSynced {
            target_user,
            match_time,
            yes,
        } => {
            let mode = if match_time {
                DuplicateMatch::Exact
            } else {
                DuplicateMatch::Date
            };
            let duplicates = maintenance::find_synced_duplicates(pool, target_user, mode).await?;
            if duplicates.is_empty() {
                println!("No duplicates found.");
                return Ok(());
            }
            println!("Found {} synced duplicates:", duplicates.len());
            for dup in &duplicates {
                println!("  {}", dup.synced_file_name);
                println!("    synced:   {}", dup.synced_path);
                println!("    original: {}", dup.original_path);
            }
            if !yes {
                println!("Dry run, no changes made. Re-run with --yes to delete.");
            } else {
                let report =
                    maintenance::dedup_synced(pool, files, target_user, &duplicates).await?;
                println!(
                    "Deleted {} synced duplicates ({} failed).",
                    report.assets_deleted, report.assets_failed
                );
            }
        }
    }
    Ok(())
}
