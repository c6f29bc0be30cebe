//! # vault-sync CLI (`vsync`)
//!
//! Keeps a folder of notes mirrored into a vector-searchable store and
//! executes note commands queued by a remote agent.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vsync init` | Create the store and run schema migrations |
//! | `vsync status` | Show files changed since the last sync |
//! | `vsync sync` | Upload changed files, remove deleted ones |
//! | `vsync query "<text>"` | Semantic search over synced chunks |
//! | `vsync command create-note "<text>"` | Queue a CREATE_NOTE command |
//! | `vsync command show <id>` | Inspect a queued command |
//! | `vsync poll` | Run the command poller until Ctrl-C |
//!
//! ## Examples
//!
//! ```bash
//! vsync init --config ./config/vsync.toml
//! vsync status --tree
//! vsync sync --path notes/today.md
//! vsync query "release checklist" --top-k 5
//! vsync poll
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use vault_sync::config;
use vault_sync::context::AppContext;
use vault_sync::models::{CommandContent, CommandKind, Query, Source};
use vault_sync::poller::CycleOutcome;
use vault_sync::reconcile;
use vault_sync::staging::StagingArea;
use vault_sync::sync;
use vault_sync::{db, migrate};

/// vault-sync: mirror a note vault into a vector store and run remote
/// note commands.
#[derive(Parser)]
#[command(name = "vsync", version, about = "Mirror a note vault into a vector store")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vsync.toml")]
    config: PathBuf,

    /// Log at debug level (`RUST_LOG` takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store database and its tables. Safe to re-run.
    Init,

    /// Show added, modified and deleted files.
    Status {
        /// Render changes as a folder tree.
        #[arg(long)]
        tree: bool,
    },

    /// Apply detected changes to the store.
    Sync {
        /// Re-upload every file instead of only the changed ones.
        #[arg(long)]
        all: bool,

        /// Only stage changes for these vault-relative paths.
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Show what would be synced without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Semantic search over synced chunks.
    Query {
        text: String,

        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict to one source: file, chat or email.
        #[arg(long)]
        source: Option<Source>,
    },

    /// Queue or inspect remote commands.
    Command {
        #[command(subcommand)]
        action: CommandAction,
    },

    /// Poll for queued commands and execute them.
    Poll {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum CommandAction {
    /// Queue a CREATE_NOTE command.
    CreateNote {
        text: String,

        /// Destination folder for the note.
        #[arg(long)]
        source_id: Option<String>,
    },
    /// Print a command's status.
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into())),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg.store).await?;
        migrate::run_migrations(&pool).await?;
        println!("Store initialized at {}.", cfg.store.path.display());
        return Ok(());
    }

    let ctx = AppContext::from_config(&cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Status { tree } => run_status(&ctx, tree).await?,
        Commands::Sync {
            all,
            paths,
            dry_run,
        } => run_sync(&ctx, all, &paths, dry_run).await?,
        Commands::Query {
            text,
            top_k,
            source,
        } => run_query(&ctx, text, top_k, source).await?,
        Commands::Command { action } => match action {
            CommandAction::CreateNote { text, source_id } => {
                let command = ctx
                    .datastore
                    .enqueue_command(CommandKind::CreateNote(
                        CommandContent::new(text).with_source_id(source_id),
                    ))
                    .await?;
                println!("Queued {} {}", command.kind.type_name(), command.id);
            }
            CommandAction::Show { id } => {
                let Some(command) = ctx.datastore.get_command(&id).await? else {
                    bail!("No command with id {}", id);
                };
                println!("id:      {}", command.id);
                println!("type:    {}", command.kind.type_name());
                println!("status:  {}", command.status);
                println!("created: {}", command.created_at.to_rfc3339());
                println!("updated: {}", command.updated_at.to_rfc3339());
                if let Some(errors) = command.errors {
                    println!("errors:  {}", errors);
                }
            }
        },
        Commands::Poll { once } => run_poll(&ctx, once).await?,
    }

    Ok(())
}

async fn run_status(ctx: &AppContext, tree: bool) -> Result<()> {
    let files = ctx.vault.list_files()?;
    let remote = ctx.datastore.synced_documents(ctx.table()).await?;

    if tree {
        let tree = reconcile::build_tree(&files, &remote, ctx.vault.name());
        print!("{}", tree.render());
        return Ok(());
    }

    let changes = reconcile::compute_changes(&files, &remote, ctx.vault.name());
    if changes.is_empty() {
        println!("Everything up to date ({} files).", files.len());
        return Ok(());
    }
    for change in &changes {
        println!("{:>9}  {}", change.change_type.to_string(), change.document.base.source_id);
    }
    println!("{} change(s).", changes.len());
    Ok(())
}

async fn run_sync(ctx: &AppContext, all: bool, paths: &[String], dry_run: bool) -> Result<()> {
    let size = Some(ctx.chunk_token_size());

    if all {
        if dry_run {
            println!("Would upload {} files.", ctx.vault.list_files()?.len());
            return Ok(());
        }
        let report = sync::sync_all(&ctx.vault, &ctx.datastore, ctx.table(), size).await?;
        println!("Uploaded {} files ({} failed).", report.added, report.failed);
        return Ok(());
    }

    let files = ctx.vault.list_files()?;
    let remote = ctx.datastore.synced_documents(ctx.table()).await?;
    let mut staging = StagingArea::from_changes(reconcile::compute_changes(
        &files,
        &remote,
        ctx.vault.name(),
    ));

    if paths.is_empty() {
        staging.stage_all();
    } else {
        let selected: Vec<_> = staging
            .unstaged()
            .iter()
            .filter(|c| paths.iter().any(|p| *p == c.document.base.source_id))
            .cloned()
            .collect();
        for change in &selected {
            staging.stage_change(change);
        }
    }

    if dry_run {
        for change in staging.staged() {
            println!("{:>9}  {}", change.change_type.to_string(), change.document.base.source_id);
        }
        println!("{} change(s) would be applied.", staging.staged().len());
        return Ok(());
    }

    let committed = staging.commit_changes();
    let report =
        sync::apply_changes(&committed, &ctx.vault, &ctx.datastore, ctx.table(), size).await;

    println!(
        "Sync complete: {} added, {} modified, {} deleted, {} failed.",
        report.added, report.modified, report.deleted, report.failed
    );
    if report.failed > 0 {
        bail!("{} change(s) failed", report.failed);
    }
    Ok(())
}

async fn run_query(
    ctx: &AppContext,
    text: String,
    top_k: Option<usize>,
    source: Option<Source>,
) -> Result<()> {
    let filter = source.map(|s| vault_sync::models::DocumentMetadataFilter {
        source: Some(s),
        ..Default::default()
    });
    let queries = ctx
        .datastore
        .embed_queries(&[Query {
            query: text,
            filter,
            top_k,
        }])
        .await?;
    let results = ctx.datastore.query(ctx.table(), &queries).await?;

    for result in results {
        if result.results.is_empty() {
            println!("No results.");
            continue;
        }
        for (i, hit) in result.results.iter().enumerate() {
            let preview: String = hit.chunk.text.chars().take(120).collect();
            println!(
                "{}. [{:.3}] {} ({})",
                i + 1,
                hit.score,
                hit.chunk.metadata.base.source_id,
                hit.chunk.id
            );
            println!("   {}", preview.replace('\n', " "));
        }
    }
    Ok(())
}

async fn run_poll(ctx: &AppContext, once: bool) -> Result<()> {
    if once {
        match ctx.poller.run_cycle().await {
            CycleOutcome::Empty => println!("No pending commands."),
            CycleOutcome::Completed { id } => println!("Command {} completed.", id),
            CycleOutcome::Failed { id, error } => println!("Command {} failed: {}", id, error),
            CycleOutcome::StoreError(e) => bail!("Store unavailable: {}", e),
            CycleOutcome::StatusNotRecorded { id, status, error } => {
                bail!("Command {} finished as {} but the status was not saved: {}", id, status, error)
            }
        }
        return Ok(());
    }

    ctx.poller.activate();
    println!("Polling every {}s. Press Ctrl-C to stop.", ctx.config.polling.interval_secs);
    tokio::signal::ctrl_c().await?;
    println!("Stopping after the current cycle...");
    ctx.poller.shutdown().await;
    Ok(())
}
