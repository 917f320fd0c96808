use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use daemon::{
    catalog::CatalogClient,
    config::MoverConfig,
    leftovers::LeftoversManager,
    ops::{ConvertOperationHandler, CopyOperationHandler},
    paths::PathMapper,
    queue::{HistoryEntry, OperationQueue, QueueItem},
    Movie,
};
use log::{debug, error, info, warn};

/// Safe mover daemon for a tiered media library
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: both queue workers plus the control-command loop
    Run,
    /// Control the queues of a running daemon
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Reconcile the catalog against the storage tiers
    Leftovers {
        #[command(subcommand)]
        action: LeftoversAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Enqueue a movie into the copy queue
    Copy {
        #[arg(long)]
        movie_id: i64,
    },
    /// Enqueue a movie into the convert queue
    Convert {
        #[arg(long)]
        movie_id: i64,
    },
    /// Remove a pending item from a queue
    Remove {
        /// Queue name: copy or convert
        queue: String,
        item_id: String,
    },
    /// Drop every pending item in a queue
    Clear {
        /// Queue name: copy or convert
        queue: String,
    },
    /// Show queue contents and history from the persisted state files
    Status,
}

#[derive(Subcommand, Debug)]
enum LeftoversAction {
    /// List untracked fast-tier directories and missing slow-tier files
    List,
    /// Delete an untracked fast-tier directory (irreversible)
    Delete {
        /// Directory name under the fast tier root
        name: String,
    },
    /// Re-enqueue a missing movie's fast-tier copy into the copy queue
    Recopy {
        #[arg(long)]
        movie_id: i64,
        /// Directory name under the fast tier root
        name: String,
    },
}

/// Control command dropped into the data directory for the running daemon
#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct CommandFile {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    movie_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_id: Option<String>,
    /// Full movie snapshot, used when the enqueue should not re-fetch the
    /// catalog record (leftovers recopy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    movie: Option<Movie>,
    timestamp: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let cfg = MoverConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Run => run_daemon(cfg).await,
        Command::Queue { action } => handle_queue_command(&cfg, action).await,
        Command::Leftovers { action } => handle_leftovers_command(&cfg, action).await,
    }
}

async fn run_daemon(cfg: MoverConfig) -> Result<()> {
    info!("Safe mover daemon starting");
    info!("Configuration loaded:");
    info!("  Catalog: {}:{}", cfg.catalog_host, cfg.catalog_port);
    info!("  Fast tier root: {}", cfg.fast_root);
    info!("  Slow tier root: {}", cfg.slow_root);
    info!("  Path mappings: {}", cfg.path_mappings.len());
    info!("  Data dir: {}", cfg.data_dir.display());
    info!("  History retention: {}", cfg.history_retention);
    info!("  Replace mode: {:?}", cfg.replace_mode);

    fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("Failed to create data directory: {}", cfg.data_dir.display()))?;
    fs::create_dir_all(cfg.command_dir())
        .with_context(|| format!("Failed to create command directory: {}", cfg.command_dir().display()))?;

    let catalog = CatalogClient::from_config(&cfg);

    // Process-wide queue state is built exactly once and handed around
    // explicitly. Loading surfaces items interrupted by the last shutdown
    // as failed history entries.
    let copy_queue = Arc::new(
        OperationQueue::new(
            "copy",
            &cfg,
            Arc::new(CopyOperationHandler::new(cfg.clone(), catalog.clone())),
        )
        .context("Failed to load copy queue state")?,
    );
    let convert_queue = Arc::new(
        OperationQueue::new(
            "convert",
            &cfg,
            Arc::new(ConvertOperationHandler::new(cfg.clone(), catalog.clone())),
        )
        .context("Failed to load convert queue state")?,
    );

    copy_queue.start_worker();
    convert_queue.start_worker();
    info!("Queue workers started (copy, convert)");

    // Main daemon loop: the workers run on their own; this loop only picks
    // up control commands dropped by the CLI.
    loop {
        if let Err(e) = process_command_files(&cfg, &catalog, &copy_queue, &convert_queue).await {
            error!("Failed to process command files: {}", e);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Process command files dropped by the CLI into the data directory
async fn process_command_files(
    cfg: &MoverConfig,
    catalog: &CatalogClient,
    copy_queue: &OperationQueue,
    convert_queue: &OperationQueue,
) -> Result<usize> {
    let command_dir = cfg.command_dir();
    if !command_dir.exists() {
        fs::create_dir_all(&command_dir)
            .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;
    }

    let entries = match fs::read_dir(&command_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read command directory {}: {}", command_dir.display(), e);
            return Ok(0);
        }
    };

    let mut processed_count = 0;
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read command file {}: {}", path.display(), e);
                continue;
            }
        };

        let cmd: CommandFile = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to parse command file {}: {}", path.display(), e);
                // Delete invalid command file
                fs::remove_file(&path).ok();
                continue;
            }
        };

        match cmd.action.as_str() {
            "enqueue_copy" | "enqueue_convert" => {
                let (queue, queue_name) = if cmd.action == "enqueue_copy" {
                    (copy_queue, "copy")
                } else {
                    (convert_queue, "convert")
                };

                let movie = match cmd.movie {
                    Some(movie) => Some(movie),
                    None => match cmd.movie_id {
                        Some(id) => match catalog.get_movie(id).await {
                            Ok(movie) => Some(movie),
                            Err(e) => {
                                error!("Failed to fetch movie {} from catalog: {}", id, e);
                                None
                            }
                        },
                        None => {
                            warn!("Command file {} has no movie or movie_id", path.display());
                            None
                        }
                    },
                };

                if let Some(movie) = movie {
                    match queue.enqueue(movie) {
                        Ok(item) => info!(
                            "Enqueued '{}' into {} queue as item {}",
                            item.movie.title, queue_name, item.id
                        ),
                        Err(e) => warn!("Enqueue into {} queue rejected: {}", queue_name, e),
                    }
                }
            }
            "remove" => {
                let queue = match cmd.queue.as_deref() {
                    Some("convert") => convert_queue,
                    _ => copy_queue,
                };
                match cmd.item_id.as_deref() {
                    Some(item_id) => {
                        if queue.remove(item_id) {
                            info!("Removed pending item {}", item_id);
                        } else {
                            warn!("Item {} is not pending, nothing removed", item_id);
                        }
                    }
                    None => warn!("Remove command without item_id: {}", path.display()),
                }
            }
            "clear" => {
                let (queue, queue_name) = match cmd.queue.as_deref() {
                    Some("convert") => (convert_queue, "convert"),
                    _ => (copy_queue, "copy"),
                };
                let count = queue.clear_all();
                info!("Cleared {} pending item(s) from {} queue", count, queue_name);
            }
            other => warn!("Unknown command action: {}", other),
        }

        processed_count += 1;
        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
    }

    if processed_count > 0 {
        info!("Processed {} command file(s)", processed_count);
    }

    Ok(processed_count)
}

async fn handle_queue_command(cfg: &MoverConfig, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::Copy { movie_id } => {
            write_command_file(
                cfg,
                &CommandFile {
                    action: "enqueue_copy".to_string(),
                    movie_id: Some(movie_id),
                    queue: Some("copy".to_string()),
                    item_id: None,
                    movie: None,
                    timestamp: Utc::now().to_rfc3339(),
                },
            )?;
        }
        QueueAction::Convert { movie_id } => {
            write_command_file(
                cfg,
                &CommandFile {
                    action: "enqueue_convert".to_string(),
                    movie_id: Some(movie_id),
                    queue: Some("convert".to_string()),
                    item_id: None,
                    movie: None,
                    timestamp: Utc::now().to_rfc3339(),
                },
            )?;
        }
        QueueAction::Remove { queue, item_id } => {
            write_command_file(
                cfg,
                &CommandFile {
                    action: "remove".to_string(),
                    movie_id: None,
                    queue: Some(queue),
                    item_id: Some(item_id),
                    movie: None,
                    timestamp: Utc::now().to_rfc3339(),
                },
            )?;
        }
        QueueAction::Clear { queue } => {
            write_command_file(
                cfg,
                &CommandFile {
                    action: "clear".to_string(),
                    movie_id: None,
                    queue: Some(queue),
                    item_id: None,
                    movie: None,
                    timestamp: Utc::now().to_rfc3339(),
                },
            )?;
        }
        QueueAction::Status => show_status(cfg)?,
    }
    Ok(())
}

fn write_command_file(cfg: &MoverConfig, cmd: &CommandFile) -> Result<()> {
    let dir = cfg.command_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create command directory: {}", dir.display()))?;
    let path = dir.join(format!("cmd_{}.json", uuid::Uuid::new_v4()));
    fs::write(&path, serde_json::to_string_pretty(cmd)?)
        .with_context(|| format!("Failed to write command file: {}", path.display()))?;
    println!("Command queued for the daemon: {}", path.display());
    Ok(())
}

/// Read-only view over the persisted queue and history files
fn show_status(cfg: &MoverConfig) -> Result<()> {
    for name in ["copy", "convert"] {
        println!("== {} queue ==", name);

        let queue_file = cfg.queue_file(name);
        if queue_file.exists() {
            let items: Vec<QueueItem> = serde_json::from_str(&fs::read_to_string(&queue_file)?)
                .with_context(|| format!("Failed to parse queue file: {}", queue_file.display()))?;
            if items.is_empty() {
                println!("  (empty)");
            }
            for item in items {
                println!(
                    "  [{}] {} - {} (item {})",
                    item.status.as_str(),
                    item.movie.title,
                    item.progress,
                    item.id
                );
            }
        } else {
            println!("  (no state file)");
        }

        let history_file = cfg.history_file(name);
        if history_file.exists() {
            let entries: Vec<HistoryEntry> =
                serde_json::from_str(&fs::read_to_string(&history_file)?)
                    .with_context(|| format!("Failed to parse history file: {}", history_file.display()))?;
            if !entries.is_empty() {
                println!("  history:");
                for e in entries {
                    let outcome = if e.success { "ok" } else { "FAILED" };
                    match e.error {
                        Some(err) => println!("    [{}] {} - {}", outcome, e.movie_title, err),
                        None => println!("    [{}] {}", outcome, e.movie_title),
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_leftovers_command(cfg: &MoverConfig, action: LeftoversAction) -> Result<()> {
    let catalog = CatalogClient::from_config(cfg);
    let manager = LeftoversManager::new(cfg.clone(), catalog);
    let fast_root_host = PathMapper::new(&cfg.path_mappings).to_host(&cfg.fast_root);

    match action {
        LeftoversAction::List => {
            let untracked = manager.find_untracked().await?;
            println!("Untracked on fast tier: {}", untracked.len());
            for entry in &untracked {
                println!(
                    "  {} ({} files, {:.2} GB){}",
                    entry.name,
                    entry.file_count,
                    entry.size_bytes as f64 / 1_000_000_000.0,
                    if entry.can_recopy { " [can recopy]" } else { "" }
                );
            }

            let missing = manager.find_missing().await?;
            println!("Missing on slow tier: {}", missing.len());
            for entry in &missing {
                println!("  {} (movie {}): {}", entry.title, entry.movie_id, entry.catalog_path);
            }
        }
        LeftoversAction::Delete { name } => {
            let target = fast_root_host.join(&name);
            manager.delete_leftover(&target)?;
            println!("Deleted {}", target.display());
        }
        LeftoversAction::Recopy { movie_id, name } => {
            let dir = fast_root_host.join(&name);
            let movie = manager.prepare_recopy(movie_id, &dir).await?;
            write_command_file(
                cfg,
                &CommandFile {
                    action: "enqueue_copy".to_string(),
                    movie_id: Some(movie_id),
                    queue: Some("copy".to_string()),
                    item_id: None,
                    movie: Some(movie),
                    timestamp: Utc::now().to_rfc3339(),
                },
            )?;
            println!("Re-copy queued for movie {}", movie_id);
        }
    }
    Ok(())
}
