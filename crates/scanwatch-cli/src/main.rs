use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use scanwatch_core::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

type CliCoordinator = Coordinator<HttpTaskDirectory, AnyBackend>;

#[derive(Parser, Debug)]
#[command(name = "scanwatch")]
#[command(about = "Follow background tasks and library scans on a library server", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server base url, overrides the configuration file
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token sent with every request
    #[arg(long)]
    token: Option<String>,

    /// Persist the history cursor in a sled database at this path
    #[arg(long, conflicts_with = "ephemeral")]
    cursor_db: Option<PathBuf>,

    /// Keep the history cursor in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll until Ctrl+C, logging refreshes and scan progress
    Watch,
    /// Print active tasks and history once
    Tasks,
    /// Start a scan and follow it to the end
    Scan {
        /// Library path id to scan
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        path: Option<i64>,
        /// Scan every library path
        #[arg(long)]
        all: bool,
    },
    /// Request cancellation of a task
    Cancel { id: TaskKey },
    /// Mark every history task as seen
    MarkSeen,
    /// Forget the persisted history cursor
    ResetCursor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = load_config(&args)?;
    config.validate()?;

    let directory = Arc::new(HttpTaskDirectory::new(&config.server)?);
    let backend = AnyBackend::open(&config.cursor).context("unable to open cursor store")?;
    let cursor = CursorStore::open(KvStore::new(Arc::new(backend))).await;

    if let Command::ResetCursor = args.command {
        cursor.reset().await;
        info!("history cursor reset");
        return Ok(());
    }

    let coordinator = Coordinator::new(directory, cursor, config.polling.clone());
    match args.command {
        Command::Watch => watch(&coordinator).await,
        Command::Tasks => {
            coordinator.start().await;
            print_board(&coordinator);
            Ok(())
        }
        Command::Scan { path, all } => {
            let target = match (path, all) {
                (Some(id), false) => ScanTarget::LibraryPath(id),
                _ => ScanTarget::All,
            };
            follow_scan(&coordinator, target).await
        }
        Command::Cancel { id } => {
            coordinator.cancel_task(id).await?;
            info!(task = id, "cancellation requested");
            Ok(())
        }
        Command::MarkSeen => {
            coordinator.start().await;
            let cursor = coordinator.mark_history_tasks_seen().await;
            info!(cursor = %describe_cursor(cursor), "history marked as seen");
            Ok(())
        }
        Command::ResetCursor => Ok(()),
    }
}

fn load_config(args: &Args) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match (&args.config, &args.base_url) {
        (Some(path), _) => CoordinatorConfig::from_json_file(path)
            .with_context(|| format!("unable to load {}", path.display()))?,
        (None, Some(base_url)) => CoordinatorConfig::new(base_url.clone()),
        (None, None) => bail!("either --config or --base-url is required"),
    };

    if let Some(base_url) = &args.base_url {
        config.server.base_url = base_url.clone();
    }
    if let Some(token) = &args.token {
        config.server.api_token = Some(token.clone());
    }
    if let Some(path) = &args.cursor_db {
        config.cursor = CursorConfig {
            backend: KvBackendKind::Sled,
            path: Some(path.clone()),
        };
    } else if args.ephemeral {
        config.cursor = CursorConfig::default();
    }
    Ok(config)
}

async fn watch(coordinator: &CliCoordinator) -> anyhow::Result<()> {
    let mut events = coordinator.subscribe();
    coordinator.start().await;
    print_board(coordinator);
    info!("Watching tasks, press Ctrl+C to exit...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(coordinator, &event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    coordinator.dispose();
    Ok(())
}

async fn follow_scan(coordinator: &CliCoordinator, target: ScanTarget) -> anyhow::Result<()> {
    let mut events = coordinator.subscribe();
    coordinator.start().await;

    let created = coordinator.start_scan_target(target).await?;
    info!(%target, tasks = created.len(), "scan submitted");

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving the scan running on the server");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(CoordinatorEvent::ScanFinished { failed: false }) => {
                    info!("scan finished");
                    break Ok(());
                }
                Ok(CoordinatorEvent::ScanFinished { failed: true }) => {
                    for err in coordinator.scan_errors() {
                        error!(
                            message = err.message.as_deref().unwrap_or("unknown error"),
                            at = %err.timestamp,
                            "scan task failed"
                        );
                    }
                    break Err(anyhow::anyhow!("scan finished with errors"));
                }
                Ok(CoordinatorEvent::ScanCancelled) => {
                    break Err(anyhow::anyhow!("scan was cancelled"));
                }
                Ok(event) => log_event(coordinator, &event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break Err(anyhow::anyhow!("coordinator stopped")),
            }
        }
    };

    coordinator.dispose();
    outcome
}

fn log_event(coordinator: &CliCoordinator, event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::TasksRefreshed { active, history } => info!(
            active,
            history,
            unseen = coordinator.unseen_history_count(),
            failed = coordinator.unseen_failed_count(),
            "tasks refreshed"
        ),
        CoordinatorEvent::ScanProgress(state) => info!(
            status = ?state.status,
            progress = state.progress,
            file = state.current_file.as_deref().unwrap_or("-"),
            remaining = state.remaining,
            "scan progress"
        ),
        CoordinatorEvent::LibraryChanged => info!("library contents changed"),
        CoordinatorEvent::ScanFinished { failed } => info!(failed, "scan finished"),
        CoordinatorEvent::ScanCancelled => info!("scan cancelled"),
    }
}

fn print_board(coordinator: &CliCoordinator) {
    let cursor = coordinator.cursor();
    println!("Active tasks:");
    for task in coordinator.active_tasks() {
        println!(
            "  #{:<6} {:<16} {:<10} {:>5.1}%  {}",
            task.id,
            task.task_type,
            task.status,
            task.progress.unwrap_or(0.0),
            task.current_file.as_deref().unwrap_or("")
        );
    }

    println!("History (seen up to {}):", describe_cursor(cursor));
    for task in coordinator.history_tasks() {
        let marker = if task.cursor().is_after(&cursor) { "*" } else { " " };
        println!(
            "{marker} #{:<6} {:<16} {:<10} {}",
            task.id,
            task.task_type,
            task.status,
            task.error_message.as_deref().unwrap_or("")
        );
    }
}

fn describe_cursor(cursor: Cursor) -> String {
    match chrono::DateTime::from_timestamp_millis(cursor.timestamp) {
        Some(at) if cursor != Cursor::ZERO => format!("{} (task {})", at.to_rfc3339(), cursor.id),
        _ => "nothing".to_owned(),
    }
}
