//! Maintenance CLI over a pulse database file.
//!
//! # Responsibility
//! - Inspect pending reminders and the offline task queue.
//! - Export, import and prune the store without starting timers.
//!
//! Imported `Scheduled` records are armed by the next engine start.

use clap::{Parser, Subcommand};
use log::info;
use pulse_core::repo::{
    NotificationRepository, OfflineTaskRepository, SnapshotRepository, TaskIndex,
};
use pulse_core::{Clock, CoreConfig, ExportDocument, SqliteStore, SystemClock};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "pulse", version, about = "Inspect and maintain a pulse store")]
struct Cli {
    /// SQLite database file.
    #[arg(long, default_value = "pulse.sqlite3")]
    db: PathBuf,
    /// JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Absolute directory for rotating log files.
    #[arg(long)]
    log_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List scheduled reminders in due order.
    Pending,
    /// List offline tasks.
    Tasks {
        #[arg(long, value_enum, default_value_t = TaskFilter::Unsynced)]
        filter: TaskFilter,
    },
    /// Write the whole store as a JSON export document.
    Export {
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Merge an export document into the store.
    Import { file: PathBuf },
    /// Delete terminal reminders and synced tasks past the retention window.
    Prune,
    /// Print the core version.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum TaskFilter {
    Unsynced,
    Synced,
    Failed,
}

impl From<TaskFilter> for TaskIndex {
    fn from(value: TaskFilter) -> Self {
        match value {
            TaskFilter::Unsynced => TaskIndex::Synced(false),
            TaskFilter::Synced => TaskIndex::Synced(true),
            TaskFilter::Failed => TaskIndex::PermanentlyFailed,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if let Some(log_dir) = &cli.log_dir {
        pulse_core::init_logging(pulse_core::default_log_level(), log_dir)?;
    }
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };

    if let Command::Version = cli.command {
        println!("pulse_core version={}", pulse_core::core_version());
        return Ok(());
    }

    let store = SqliteStore::open(&cli.db)?;
    let now = SystemClock.now_ms();
    match cli.command {
        Command::Pending => {
            for record in store.list_scheduled_by_due()? {
                println!("{}\t{}\t{}", record.due_at, record.id, record.title);
            }
        }
        Command::Tasks { filter } => {
            for task in store.query_tasks(filter.into())? {
                println!(
                    "{}\t{}\tpriority={}\tretries={}\t{}",
                    task.id,
                    task.kind.as_str(),
                    task.priority,
                    task.retry_count,
                    task.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Export { out } => {
            let document = ExportDocument::from_snapshot(store.snapshot()?, now);
            let json = document.to_json()?;
            match out {
                Some(path) => std::fs::write(&path, json)?,
                None => println!("{json}"),
            }
            info!(
                "event=cli_export module=cli status=ok entries={}",
                document.entries.len()
            );
        }
        Command::Import { file } => {
            let text = std::fs::read_to_string(&file)?;
            let snapshot = ExportDocument::from_json(&text)?.into_snapshot()?;
            let restored = store.restore(&snapshot)?;
            println!(
                "imported {} entries ({} kept as stored)",
                restored.written, restored.skipped
            );
            info!(
                "event=cli_import module=cli status=ok written={} skipped={}",
                restored.written,
                restored.skipped
            );
        }
        Command::Prune => {
            let before = now.saturating_sub(config.retention_ms);
            let notifications = store.prune_terminal(before)?;
            let tasks = store.prune_synced(before)?;
            println!("pruned notifications={notifications} tasks={tasks}");
        }
        Command::Version => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, TaskFilter};
    use clap::Parser;

    #[test]
    fn parses_tasks_filter() {
        let cli = Cli::try_parse_from(["pulse", "--db", "x.db", "tasks", "--filter", "failed"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Tasks {
                filter: TaskFilter::Failed
            }
        ));
    }

    #[test]
    fn import_requires_file() {
        assert!(Cli::try_parse_from(["pulse", "import"]).is_err());
    }
}
