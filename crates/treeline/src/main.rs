//! Treeline command-line interface
//!
//! Each invocation opens the index, runs one command and exits. Scans and
//! commits are followed to completion; Ctrl-C cancels the running task.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use treeline::{EngineConfig, EngineError, StoreBackend};
use treeline_logging::{init_logging, LogConfig};
use treeline_protocol::paths::{default_config_path, default_index_path, default_logs_dir, resolve_home};

mod cli;

#[derive(Parser, Debug)]
#[command(name = "treeline", version, about = "Incremental file-tree indexing with graph commit")]
struct Cli {
    /// Treeline home directory (index, config and logs)
    #[arg(long, global = true, env = "TREELINE_HOME")]
    home: Option<PathBuf>,

    /// Config file (default: <home>/treeline.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite index file, overriding the configured store
    #[arg(long, global = true, conflicts_with = "memory")]
    db: Option<PathBuf>,

    /// Keep the index in memory for this invocation only
    #[arg(long, global = true)]
    memory: bool,

    /// Override max_concurrent_tasks
    #[arg(long, global = true)]
    max_tasks: Option<usize>,

    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors on stderr, no progress line
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a root into a new index snapshot
    Scan {
        /// Root to scan (provider-specific)
        root: String,

        /// Provider id from the config
        #[arg(short, long, default_value = "local")]
        provider: String,

        /// Only list the root's direct children
        #[arg(long)]
        no_recursive: bool,

        /// Commit the scan to the graph store when it completes
        #[arg(long)]
        commit: bool,
    },

    /// Show one task
    Task {
        /// Task ID
        id: String,
    },

    /// Commit a completed scan to the graph store
    Commit {
        /// Scan ID
        scan: String,
    },

    /// Delete a scan from the index and the graph store
    Delete {
        /// Scan ID
        scan: String,
    },

    /// List the children of a folder in a scan
    Ls {
        /// Scan ID
        scan: String,

        /// Folder path (default: the scan root)
        path: Option<String>,

        /// Only files
        #[arg(long, conflicts_with = "folders")]
        files: bool,

        /// Only folders
        #[arg(long)]
        folders: bool,

        /// Only files with this extension
        #[arg(long)]
        ext: Option<String>,

        /// Continue from a previous page
        #[arg(long)]
        page_token: Option<String>,

        /// Rows per page
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// List scans, newest first
    Scans,

    /// List task history, newest first
    Tasks,
}

/// Load the config file and apply flag overrides.
///
/// Also returns the configured `auto_commit`, which the CLI honours itself:
/// a one-shot process would exit before a background commit finished.
fn build_config(cli: &Cli, home: &std::path::Path) -> Result<(EngineConfig, bool)> {
    let explicit = cli.config.is_some();
    let path = cli.config.clone().unwrap_or_else(|| default_config_path(home));

    let mut config = if explicit || path.exists() {
        EngineConfig::load(&path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?
    } else {
        EngineConfig {
            store: StoreBackend::Sqlite {
                path: default_index_path(home),
            },
            ..Default::default()
        }
    };

    if let Some(db) = &cli.db {
        config.store = StoreBackend::Sqlite { path: db.clone() };
    }
    if cli.memory {
        config.store = StoreBackend::Memory;
    }
    if let Some(max) = cli.max_tasks {
        config.max_concurrent_tasks = max;
    }
    let auto_commit = std::mem::take(&mut config.auto_commit);
    config.validate().context("Invalid configuration")?;
    Ok((config, auto_commit))
}

async fn run(cli: Cli, config: EngineConfig, auto_commit: bool) -> Result<()> {
    let out = cli::Output {
        json: cli.json,
        quiet: cli.quiet,
    };
    let engine = treeline::Engine::open(Arc::new(config))
        .await
        .context("Failed to open engine")?;

    match cli.command {
        Commands::Scan {
            root,
            provider,
            no_recursive,
            commit,
        } => {
            let args = cli::ScanArgs {
                root,
                provider,
                recursive: !no_recursive,
                commit: commit || auto_commit,
            };
            cli::scan(&engine, args, &out).await
        }
        Commands::Task { id } => cli::task(&engine, &id, &out).await,
        Commands::Commit { scan } => cli::commit(&engine, &scan, &out).await,
        Commands::Delete { scan } => cli::delete(&engine, &scan, &out).await,
        Commands::Ls {
            scan,
            path,
            files,
            folders,
            ext,
            page_token,
            limit,
        } => {
            let args = cli::LsArgs {
                scan,
                path,
                files,
                folders,
                ext,
                page_token,
                limit,
            };
            cli::ls(&engine, args, &out).await
        }
        Commands::Scans => cli::scans(&engine, &out).await,
        Commands::Tasks => cli::tasks(&engine, &out).await,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = cli.json;
    let home = resolve_home(cli.home.clone());

    if let Err(err) = init_logging(LogConfig {
        app_name: "treeline",
        log_dir: default_logs_dir(&home),
        verbose: cli.verbose,
        quiet: cli.quiet,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    let result = build_config(&cli, &home).and_then(|(config, auto_commit)| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;
        runtime.block_on(run(cli, config, auto_commit))
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let hint = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<EngineError>())
                .and_then(EngineError::retry_hint);
            if json_mode {
                cli::print_json_error(&err, hint);
            } else {
                eprintln!("Error: {:#}", err);
                if let Some(hint) = hint {
                    eprintln!("Hint: {}", hint);
                }
            }
            ExitCode::from(1)
        }
    }
}
