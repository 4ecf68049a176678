//! Command implementations for the `treeline` binary.

pub mod output;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use output::{
    format_progress, format_size, format_timestamp, kind_color, print_json, print_table,
    print_table_colored, scan_status_color, task_status_color,
};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use treeline::{ChildFilter, Engine};
use treeline_protocol::{CommitOutcome, ScanId, ScanRecord, Task, TaskId, TaskStatus};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Output mode shared by every command.
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn show_progress(&self) -> bool {
        !self.json && !self.quiet
    }
}

#[derive(Debug)]
pub struct ScanArgs {
    pub root: String,
    pub provider: String,
    pub recursive: bool,
    pub commit: bool,
}

#[derive(Debug)]
pub struct LsArgs {
    pub scan: String,
    pub path: Option<String>,
    pub files: bool,
    pub folders: bool,
    pub ext: Option<String>,
    pub page_token: Option<String>,
    pub limit: Option<usize>,
}

const SPINNER_TEMPLATE: &str = "{spinner} {prefix:<16} {pos} items  {msg}";
const BAR_TEMPLATE: &str = "{spinner} {prefix:<16} [{bar:32}] {pos}/{len}  {msg}";

fn progress_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn progress_bar(out: &Output) -> ProgressBar {
    if !out.show_progress() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(progress_style(SPINNER_TEMPLATE));
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Mirror a task snapshot onto the bar. Switches to a bar once the task
/// knows its total.
fn draw(bar: &ProgressBar, task: &Task) {
    if let Some(total) = task.total {
        if bar.length() != Some(total) {
            bar.set_length(total);
            bar.set_style(progress_style(BAR_TEMPLATE));
        }
    }
    bar.set_position(task.processed);
    bar.set_prefix(
        task.status_message
            .clone()
            .unwrap_or_else(|| task.status.to_string()),
    );
    bar.set_message(format_progress(task));
}

/// Wait for a task while drawing its progress. The first Ctrl-C cancels it;
/// the task still ends through the normal path.
async fn follow(engine: &Engine, task_id: &TaskId, out: &Output) -> Result<Task> {
    let bar = progress_bar(out);
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let wait = engine.wait_task(task_id);
    tokio::pin!(wait);
    let mut interrupted = false;

    loop {
        tokio::select! {
            result = &mut wait => {
                bar.finish_and_clear();
                return Ok(result?);
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupted = true;
                if engine.cancel_task(task_id) {
                    bar.println(format!("Cancelling task {}...", task_id));
                }
            }
            _ = ticker.tick(), if out.show_progress() => {
                if let Ok(task) = engine.get_task(task_id).await {
                    draw(&bar, &task);
                }
            }
        }
    }
}

fn task_failure(task: &Task, what: &str) -> anyhow::Error {
    match task.status {
        TaskStatus::Canceled => anyhow::anyhow!("{} cancelled", what),
        _ => anyhow::anyhow!(
            "{} failed: {}",
            what,
            task.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

// ============================================================================
// scan / commit
// ============================================================================

pub async fn scan(engine: &Engine, args: ScanArgs, out: &Output) -> Result<()> {
    let task_id = engine
        .start_scan(&args.provider, &args.root, args.recursive)
        .await
        .with_context(|| format!("Failed to start scan of {}", args.root))?;
    if out.show_progress() {
        eprintln!("Scanning {} (task {})", args.root, task_id);
    }

    let task = follow(engine, &task_id, out).await?;
    let scan_id = match (&task.status, &task.scan_id) {
        (TaskStatus::Completed, Some(id)) => id.clone(),
        _ => return Err(task_failure(&task, "Scan")),
    };
    let scan = engine.get_scan(&scan_id).await?;

    let outcome = if args.commit {
        Some(run_commit(engine, &scan_id, out).await?)
    } else {
        None
    };

    if out.json {
        return print_json(&serde_json::json!({
            "task": task,
            "scan": scan,
            "commit": outcome,
        }));
    }
    print_scan_summary(&scan);
    if let Some(outcome) = &outcome {
        print_outcome(outcome);
    }
    Ok(())
}

pub async fn commit(engine: &Engine, scan: &str, out: &Output) -> Result<()> {
    let scan_id = ScanId::from_string(scan);
    let outcome = run_commit(engine, &scan_id, out).await?;
    if out.json {
        return print_json(&outcome);
    }
    print_outcome(&outcome);
    Ok(())
}

async fn run_commit(engine: &Engine, scan_id: &ScanId, out: &Output) -> Result<CommitOutcome> {
    let task_id = engine
        .start_commit(scan_id)
        .await
        .with_context(|| format!("Failed to start commit of scan {}", scan_id))?;
    if out.show_progress() {
        eprintln!("Committing scan {} (task {})", scan_id, task_id);
    }

    let task = follow(engine, &task_id, out).await?;
    let outcome = engine.last_commit(scan_id).await?;
    match (task.status, outcome) {
        (TaskStatus::Completed, Some(outcome)) => Ok(outcome),
        (TaskStatus::Completed, None) => bail!("Commit finished without recording an outcome"),
        (_, outcome) => {
            if let (Some(outcome), false) = (&outcome, out.json) {
                print_outcome(outcome);
            }
            Err(task_failure(&task, "Commit"))
        }
    }
}

fn print_scan_summary(scan: &ScanRecord) {
    println!("Scan {} {}", scan.id, scan.status);
    println!(
        "  {} files, {} folders ({} synthesized)",
        scan.file_count, scan.folder_count, scan.synthesized_folders
    );
    println!(
        "  cache: {} hits, {} misses",
        scan.cache_hits, scan.cache_misses
    );
}

fn print_outcome(outcome: &CommitOutcome) {
    if !outcome.neo4j_attempted {
        println!(
            "Commit not attempted: {}",
            outcome.neo4j_error.as_deref().unwrap_or("graph store disabled")
        );
        return;
    }
    let verdict = if outcome.neo4j_db_verified {
        "verified"
    } else {
        "NOT verified"
    };
    println!("Commit {}", verdict);
    println!(
        "  index: {} files, {} folders; graph: {} files, {} folders; {} edges added",
        outcome.files_in_scan,
        outcome.folders_in_scan,
        outcome.neo4j_db_files,
        outcome.neo4j_db_folders,
        outcome.linked_edges_added
    );
    if let Some(err) = &outcome.neo4j_error {
        println!("  error: {}", err);
    }
}

// ============================================================================
// queries
// ============================================================================

pub async fn task(engine: &Engine, id: &str, out: &Output) -> Result<()> {
    let task = engine.get_task(&TaskId::from_string(id)).await?;
    if out.json {
        return print_json(&task);
    }
    let rows = vec![
        vec!["ID".to_string(), task.task_id.to_string()],
        vec!["Kind".to_string(), task.kind.to_string()],
        vec!["Status".to_string(), task.status.to_string()],
        vec!["Progress".to_string(), format_progress(&task)],
        vec![
            "Processed".to_string(),
            match task.total {
                Some(total) => format!("{} / {}", task.processed, total),
                None => task.processed.to_string(),
            },
        ],
        vec![
            "Phase".to_string(),
            task.status_message.clone().unwrap_or_else(|| "-".to_string()),
        ],
        vec![
            "Scan".to_string(),
            task.scan_id
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
        ],
        vec!["Created".to_string(), format_timestamp(Some(task.created_at))],
        vec!["Started".to_string(), format_timestamp(task.started_at)],
        vec!["Ended".to_string(), format_timestamp(task.ended_at)],
        vec![
            "Error".to_string(),
            task.error.clone().unwrap_or_else(|| "-".to_string()),
        ],
    ];
    print_table(&["Field", "Value"], rows);
    Ok(())
}

pub async fn delete(engine: &Engine, scan: &str, out: &Output) -> Result<()> {
    let scan_id = ScanId::from_string(scan);
    engine
        .delete_scan(&scan_id)
        .await
        .with_context(|| format!("Failed to delete scan {}", scan_id))?;
    if out.json {
        return print_json(&serde_json::json!({ "deleted": scan_id }));
    }
    println!("Deleted scan {}", scan_id);
    Ok(())
}

pub async fn ls(engine: &Engine, args: LsArgs, out: &Output) -> Result<()> {
    let scan_id = ScanId::from_string(args.scan);
    let mut filter = if args.files {
        ChildFilter::files()
    } else if args.folders {
        ChildFilter::folders()
    } else {
        ChildFilter::default()
    };
    if let Some(ext) = args.ext {
        filter = filter.with_extension(ext);
    }

    let page = engine
        .list_index(
            &scan_id,
            args.path.as_deref(),
            &filter,
            args.page_token.as_deref(),
            args.limit,
        )
        .await?;

    if out.json {
        return print_json(&serde_json::json!({
            "rows": page.rows,
            "next_token": page.next_token,
        }));
    }

    let rows = page
        .rows
        .iter()
        .map(|row| {
            let name = if row.synthesized {
                format!("{}/ (inferred)", row.name)
            } else if row.is_folder() {
                format!("{}/", row.name)
            } else {
                row.name.clone()
            };
            vec![
                (name, Some(kind_color(row.kind))),
                (
                    if row.is_file() {
                        format_size(row.size)
                    } else {
                        "-".to_string()
                    },
                    None,
                ),
                (format_timestamp(row.modified_time), None),
                (row.mime_type.clone().unwrap_or_else(|| "-".to_string()), None),
            ]
        })
        .collect();
    print_table_colored(&["Name", "Size", "Modified", "Type"], rows);

    if let Some(token) = page.next_token {
        eprintln!("More rows: --page-token {}", token);
    }
    Ok(())
}

pub async fn scans(engine: &Engine, out: &Output) -> Result<()> {
    let scans = engine.list_scans().await?;
    if out.json {
        return print_json(&scans);
    }
    if scans.is_empty() {
        println!("No scans yet. Run: treeline scan <root>");
        return Ok(());
    }

    let rows = scans
        .iter()
        .map(|scan| {
            vec![
                (scan.id.to_string(), None),
                (scan.provider_id.clone(), None),
                (scan.root_path.clone(), None),
                (scan.status.to_string(), Some(scan_status_color(scan.status))),
                (scan.file_count.to_string(), None),
                (scan.folder_count.to_string(), None),
                (
                    format!("{}/{}", scan.cache_hits, scan.cache_hits + scan.cache_misses),
                    None,
                ),
                (if scan.committed { "yes" } else { "no" }.to_string(), None),
                (format_timestamp(Some(scan.started_at)), None),
            ]
        })
        .collect();
    print_table_colored(
        &["ID", "Provider", "Root", "Status", "Files", "Folders", "Cache", "Committed", "Started"],
        rows,
    );
    Ok(())
}

pub async fn tasks(engine: &Engine, out: &Output) -> Result<()> {
    let tasks = engine.list_tasks().await?;
    if out.json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("No tasks recorded.");
        return Ok(());
    }

    let rows = tasks
        .iter()
        .map(|task| {
            vec![
                (task.task_id.to_string(), None),
                (task.kind.to_string(), None),
                (task.status.to_string(), Some(task_status_color(task.status))),
                (format_progress(task), None),
                (
                    task.scan_id
                        .as_ref()
                        .map_or_else(|| "-".to_string(), ToString::to_string),
                    None,
                ),
                (format_timestamp(Some(task.created_at)), None),
                (task.error.clone().unwrap_or_default(), None),
            ]
        })
        .collect();
    print_table_colored(
        &["ID", "Kind", "Status", "Progress", "Scan", "Created", "Error"],
        rows,
    );
    Ok(())
}

/// Error object for `--json` mode, on stdout so callers parse one stream.
pub fn print_json_error(err: &anyhow::Error, retry_hint: Option<&str>) {
    let value = serde_json::json!({
        "error": format!("{:#}", err),
        "retry_hint": retry_hint,
    });
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{}", text),
        Err(_) => eprintln!("Error: {:#}", err),
    }
}
