//! Output formatting for CLI commands: tables, sizes, timestamps, progress.

use chrono::{DateTime, Local, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use serde::Serialize;
use treeline_protocol::{EntryKind, ScanStatus, Task, TaskStatus};

/// Format a file size in human-readable form
///
/// Examples:
/// - 500 -> "500 B"
/// - 1024 -> "1.0 KB"
/// - 1536000 -> "1.5 MB"
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_timestamp(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// "42%" plus the ETA when one is known.
pub fn format_progress(task: &Task) -> String {
    let pct = (task.progress * 100.0).floor() as u64;
    match task.eta_seconds {
        Some(eta) if eta >= 1.0 => format!("{}% (eta {}s)", pct, eta.round() as u64),
        _ => format!("{}%", pct),
    }
}

pub fn scan_status_color(status: ScanStatus) -> Color {
    match status {
        ScanStatus::Running => Color::Yellow,
        ScanStatus::Completed => Color::Green,
        ScanStatus::Error => Color::Red,
        ScanStatus::Canceled => Color::Grey,
    }
}

pub fn task_status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Queued | TaskStatus::Running => Color::Yellow,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Error => Color::Red,
        TaskStatus::Canceled => Color::Grey,
    }
}

pub fn kind_color(kind: EntryKind) -> Color {
    match kind {
        EntryKind::Folder => Color::Blue,
        EntryKind::File => Color::White,
    }
}

/// Print a table with headers and rows
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let rows = rows
        .into_iter()
        .map(|row| row.into_iter().map(|text| (text, None)).collect())
        .collect();
    print_table_colored(headers, rows);
}

/// Print a table with per-cell colors
pub fn print_table_colored(headers: &[&str], rows: Vec<Vec<(String, Option<Color>)>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for row in rows {
        let cells: Vec<Cell> = row
            .into_iter()
            .map(|(text, color)| match color {
                Some(c) => Cell::new(text).fg(c),
                None => Cell::new(text),
            })
            .collect();
        table.add_row(cells);
    }

    println!("{}", table);
}

/// Pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
