//! `task_history` queries.

use super::{from_millis, opt_from_millis, opt_to_millis, to_millis, IndexDb};
use crate::error::{DbError, Result};
use chrono::Utc;
use sqlx::Row;
use treeline_protocol::{ScanId, Task, TaskId, TaskKind, TaskStatus};

const TASK_COLUMNS: &str = "task_id, kind, status, progress, processed, total, status_message, eta_seconds, created_at, started_at, ended_at, scan_id, error";

impl IndexDb {
    pub(crate) async fn tasks_upsert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_history (task_id, kind, status, progress, processed, total, status_message,
                                      eta_seconds, created_at, started_at, ended_at, scan_id, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                progress = excluded.progress,
                processed = excluded.processed,
                total = excluded.total,
                status_message = excluded.status_message,
                eta_seconds = excluded.eta_seconds,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                scan_id = excluded.scan_id,
                error = excluded.error
            "#,
        )
        .bind(task.task_id.as_str())
        .bind(task.kind.as_str())
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(task.processed as i64)
        .bind(task.total.map(|t| t as i64))
        .bind(task.status_message.as_deref())
        .bind(task.eta_seconds)
        .bind(to_millis(task.created_at))
        .bind(opt_to_millis(task.started_at))
        .bind(opt_to_millis(task.ended_at))
        .bind(task.scan_id.as_ref().map(|s| s.as_str()))
        .bind(task.error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) async fn tasks_get(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_history WHERE task_id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_task(&r)).transpose()
    }

    pub(crate) async fn tasks_list(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_history ORDER BY created_at DESC, task_id",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    /// Tasks a previous process left queued or running.
    pub(crate) async fn tasks_fail_unfinished(&self, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_history
            SET status = 'error', error = ?, eta_seconds = NULL, ended_at = ?
            WHERE status IN ('queued', 'running')
            "#,
        )
        .bind(reason)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    let kind: String = row.get("kind");
    let kind = TaskKind::parse(&kind)
        .ok_or_else(|| DbError::invalid_state(format!("unknown task kind: {}", kind)))?;
    let status: String = row.get("status");
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| DbError::invalid_state(format!("unknown task status: {}", status)))?;

    Ok(Task {
        task_id: TaskId::from_string(row.get::<String, _>("task_id")),
        kind,
        status,
        progress: row.get("progress"),
        processed: row.get::<i64, _>("processed") as u64,
        total: row.get::<Option<i64>, _>("total").map(|t| t as u64),
        status_message: row.get("status_message"),
        eta_seconds: row.get("eta_seconds"),
        created_at: from_millis(row.get("created_at")),
        started_at: opt_from_millis(row.get("started_at")),
        ended_at: opt_from_millis(row.get("ended_at")),
        scan_id: row.get::<Option<String>, _>("scan_id").map(ScanId::from_string),
        error: row.get("error"),
    })
}
