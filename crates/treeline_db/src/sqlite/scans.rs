//! `scans` and `commit_outcomes` queries.

use super::{from_millis, opt_from_millis, opt_to_millis, to_millis, IndexDb};
use crate::error::{DbError, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use treeline_protocol::{CommitOutcome, ScanId, ScanRecord, ScanStatus};

const SCAN_COLUMNS: &str = "id, provider_id, root_path, recursive, started_at, ended_at, status, file_count, folder_count, committed, committed_at, error, cache_hits, cache_misses, synthesized_folders";

impl IndexDb {
    // ========================================================================
    // Scan Records
    // ========================================================================

    pub(crate) async fn scans_upsert(&self, scan: &ScanRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scans (id, provider_id, root_path, recursive, started_at, ended_at, status,
                               file_count, folder_count, committed, committed_at, error,
                               cache_hits, cache_misses, synthesized_folders)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ended_at = excluded.ended_at,
                status = excluded.status,
                file_count = excluded.file_count,
                folder_count = excluded.folder_count,
                committed = excluded.committed,
                committed_at = excluded.committed_at,
                error = excluded.error,
                cache_hits = excluded.cache_hits,
                cache_misses = excluded.cache_misses,
                synthesized_folders = excluded.synthesized_folders
            "#,
        )
        .bind(scan.id.as_str())
        .bind(&scan.provider_id)
        .bind(&scan.root_path)
        .bind(scan.recursive)
        .bind(to_millis(scan.started_at))
        .bind(opt_to_millis(scan.ended_at))
        .bind(scan.status.as_str())
        .bind(scan.file_count as i64)
        .bind(scan.folder_count as i64)
        .bind(scan.committed)
        .bind(opt_to_millis(scan.committed_at))
        .bind(scan.error.as_deref())
        .bind(scan.cache_hits as i64)
        .bind(scan.cache_misses as i64)
        .bind(scan.synthesized_folders as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) async fn scans_get(&self, scan_id: &ScanId) -> Result<Option<ScanRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM scans WHERE id = ?", SCAN_COLUMNS))
            .bind(scan_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_scan(&r)).transpose()
    }

    pub(crate) async fn scans_list(&self) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scans ORDER BY started_at DESC, id",
            SCAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_scan).collect()
    }

    pub(crate) async fn scans_mark_committed(&self, scan_id: &ScanId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE scans SET committed = 1, committed_at = ? WHERE id = ?")
            .bind(to_millis(at))
            .bind(scan_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("scan {}", scan_id)));
        }
        Ok(())
    }

    pub(crate) async fn scans_delete(&self, scan_id: &ScanId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM commit_outcomes WHERE scan_id = ?")
            .bind(scan_id.as_str())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM scans WHERE id = ?")
            .bind(scan_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn scans_fail_running(&self, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE scans SET status = 'error', error = ?, ended_at = ? WHERE status = 'running'",
        )
        .bind(reason)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Commit Outcomes
    // ========================================================================

    pub(crate) async fn commits_insert(&self, outcome: &CommitOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO commit_outcomes (scan_id, attempted_at, files_in_scan, folders_in_scan,
                                         matched_in_graph, linked_edges_added, neo4j_attempted,
                                         neo4j_db_verified, neo4j_db_files, neo4j_db_folders, neo4j_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(outcome.scan_id.as_str())
        .bind(to_millis(outcome.attempted_at))
        .bind(outcome.files_in_scan as i64)
        .bind(outcome.folders_in_scan as i64)
        .bind(outcome.matched_in_graph as i64)
        .bind(outcome.linked_edges_added as i64)
        .bind(outcome.neo4j_attempted)
        .bind(outcome.neo4j_db_verified)
        .bind(outcome.neo4j_db_files as i64)
        .bind(outcome.neo4j_db_folders as i64)
        .bind(outcome.neo4j_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) async fn commits_last(&self, scan_id: &ScanId) -> Result<Option<CommitOutcome>> {
        let row = sqlx::query(
            r#"
            SELECT scan_id, attempted_at, files_in_scan, folders_in_scan, matched_in_graph,
                   linked_edges_added, neo4j_attempted, neo4j_db_verified, neo4j_db_files,
                   neo4j_db_folders, neo4j_error
            FROM commit_outcomes WHERE scan_id = ?
            ORDER BY attempted_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(scan_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CommitOutcome {
            scan_id: ScanId::from_string(r.get::<String, _>("scan_id")),
            files_in_scan: r.get::<i64, _>("files_in_scan") as u64,
            folders_in_scan: r.get::<i64, _>("folders_in_scan") as u64,
            matched_in_graph: r.get::<i64, _>("matched_in_graph") as u64,
            linked_edges_added: r.get::<i64, _>("linked_edges_added") as u64,
            neo4j_attempted: r.get("neo4j_attempted"),
            neo4j_db_verified: r.get("neo4j_db_verified"),
            neo4j_db_files: r.get::<i64, _>("neo4j_db_files") as u64,
            neo4j_db_folders: r.get::<i64, _>("neo4j_db_folders") as u64,
            neo4j_error: r.get("neo4j_error"),
            attempted_at: from_millis(r.get("attempted_at")),
        }))
    }
}

fn row_to_scan(row: &sqlx::sqlite::SqliteRow) -> Result<ScanRecord> {
    let status: String = row.get("status");
    let status = ScanStatus::parse(&status)
        .ok_or_else(|| DbError::invalid_state(format!("unknown scan status: {}", status)))?;

    Ok(ScanRecord {
        id: ScanId::from_string(row.get::<String, _>("id")),
        provider_id: row.get("provider_id"),
        root_path: row.get("root_path"),
        recursive: row.get("recursive"),
        started_at: from_millis(row.get("started_at")),
        ended_at: opt_from_millis(row.get("ended_at")),
        status,
        file_count: row.get::<i64, _>("file_count") as u64,
        folder_count: row.get::<i64, _>("folder_count") as u64,
        committed: row.get("committed"),
        committed_at: opt_from_millis(row.get("committed_at")),
        error: row.get("error"),
        cache_hits: row.get::<i64, _>("cache_hits") as u64,
        cache_misses: row.get::<i64, _>("cache_misses") as u64,
        synthesized_folders: row.get::<i64, _>("synthesized_folders") as u64,
    })
}
