//! `index_rows` queries.

use super::{opt_from_millis, opt_to_millis, IndexDb};
use crate::error::{DbError, Result};
use crate::page::{decode_token, encode_token};
use crate::traits::{check_batch, ChildFilter, IndexPage};
use sqlx::Row;
use treeline_protocol::{EntryKind, IndexRow, RowCounts, ScanId};

const ROW_COLUMNS: &str = "scan_id, path, parent_path, name, depth, kind, size, modified_at, extension, mime_type, fingerprint, synthesized";

impl IndexDb {
    /// Insert a batch in one transaction so parents land with their children.
    pub(crate) async fn rows_insert(&self, scan_id: &ScanId, rows: &[IndexRow]) -> Result<u64> {
        check_batch(scan_id, rows)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO index_rows (scan_id, path, parent_path, name, depth, kind, kind_rank,
                                        size, modified_at, extension, mime_type, fingerprint, synthesized)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(scan_id, path) DO UPDATE SET
                    parent_path = excluded.parent_path,
                    name = excluded.name,
                    depth = excluded.depth,
                    kind = excluded.kind,
                    kind_rank = excluded.kind_rank,
                    size = excluded.size,
                    modified_at = excluded.modified_at,
                    extension = excluded.extension,
                    mime_type = excluded.mime_type,
                    fingerprint = excluded.fingerprint,
                    synthesized = excluded.synthesized
                WHERE index_rows.synthesized = 1 AND excluded.synthesized = 0
                "#,
            )
            .bind(row.scan_id.as_str())
            .bind(&row.path)
            .bind(row.parent_path.as_deref())
            .bind(&row.name)
            .bind(row.depth as i64)
            .bind(row.kind.as_str())
            .bind(row.kind.sort_rank() as i64)
            .bind(row.size as i64)
            .bind(opt_to_millis(row.modified_time))
            .bind(row.extension.as_deref())
            .bind(row.mime_type.as_deref())
            .bind(row.fingerprint.as_deref())
            .bind(row.synthesized)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    pub(crate) async fn rows_get(&self, scan_id: &ScanId, path: &str) -> Result<Option<IndexRow>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM index_rows WHERE scan_id = ? AND path = ?",
            ROW_COLUMNS
        ))
        .bind(scan_id.as_str())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_index_row(&r)).transpose()
    }

    pub(crate) async fn rows_children(
        &self,
        scan_id: &ScanId,
        parent_path: &str,
        filter: &ChildFilter,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<IndexPage> {
        let after = page_token.map(decode_token).transpose()?;
        let kind = filter.kind.map(|k| k.as_str());
        let extension = filter.normalized_extension();

        let fetched = sqlx::query(&format!(
            r#"
            SELECT {} FROM index_rows
            WHERE scan_id = ? AND parent_path = ?
              AND (? IS NULL OR kind = ?)
              AND (? IS NULL OR extension = ?)
              AND (? IS NULL OR (kind_rank, name, path) > (?, ?, ?))
            ORDER BY kind_rank, name, path
            LIMIT ?
            "#,
            ROW_COLUMNS
        ))
        .bind(scan_id.as_str())
        .bind(parent_path)
        .bind(kind)
        .bind(kind)
        .bind(extension.as_deref())
        .bind(extension.as_deref())
        .bind(after.as_ref().map(|k| k.rank as i64))
        .bind(after.as_ref().map(|k| k.rank as i64))
        .bind(after.as_ref().map(|k| k.name.as_str()))
        .bind(after.as_ref().map(|k| k.path.as_str()))
        .bind(limit.saturating_add(1).min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut rows = fetched
            .iter()
            .map(row_to_index_row)
            .collect::<Result<Vec<_>>>()?;

        let next_token = if rows.len() > limit {
            rows.truncate(limit);
            match rows.last() {
                Some(last) => Some(encode_token(&last.sort_key())?),
                None => None,
            }
        } else {
            None
        };

        Ok(IndexPage { rows, next_token })
    }

    pub(crate) async fn rows_for_scan(&self, scan_id: &ScanId) -> Result<Vec<IndexRow>> {
        let fetched = sqlx::query(&format!(
            "SELECT {} FROM index_rows WHERE scan_id = ? ORDER BY kind_rank, depth, path",
            ROW_COLUMNS
        ))
        .bind(scan_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        fetched.iter().map(row_to_index_row).collect()
    }

    pub(crate) async fn rows_count(&self, scan_id: &ScanId) -> Result<RowCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN kind = 'file' THEN 1 ELSE 0 END), 0) AS files,
                COALESCE(SUM(CASE WHEN kind = 'folder' THEN 1 ELSE 0 END), 0) AS folders
            FROM index_rows WHERE scan_id = ?
            "#,
        )
        .bind(scan_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(RowCounts {
            files: row.get::<i64, _>("files") as u64,
            folders: row.get::<i64, _>("folders") as u64,
        })
    }

    pub(crate) async fn rows_delete(&self, scan_id: &ScanId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM index_rows WHERE scan_id = ?")
            .bind(scan_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_index_row(row: &sqlx::sqlite::SqliteRow) -> Result<IndexRow> {
    let kind: String = row.get("kind");
    let kind = EntryKind::parse(&kind)
        .ok_or_else(|| DbError::invalid_state(format!("unknown row kind: {}", kind)))?;

    Ok(IndexRow {
        scan_id: ScanId::from_string(row.get::<String, _>("scan_id")),
        path: row.get("path"),
        parent_path: row.get("parent_path"),
        name: row.get("name"),
        depth: row.get::<i64, _>("depth") as u32,
        kind,
        size: row.get::<i64, _>("size") as u64,
        modified_time: opt_from_millis(row.get("modified_at")),
        extension: row.get("extension"),
        mime_type: row.get("mime_type"),
        fingerprint: row.get("fingerprint"),
        synthesized: row.get("synthesized"),
    })
}
