//! `cache_fingerprints` queries.

use super::IndexDb;
use crate::error::Result;
use crate::traits::CacheEntry;
use sqlx::Row;
use std::collections::HashMap;
use tracing::debug;
use treeline_protocol::IndexRow;

impl IndexDb {
    pub(crate) async fn fingerprints_load(&self, root_key: &str) -> Result<HashMap<String, CacheEntry>> {
        let rows = sqlx::query(
            "SELECT path, fingerprint, row_json FROM cache_fingerprints WHERE root_key = ?",
        )
        .bind(root_key)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            let path: String = row.get("path");
            let row_json: String = row.get("row_json");
            let template: IndexRow = serde_json::from_str(&row_json)?;
            entries.insert(
                path,
                CacheEntry {
                    fingerprint: row.get("fingerprint"),
                    row: template,
                },
            );
        }
        Ok(entries)
    }

    /// Swap the whole root in one transaction; readers see old or new, never a mix.
    pub(crate) async fn fingerprints_replace(&self, root_key: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM cache_fingerprints WHERE root_key = ?")
            .bind(root_key)
            .execute(&mut *tx)
            .await?;

        for entry in &entries {
            let row_json = serde_json::to_string(&entry.row)?;
            sqlx::query(
                r#"
                INSERT INTO cache_fingerprints (root_key, path, fingerprint, row_json)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(root_key, path) DO UPDATE SET
                    fingerprint = excluded.fingerprint,
                    row_json = excluded.row_json
                "#,
            )
            .bind(root_key)
            .bind(&entry.row.path)
            .bind(&entry.fingerprint)
            .bind(&row_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(root_key, entries = entries.len(), "Fingerprints replaced");
        Ok(())
    }
}
