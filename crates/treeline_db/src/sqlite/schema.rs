//! Table definitions for the durable backend.

use super::IndexDb;
use crate::error::Result;
use tracing::info;

impl IndexDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        self.create_index_tables().await?;
        self.create_ledger_tables().await?;

        info!("Index schema verified");
        Ok(())
    }

    async fn create_index_tables(&self) -> Result<()> {
        // kind_rank mirrors kind (folder=0, file=1) so listings sort on a column
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS index_rows (
                scan_id TEXT NOT NULL,
                path TEXT NOT NULL,
                parent_path TEXT,
                name TEXT NOT NULL,
                depth INTEGER NOT NULL,
                kind TEXT NOT NULL,
                kind_rank INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                modified_at INTEGER,
                extension TEXT,
                mime_type TEXT,
                fingerprint TEXT,
                synthesized INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (scan_id, path)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_index_rows_parent ON index_rows(scan_id, parent_path, kind_rank, name, path)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS cache_fingerprints (
                root_key TEXT NOT NULL,
                path TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                row_json TEXT NOT NULL,
                PRIMARY KEY (root_key, path)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_ledger_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scans (
                id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL,
                root_path TEXT NOT NULL,
                recursive INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                status TEXT NOT NULL,
                file_count INTEGER NOT NULL DEFAULT 0,
                folder_count INTEGER NOT NULL DEFAULT 0,
                committed INTEGER NOT NULL DEFAULT 0,
                committed_at INTEGER,
                error TEXT,
                cache_hits INTEGER NOT NULL DEFAULT 0,
                cache_misses INTEGER NOT NULL DEFAULT 0,
                synthesized_folders INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS task_history (
                task_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                total INTEGER,
                status_message TEXT,
                eta_seconds REAL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                scan_id TEXT,
                error TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS commit_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_id TEXT NOT NULL,
                attempted_at INTEGER NOT NULL,
                files_in_scan INTEGER NOT NULL,
                folders_in_scan INTEGER NOT NULL,
                matched_in_graph INTEGER NOT NULL,
                linked_edges_added INTEGER NOT NULL,
                neo4j_attempted INTEGER NOT NULL,
                neo4j_db_verified INTEGER NOT NULL,
                neo4j_db_files INTEGER NOT NULL,
                neo4j_db_folders INTEGER NOT NULL,
                neo4j_error TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_commit_outcomes_scan ON commit_outcomes(scan_id, attempted_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
