//! Neo4j adapter over the HTTP transactional endpoint.
//!
//! Each call is one auto-commit transaction holding a few set-based
//! `UNWIND ... MERGE` statements, so a batch of any size costs a single
//! round trip.

use super::{GraphCounts, GraphError, GraphResult, GraphStore, WriteStats};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use treeline_protocol::{IndexRow, ScanId, ScanRecord};

const SCHEMA: &[&str] = &[
    "CREATE CONSTRAINT treeline_scan_id IF NOT EXISTS FOR (s:Scan) REQUIRE s.id IS UNIQUE",
    "CREATE CONSTRAINT treeline_folder_key IF NOT EXISTS FOR (f:Folder) REQUIRE (f.scan_id, f.path) IS UNIQUE",
    "CREATE CONSTRAINT treeline_file_key IF NOT EXISTS FOR (f:File) REQUIRE (f.scan_id, f.path) IS UNIQUE",
];

const MERGE_SCAN: &str = "\
MERGE (s:Scan {id: $scan_id})
SET s.provider_id = $provider_id, s.root_path = $root_path,
    s.recursive = $recursive, s.started_at = $started_at,
    s.file_count = $file_count, s.folder_count = $folder_count";

const MERGE_FOLDER_NODES: &str = "\
MATCH (s:Scan {id: $scan_id})
UNWIND $folders AS f
MERGE (n:Folder {scan_id: $scan_id, path: f.path})
SET n.name = f.name, n.depth = f.depth, n.modified_time = f.modified_time,
    n.synthesized = f.synthesized
MERGE (n)-[:SCANNED_IN]->(s)";

const LINK_FOLDERS: &str = "\
UNWIND $folders AS f
WITH f WHERE f.parent_path IS NOT NULL
MATCH (p:Folder {scan_id: $scan_id, path: f.parent_path})
MATCH (c:Folder {scan_id: $scan_id, path: f.path})
MERGE (p)-[:CONTAINS]->(c)";

const MERGE_FILES: &str = "\
MATCH (s:Scan {id: $scan_id})
UNWIND $rows AS r
MERGE (n:File {scan_id: $scan_id, path: r.path})
SET n.name = r.name, n.size = r.size, n.extension = r.extension,
    n.mime_type = r.mime_type, n.modified_time = r.modified_time,
    n.fingerprint = r.fingerprint, n.depth = r.depth
MERGE (n)-[:SCANNED_IN]->(s)
WITH n, r
MATCH (p:Folder {scan_id: $scan_id, path: r.parent_path})
MERGE (p)-[:CONTAINS]->(n)";

const COUNT_SCAN: &str = "\
MATCH (s:Scan {id: $scan_id})
OPTIONAL MATCH (f:File)-[:SCANNED_IN]->(s)
WITH s, count(DISTINCT f) AS files
OPTIONAL MATCH (d:Folder)-[:SCANNED_IN]->(s)
RETURN files, count(DISTINCT d) AS folders";

const DELETE_SCAN_NODES: &str = "\
MATCH (n)-[:SCANNED_IN]->(:Scan {id: $scan_id})
WHERE NOT EXISTS {
  MATCH (n)-[:SCANNED_IN]->(other:Scan) WHERE other.id <> $scan_id
}
DETACH DELETE n";

const DELETE_SCAN: &str = "\
MATCH (s:Scan {id: $scan_id})
DETACH DELETE s";

pub struct Neo4jGraph {
    client: Client,
    endpoint: String,
    user: String,
    password: String,
    schema: OnceCell<()>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data: Vec<DataRow>,
    #[serde(default)]
    stats: Option<TxStats>,
}

#[derive(Debug, Deserialize)]
struct DataRow {
    row: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TxStats {
    #[serde(default)]
    nodes_created: u64,
    #[serde(default)]
    nodes_deleted: u64,
    #[serde(default)]
    relationships_created: u64,
    #[serde(default)]
    relationships_deleted: u64,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    #[serde(default)]
    message: String,
}

impl Neo4jGraph {
    pub fn new(
        url: &str,
        user: &str,
        password: &str,
        database: &str,
        timeout: Duration,
    ) -> GraphResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GraphError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/db/{}/tx/commit", url.trim_end_matches('/'), database),
            user: user.to_string(),
            password: password.to_string(),
            schema: OnceCell::new(),
        })
    }

    async fn run(&self, statements: Vec<Value>) -> GraphResult<Vec<StatementResult>> {
        let body = json!({ "statements": statements });
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GraphError::Auth(format!("HTTP {}", status)));
        }
        if status.is_server_error() {
            return Err(GraphError::Unavailable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GraphError::Query(format!("HTTP {}: {}", status, text)));
        }

        let parsed: TxResponse = response
            .json()
            .await
            .map_err(|e| GraphError::Query(format!("unreadable response: {}", e)))?;
        if let Some(err) = parsed.errors.into_iter().next() {
            return Err(classify_tx_error(err));
        }
        Ok(parsed.results)
    }

    async fn write(&self, statements: Vec<Value>) -> GraphResult<WriteStats> {
        self.ensure_schema().await?;
        let results = self.run(statements).await?;
        let mut stats = WriteStats::default();
        for result in results {
            let s = result.stats.unwrap_or_default();
            stats.merge(WriteStats {
                nodes_created: s.nodes_created,
                nodes_deleted: s.nodes_deleted,
                relationships_created: s.relationships_created,
                relationships_deleted: s.relationships_deleted,
            });
        }
        Ok(stats)
    }
}

fn statement(cypher: &str, parameters: Value) -> Value {
    json!({
        "statement": cypher,
        "parameters": parameters,
        "includeStats": true,
    })
}

fn row_params(row: &IndexRow) -> Value {
    json!({
        "path": row.path,
        "parent_path": row.parent_path,
        "name": row.name,
        "depth": row.depth,
        "size": row.size,
        "extension": row.extension,
        "mime_type": row.mime_type,
        "modified_time": row.modified_time.map(|t| t.to_rfc3339()),
        "fingerprint": row.fingerprint,
        "synthesized": row.synthesized,
    })
}

fn classify_transport(err: reqwest::Error) -> GraphError {
    if err.is_connect() || err.is_timeout() {
        GraphError::Unavailable(err.to_string())
    } else {
        GraphError::Query(err.to_string())
    }
}

fn classify_tx_error(err: TxError) -> GraphError {
    let detail = format!("{}: {}", err.code, err.message);
    if err.code.contains(".Security.") {
        GraphError::Auth(detail)
    } else if err.code.contains("TransientError") {
        GraphError::Unavailable(detail)
    } else {
        GraphError::Query(detail)
    }
}

fn count_value(row: &DataRow, idx: usize) -> u64 {
    row.row.get(idx).and_then(Value::as_u64).unwrap_or(0)
}

#[async_trait]
impl GraphStore for Neo4jGraph {
    async fn ensure_schema(&self) -> GraphResult<()> {
        self.schema
            .get_or_try_init(|| async {
                let statements = SCHEMA.iter().map(|s| statement(s, json!({}))).collect();
                self.run(statements).await?;
                info!(endpoint = %self.endpoint, "Graph constraints ensured");
                Ok::<_, GraphError>(())
            })
            .await?;
        Ok(())
    }

    async fn merge_scan(&self, scan: &ScanRecord) -> GraphResult<WriteStats> {
        self.write(vec![statement(
            MERGE_SCAN,
            json!({
                "scan_id": scan.id.as_str(),
                "provider_id": scan.provider_id,
                "root_path": scan.root_path,
                "recursive": scan.recursive,
                "started_at": scan.started_at.to_rfc3339(),
                "file_count": scan.file_count,
                "folder_count": scan.folder_count,
            }),
        )])
        .await
    }

    async fn merge_folders(&self, scan_id: &ScanId, folders: &[IndexRow]) -> GraphResult<WriteStats> {
        let params = json!({
            "scan_id": scan_id.as_str(),
            "folders": folders.iter().map(row_params).collect::<Vec<_>>(),
        });
        debug!(scan_id = %scan_id, folders = folders.len(), "Merging folders");
        self.write(vec![
            statement(MERGE_FOLDER_NODES, params.clone()),
            statement(LINK_FOLDERS, params),
        ])
        .await
    }

    async fn merge_files(&self, scan_id: &ScanId, files: &[IndexRow]) -> GraphResult<WriteStats> {
        let params = json!({
            "scan_id": scan_id.as_str(),
            "rows": files.iter().map(row_params).collect::<Vec<_>>(),
        });
        debug!(scan_id = %scan_id, files = files.len(), "Merging files");
        self.write(vec![statement(MERGE_FILES, params)]).await
    }

    async fn count_scan(&self, scan_id: &ScanId) -> GraphResult<GraphCounts> {
        let results = self
            .run(vec![statement(COUNT_SCAN, json!({ "scan_id": scan_id.as_str() }))])
            .await?;
        let counts = results
            .first()
            .and_then(|r| r.data.first())
            .map(|row| GraphCounts {
                files: count_value(row, 0),
                folders: count_value(row, 1),
            })
            .unwrap_or_default();
        Ok(counts)
    }

    async fn delete_scan(&self, scan_id: &ScanId) -> GraphResult<WriteStats> {
        let params = json!({ "scan_id": scan_id.as_str() });
        self.write(vec![
            statement(DELETE_SCAN_NODES, params.clone()),
            statement(DELETE_SCAN, params),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_error_classification() {
        let auth = classify_tx_error(TxError {
            code: "Neo.ClientError.Security.Unauthorized".to_string(),
            message: "bad credentials".to_string(),
        });
        assert!(matches!(auth, GraphError::Auth(_)));

        let transient = classify_tx_error(TxError {
            code: "Neo.TransientError.General.DatabaseUnavailable".to_string(),
            message: String::new(),
        });
        assert!(matches!(transient, GraphError::Unavailable(_)));

        let query = classify_tx_error(TxError {
            code: "Neo.ClientError.Statement.SyntaxError".to_string(),
            message: "oops".to_string(),
        });
        assert!(matches!(query, GraphError::Query(_)));
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "results": [{"columns": ["files", "folders"], "data": [{"row": [3, 2], "meta": [null, null]}],
                         "stats": {"nodes_created": 4, "relationships_created": 7, "contains_updates": true}}],
            "errors": []
        }"#;
        let parsed: TxResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.errors.is_empty());
        let result = &parsed.results[0];
        assert_eq!(count_value(&result.data[0], 0), 3);
        assert_eq!(count_value(&result.data[0], 1), 2);
        let stats = result.stats.as_ref().unwrap();
        assert_eq!((stats.nodes_created, stats.relationships_created), (4, 7));
    }

    #[test]
    fn test_endpoint_and_row_params() {
        let graph = Neo4jGraph::new(
            "http://localhost:7474/",
            "neo4j",
            "pw",
            "files",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(graph.endpoint, "http://localhost:7474/db/files/tx/commit");

        let row = IndexRow {
            scan_id: ScanId::from_string("s"),
            path: "/r/a.txt".to_string(),
            parent_path: Some("/r".to_string()),
            name: "a.txt".to_string(),
            depth: 1,
            kind: treeline_protocol::EntryKind::File,
            size: 12,
            modified_time: None,
            extension: Some("txt".to_string()),
            mime_type: Some("text/plain".to_string()),
            fingerprint: None,
            synthesized: false,
        };
        let params = row_params(&row);
        assert_eq!(params["parent_path"], "/r");
        assert_eq!(params["size"], 12);
        assert!(params["modified_time"].is_null());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let graph = Neo4jGraph::new(
            "http://127.0.0.1:9",
            "neo4j",
            "pw",
            "neo4j",
            Duration::from_secs(2),
        )
        .unwrap();
        let err = graph.count_scan(&ScanId::from_string("s")).await.unwrap_err();
        assert!(matches!(err, GraphError::Unavailable(_)));
    }
}
