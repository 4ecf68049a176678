//! Engine configuration.
//!
//! Built once at start-up (usually from a TOML file), then frozen behind an
//! `Arc` and passed to every component.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use treeline_db::StoreBackend;

/// Directory names skipped by filesystem providers
pub const DEFAULT_EXCLUDE_DIR_NAMES: &[&str] = &[".git", "node_modules", "__pycache__"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tasks allowed to run at once; submissions beyond this are rejected
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Provider entries per batch (also the cancellation granularity)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Longest wait for the next provider batch
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Longest wait for one graph store call
    #[serde(default = "default_graph_timeout_secs")]
    pub graph_timeout_secs: u64,

    /// Rows per graph write statement
    #[serde(default = "default_graph_batch_size")]
    pub graph_batch_size: usize,

    /// Weight of the newest sample in the per-item time average (0, 1]
    #[serde(default = "default_eta_smoothing")]
    pub eta_smoothing: f64,

    /// Finished tasks kept in memory; older ones are served from history
    #[serde(default = "default_finished_tasks_retained")]
    pub finished_tasks_retained: usize,

    /// Ask the provider for a cheap total before listing
    #[serde(default = "default_true")]
    pub count_before_scan: bool,

    /// Commit automatically after a successful scan
    #[serde(default)]
    pub auto_commit: bool,

    #[serde(default = "default_exclude_dir_names")]
    pub exclude_dir_names: Vec<String>,

    #[serde(default)]
    pub store: StoreBackend,

    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

/// Where commits go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphConfig {
    /// Commits are recorded as not attempted
    #[default]
    Disabled,
    Memory,
    Neo4j {
        url: String,
        user: String,
        password: String,
        #[serde(default = "default_neo4j_database")]
        database: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: ProviderKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Mounted {
        mount_point: PathBuf,
    },
    RemoteSync {
        /// Remote prefix, e.g. `gdrive:`
        remote: String,
        #[serde(default = "default_sync_binary")]
        binary: String,
    },
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_batch_size() -> usize {
    500
}

fn default_page_size() -> usize {
    200
}

fn default_max_page_size() -> usize {
    1000
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_graph_timeout_secs() -> u64 {
    30
}

fn default_graph_batch_size() -> usize {
    1000
}

fn default_eta_smoothing() -> f64 {
    0.2
}

fn default_finished_tasks_retained() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_exclude_dir_names() -> Vec<String> {
    DEFAULT_EXCLUDE_DIR_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig {
        id: "local".to_string(),
        kind: ProviderKind::Local,
    }]
}

fn default_neo4j_database() -> String {
    "neo4j".to_string()
}

fn default_sync_binary() -> String {
    "rclone".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            provider_timeout_secs: default_provider_timeout_secs(),
            graph_timeout_secs: default_graph_timeout_secs(),
            graph_batch_size: default_graph_batch_size(),
            eta_smoothing: default_eta_smoothing(),
            finished_tasks_retained: default_finished_tasks_retained(),
            count_before_scan: true,
            auto_commit: false,
            exclude_dir_names: default_exclude_dir_names(),
            store: StoreBackend::default(),
            graph: GraphConfig::default(),
            providers: default_providers(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("{}: {}", path.display(), e)))?;
        let config: EngineConfig =
            toml::from_str(&content).map_err(|e| EngineError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| EngineError::config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| EngineError::config(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(EngineError::config("max_concurrent_tasks must be at least 1"));
        }
        if self.batch_size == 0 || self.graph_batch_size == 0 {
            return Err(EngineError::config("batch sizes must be at least 1"));
        }
        if self.page_size == 0 || self.max_page_size == 0 {
            return Err(EngineError::config("page sizes must be at least 1"));
        }
        if !(self.eta_smoothing > 0.0 && self.eta_smoothing <= 1.0) {
            return Err(EngineError::config("eta_smoothing must be in (0, 1]"));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(EngineError::config("provider id must not be empty"));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(EngineError::config(format!(
                    "duplicate provider id: {}",
                    provider.id
                )));
            }
        }
        Ok(())
    }

    /// Requested page size, defaulted and clamped to `max_page_size`.
    pub fn effective_page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_size)
            .clamp(1, self.max_page_size)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn graph_timeout(&self) -> Duration {
        Duration::from_secs(self.graph_timeout_secs)
    }
}
