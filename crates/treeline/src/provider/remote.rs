//! Remote provider backed by an rclone-compatible sync tool.
//!
//! Runs `<binary> lsjson [--recursive] <root>` and streams the JSON array
//! line by line, so huge remotes never need to be buffered in memory.
//! A watcher thread kills the tool once the listing is stopped, which
//! unblocks a reader parked on silent output.

use super::{EntrySink, ListingStats, Provider, ProviderError};
use crate::tasks::CancellationToken;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};
use treeline_protocol::paths::{join, normalize_root, root_is_open};
use treeline_protocol::ProviderEntry;

/// How often the watcher looks at the stop token.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Kills the child as soon as `stop` fires, until dismissed.
struct KillOnStop {
    dismissed: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl KillOnStop {
    fn watch(child: Arc<Mutex<Child>>, stop: CancellationToken) -> Self {
        let dismissed = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&dismissed);
        let watcher = std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                if stop.is_cancelled() {
                    debug!("Listing stopped, killing sync tool");
                    let _ = child.lock().kill();
                    return;
                }
                std::thread::sleep(STOP_POLL);
            }
        });
        Self {
            dismissed,
            watcher: Some(watcher),
        }
    }

    fn dismiss(mut self) {
        self.dismissed.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

impl Drop for KillOnStop {
    fn drop(&mut self) {
        self.dismissed.store(true, Ordering::SeqCst);
    }
}

pub struct RemoteSyncProvider {
    id: String,
    /// Remote prefix such as `gdrive:`
    remote: String,
    binary: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsJsonItem {
    path: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    mod_time: Option<String>,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    hashes: BTreeMap<String, String>,
}

impl RemoteSyncProvider {
    pub fn new(id: &str, remote: &str, binary: &str) -> Self {
        Self {
            id: id.to_string(),
            remote: remote.to_string(),
            binary: binary.to_string(),
        }
    }

    fn command(&self, root: &str, recursive: bool) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("lsjson");
        if recursive {
            cmd.arg("--recursive");
        }
        cmd.arg(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn spawn_error(&self, err: &std::io::Error) -> ProviderError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ProviderError::Unavailable(format!("{} is not installed", self.binary))
        } else {
            ProviderError::Unavailable(format!("failed to run {}: {}", self.binary, err))
        }
    }
}

/// Parse one line of `lsjson` output.
///
/// Returns `None` for array brackets and blank lines.
pub fn parse_lsjson_line(line: &str, root: &str) -> Option<Result<ProviderEntry, ProviderError>> {
    let trimmed = line.trim().trim_end_matches(',');
    if trimmed.is_empty() || trimmed == "[" || trimmed == "]" {
        return None;
    }

    let item: LsJsonItem = match serde_json::from_str(trimmed) {
        Ok(item) => item,
        Err(e) => return Some(Err(ProviderError::Malformed(format!("{}: {}", e, trimmed)))),
    };

    let rel = item.path.trim_matches('/');
    if rel.is_empty() {
        return Some(Err(ProviderError::Malformed("entry with empty path".to_string())));
    }

    let modified_time = item
        .mod_time
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let etag = ["md5", "sha1"]
        .iter()
        .find_map(|algo| item.hashes.get(*algo).map(|h| (algo.to_string(), h)))
        .or_else(|| item.hashes.iter().next().map(|(k, v)| (k.clone(), v)))
        .filter(|(_, hash)| !hash.is_empty())
        .map(|(algo, hash)| format!("{}:{}", algo, hash));

    let name = if item.name.is_empty() {
        rel.rsplit('/').next().unwrap_or(rel).to_string()
    } else {
        item.name
    };

    Some(Ok(ProviderEntry {
        path: join(root, rel),
        name,
        is_dir: item.is_dir,
        size: if item.is_dir { 0 } else { item.size.max(0) as u64 },
        modified_time,
        etag,
        mime_type: item.mime_type.filter(|m| !m.is_empty() && m != "inode/directory"),
    }))
}

fn classify_exit(stderr: &str, code: Option<i32>) -> ProviderError {
    let lower = stderr.to_lowercase();
    let detail = stderr.lines().last().unwrap_or("").trim().to_string();
    if lower.contains("not found") || lower.contains("doesn't exist") {
        ProviderError::NotFound(detail)
    } else if lower.contains("permission") || lower.contains("403") || lower.contains("forbidden") {
        ProviderError::PermissionDenied(detail)
    } else {
        ProviderError::Unavailable(format!("exit code {:?}: {}", code, detail))
    }
}

impl Provider for RemoteSyncProvider {
    fn id(&self) -> &str {
        &self.id
    }

    /// Relative roots are taken to live under the configured remote.
    fn resolve_root(&self, root: &str) -> String {
        let root = normalize_root(root);
        if root.contains(':') {
            return root;
        }
        let remote = normalize_root(&self.remote);
        let rel = root.trim_start_matches('/');
        if rel.is_empty() {
            return remote;
        }
        if root_is_open(&remote) {
            format!("{}{}", remote, rel)
        } else {
            format!("{}/{}", remote, rel)
        }
    }

    fn list_entries(
        &self,
        root: &str,
        recursive: bool,
        sink: &mut EntrySink,
        stop: &CancellationToken,
    ) -> Result<ListingStats, ProviderError> {
        let mut child = self
            .command(root, recursive)
            .spawn()
            .map_err(|e| self.spawn_error(&e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Unavailable("no stdout from sync tool".to_string()))?;
        let mut stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });
        let child = Arc::new(Mutex::new(child));
        let killer = KillOnStop::watch(Arc::clone(&child), stop.clone());

        let mut stats = ListingStats::default();
        let mut stopped = false;
        let mut failure = None;

        for line in BufReader::new(stdout).lines() {
            if stop.is_cancelled() {
                stopped = true;
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    failure = Some(ProviderError::Unavailable(format!("read error: {}", e)));
                    break;
                }
            };
            match parse_lsjson_line(&line, root) {
                None => {}
                Some(Ok(entry)) => {
                    stats.entries += 1;
                    if !sink.push(entry) {
                        stopped = true;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(provider = %self.id, error = %e, "Skipping malformed listing line");
                    stats.skipped += 1;
                }
            }
        }

        // A kill from the watcher surfaces here as EOF or a read error
        if stop.is_cancelled() {
            stopped = true;
            failure = None;
        }
        killer.dismiss();

        let mut child = child.lock();
        if stopped || failure.is_some() {
            debug!(provider = %self.id, root, "Killing sync tool");
            let _ = child.kill();
        }
        let status = child
            .wait()
            .map_err(|e| ProviderError::Unavailable(format!("wait failed: {}", e)))?;
        let stderr = stderr_reader.join().unwrap_or_default();

        if let Some(err) = failure {
            return Err(err);
        }
        if !stopped && !status.success() {
            return Err(classify_exit(&stderr, status.code()));
        }
        Ok(stats)
    }
}
