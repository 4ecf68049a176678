//! Path arithmetic for provider-qualified paths.
//!
//! Paths are plain strings, always `/`-separated. A root is either a
//! conventional absolute path (`/data`, `C:/data`) or an rclone-style
//! remote (`remote:`, `remote:bucket`). Roots ending in `/` or `:` are
//! "open": children are formed by direct concatenation.

use blake3::Hasher;
use std::path::{Path, PathBuf};

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Stable key for a (provider, root) pair. Fingerprint caches are scoped by it.
pub fn logical_root_key(provider_id: &str, root: &str) -> String {
    hash_parts(&[provider_id, root])
}

fn is_drive(prefix: &str) -> bool {
    let bytes = prefix.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Normalize a user-supplied root: forward slashes, no trailing separator.
///
/// `/` and drive roots like `C:/` keep their slash.
pub fn normalize_root(input: &str) -> String {
    let mut s = input.trim().replace('\\', "/");
    while s.len() > 1 && s.ends_with('/') {
        if is_drive(&s[..s.len() - 1]) {
            break;
        }
        s.pop();
    }
    s
}

/// Normalize a filesystem path to a forward-slash string.
pub fn path_to_forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub fn root_is_open(root: &str) -> bool {
    root.ends_with('/') || root.ends_with(':')
}

/// Join a root-relative path onto a root.
pub fn join(root: &str, rel: &str) -> String {
    if rel.is_empty() {
        root.to_string()
    } else if root_is_open(root) {
        format!("{}{}", root, rel)
    } else {
        format!("{}/{}", root, rel)
    }
}

/// Path relative to `root`, or `None` if `path` is not inside it.
///
/// Returns `Some("")` when `path` is the root itself. `/database` is not
/// inside `/data`.
pub fn relative_to<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    if path == root {
        return Some("");
    }
    let rest = path.strip_prefix(root)?;
    let rel = if root_is_open(root) {
        rest
    } else {
        rest.strip_prefix('/')?
    };
    let rel = rel.trim_end_matches('/');
    if rel.is_empty() || rel.starts_with('/') {
        return None;
    }
    Some(rel)
}

/// Parent of `path` within `root`. The root itself has no parent.
pub fn parent_within(path: &str, root: &str) -> Option<String> {
    let rel = relative_to(path, root)?;
    if rel.is_empty() {
        return None;
    }
    match rel.rfind('/') {
        Some(idx) => Some(join(root, &rel[..idx])),
        None => Some(root.to_string()),
    }
}

/// Folders strictly between `root` and `path`, shallowest first.
pub fn ancestors_within(path: &str, root: &str) -> Vec<String> {
    let Some(rel) = relative_to(path, root) else {
        return Vec::new();
    };
    if rel.is_empty() {
        return Vec::new();
    }
    let segments: Vec<&str> = rel.split('/').collect();
    (1..segments.len())
        .map(|i| join(root, &segments[..i].join("/")))
        .collect()
}

/// Number of segments between `root` and `path` (root = 0).
pub fn depth_within(path: &str, root: &str) -> Option<u32> {
    let rel = relative_to(path, root)?;
    if rel.is_empty() {
        Some(0)
    } else {
        Some(rel.split('/').count() as u32)
    }
}

/// Last path segment. Bare roots (`/`, `remote:`) name themselves.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return path;
    }
    let tail = match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    };
    let tail = match tail.rfind(':') {
        Some(idx) => &tail[idx + 1..],
        None => tail,
    };
    if tail.is_empty() {
        trimmed
    } else {
        tail
    }
}

/// Lowercased extension of a file name. Dotfiles have none.
pub fn extension_of(name: &str) -> Option<String> {
    let idx = name.rfind('.')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    Some(name[idx + 1..].to_lowercase())
}

/// Resolve the Treeline home directory.
///
/// Priority:
/// 1) explicit override (CLI flag or TREELINE_HOME, resolved by the caller)
/// 2) HOME/.treeline
/// 3) ./.treeline
pub fn resolve_home(override_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path;
    }
    match dirs::home_dir() {
        Some(home) => home.join(".treeline"),
        None => PathBuf::from(".").join(".treeline"),
    }
}

/// Default durable index path: <home>/index.sqlite
pub fn default_index_path(home: &Path) -> PathBuf {
    home.join("index.sqlite")
}

/// Default config path: <home>/treeline.toml
pub fn default_config_path(home: &Path) -> PathBuf {
    home.join("treeline.toml")
}

/// Default logs directory: <home>/logs
pub fn default_logs_dir(home: &Path) -> PathBuf {
    home.join("logs")
}
