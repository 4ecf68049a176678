//! Logging setup for the Treeline binary: size-capped log files plus stderr.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "treeline=info,treeline_db=info";
const KEEP_LOG_FILES: usize = 5;
const MAX_LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// How the process wants its logs.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Directory for `<app_name>.log` and its rotations
    pub log_dir: PathBuf,
    /// Mirror the full file filter to stderr
    pub verbose: bool,
    /// Only warnings and errors on stderr
    pub quiet: bool,
}

/// Install the global subscriber. Call once per process.
///
/// `RUST_LOG` overrides the default filter for both layers.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    fs::create_dir_all(&config.log_dir).with_context(|| {
        format!("Failed to create logs directory: {}", config.log_dir.display())
    })?;
    let file_writer = SharedLogWriter::open(&config.log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = console_filter(&config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(())
}

fn console_filter(config: &LogConfig<'_>) -> EnvFilter {
    if config.quiet {
        EnvFilter::new("warn")
    } else if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("treeline=debug,treeline_db=debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Append-only log file that shifts itself to `.1`, `.2`, ... when full.
struct RotatingFile {
    dir: PathBuf,
    stem: String,
    keep: usize,
    max_bytes: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, app_name: &str, keep: usize, max_bytes: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut log = Self {
            dir: dir.to_path_buf(),
            stem: sanitize_name(app_name),
            keep: keep.max(1),
            max_bytes,
            file: None,
            written: 0,
        };
        log.reopen()?;
        if log.written > log.max_bytes {
            log.roll()?;
        }
        Ok(log)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn numbered_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, n))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let last = self.keep - 1;
        if last > 0 {
            let oldest = self.numbered_path(last);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..last).rev() {
                let from = self.numbered_path(n);
                if from.exists() {
                    fs::rename(&from, self.numbered_path(n + 1))?;
                }
            }
            let active = self.active_path();
            if active.exists() {
                fs::rename(active, self.numbered_path(1))?;
            }
        } else {
            // Single-file mode: truncate in place
            let _ = fs::remove_file(self.active_path());
        }

        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `MakeWriter` handle shared across tracing layers and threads.
#[derive(Clone)]
struct SharedLogWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SharedLogWriter {
    fn open(dir: &Path, app_name: &str) -> Result<Self> {
        let file = RotatingFile::open(dir, app_name, KEEP_LOG_FILES, MAX_LOG_FILE_BYTES)
            .with_context(|| format!("Failed to open log file for {}", app_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogWriter {
    type Writer = SharedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
