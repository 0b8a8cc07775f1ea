//! Shared logging utilities for guardrail binaries.
//!
//! Two sinks: a size-capped rotating log file under the guardrail home and
//! stderr. Both respect `RUST_LOG`; the stderr sink additionally honors the
//! `LOG_LEVEL` environment variable so operators can quiet the console
//! without touching file logging.
//!
//! Session identifiers and bearer tokens must never reach these sinks in
//! plaintext; callers log hashed prefixes instead.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "guardrail=info,guardrail_engine=info,guardrail_ingest=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for a guardrail binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of `LOG_LEVEL`.
    pub verbose: bool,
}

/// Initialize tracing with a rotating file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedRotatingWriter::new(log_dir, config.app_name)
        .context("Failed to initialize rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        match std::env::var("LOG_LEVEL") {
            Ok(level) => EnvFilter::new(level),
            Err(_) => file_filter.clone(),
        }
    };

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
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Guardrail home directory: `$GUARDRAIL_HOME` or `~/.guardrail`.
pub fn guardrail_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("GUARDRAIL_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".guardrail")
}

/// Logs directory: `<home>/logs`.
pub fn logs_dir() -> PathBuf {
    guardrail_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Append-only log file that rotates by size: `app.log`, `app.log.1`, ...
struct RotatingAppender {
    dir: PathBuf,
    base_name: String,
    file: File,
    written: u64,
}

impl RotatingAppender {
    fn new(dir: PathBuf, base_name: &str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let base_name = sanitize_name(base_name);
        let (file, written) = Self::open(&dir, &base_name)?;
        let mut appender = Self {
            dir,
            base_name,
            file,
            written,
        };
        if appender.written > MAX_LOG_FILE_SIZE {
            appender.rotate()?;
        }
        Ok(appender)
    }

    fn open(dir: &PathBuf, base_name: &str) -> io::Result<(File, u64)> {
        let path = dir.join(format!("{}.log", base_name));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let rotated = |idx: usize| self.dir.join(format!("{}.log.{}", self.base_name, idx));
        let oldest = rotated(MAX_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..MAX_LOG_FILES - 1).rev() {
            let src = rotated(idx);
            if src.exists() {
                fs::rename(&src, rotated(idx + 1))?;
            }
        }
        let current = self.dir.join(format!("{}.log", self.base_name));
        if current.exists() {
            fs::rename(current, rotated(1))?;
        }

        let (file, written) = Self::open(&self.dir, &self.base_name)?;
        self.file = file;
        self.written = written;
        Ok(())
    }
}

impl Write for RotatingAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone)]
struct SharedRotatingWriter {
    inner: Arc<Mutex<RotatingAppender>>,
}

impl SharedRotatingWriter {
    fn new(dir: PathBuf, base_name: &str) -> Result<Self> {
        let appender = RotatingAppender::new(dir, base_name)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(appender)),
        })
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<RotatingAppender>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRotatingWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appender_writes_and_rotates() {
        let temp = TempDir::new().unwrap();
        let mut appender = RotatingAppender::new(temp.path().to_path_buf(), "server").unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let content = fs::read_to_string(temp.path().join("server.log")).unwrap();
        assert_eq!(content, "hello\n");

        // Force a rotation and confirm the old content moved aside.
        appender.written = MAX_LOG_FILE_SIZE;
        appender.write_all(b"after\n").unwrap();
        appender.flush().unwrap();
        assert!(temp.path().join("server.log.1").exists());
        let current = fs::read_to_string(temp.path().join("server.log")).unwrap();
        assert_eq!(current, "after\n");
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name("guardrail-mcp"), "guardrail-mcp");
        assert_eq!(sanitize_name("a/b c"), "a_b_c");
    }
}
