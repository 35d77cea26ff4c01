//! Append-only audit log of trust decisions.
//!
//! One JSON object per line (`{ts, event, payload}`) in a file only the
//! owner can read or write, with a best-effort copy to the system log.
//! Recording never fails from the caller's point of view: a broken disk or
//! missing `logger` binary produces a warning, not an aborted install.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AuditConfig;

/// A single audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    /// Event name, e.g. `install` or `enforce`.
    pub event: String,
    /// Event-specific details.
    pub payload: serde_json::Value,
}

/// Secondary destination for audit lines.
pub trait AuditSink: Send + Sync {
    /// Forward one serialized event.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejected the line; callers ignore it.
    fn forward(&self, line: &str) -> std::io::Result<()>;
}

/// Forwards to the system log through `logger(1)`.
#[derive(Debug, Clone)]
pub struct SyslogSink {
    tag: String,
}

impl SyslogSink {
    /// Sink tagging entries with `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl AuditSink for SyslogSink {
    fn forward(&self, line: &str) -> std::io::Result<()> {
        let status = std::process::Command::new("logger")
            .args(["-t", &self.tag, "--", line])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("logger exited with {status}")))
        }
    }
}

/// Append-only JSON lines audit log.
pub struct AuditLog {
    path: PathBuf,
    sink: Option<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl AuditLog {
    /// Log writing to `path` with no secondary sink.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sink: None,
        }
    }

    /// Log configured from the `[audit]` section.
    pub fn from_config(config: &AuditConfig) -> Self {
        let log = Self::new(&config.log_path);
        if config.syslog {
            log.with_sink(Box::new(SyslogSink::new(&config.syslog_tag)))
        } else {
            log
        }
    }

    /// Attach a secondary sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event. Failures are logged and swallowed.
    pub fn record(&self, event: &str, payload: serde_json::Value) {
        let entry = AuditEvent {
            ts: Utc::now().to_rfc3339(),
            event: event.to_owned(),
            payload,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(event, error = %e, "failed to serialize audit event");
                return;
            }
        };

        if let Err(e) = self.append(&line) {
            warn!(path = %self.path.display(), event, error = %e, "failed to write audit log");
        }
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.forward(&line) {
                warn!(event, error = %e, "failed to forward audit event to system log");
            }
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()
    }
}

/// Read every event from an audit log, skipping unparseable lines.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_events(path: &Path) -> std::io::Result<Vec<AuditEvent>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
