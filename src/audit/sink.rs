//! Append-only destinations for audit entries.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};

use super::AuditEntry;
use crate::config::{AuditConfig, AuditSinkKind};
use crate::{Error, Result};

/// Failure to persist an audit entry.
#[derive(Debug, thiserror::Error)]
pub enum AuditSinkError {
    /// Entry could not be serialized.
    #[error("audit serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Write to the backing store failed.
    #[error("audit write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The sink no longer accepts entries.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Where audit entries go. Appends are serialized by the logger.
pub trait AuditSink: Send + Sync {
    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuditSinkError`] if the entry was not persisted.
    fn append(&self, entry: &AuditEntry) -> std::result::Result<(), AuditSinkError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Emits each entry as an `audit` field at INFO under `tool_gate::audit`.
///
/// ```text
/// INFO tool_gate::audit: tool call audit audit={"seq":1,"tool":"create_site",...}
/// ```
#[derive(Debug, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn append(&self, entry: &AuditEntry) -> std::result::Result<(), AuditSinkError> {
        let json = serde_json::to_string(entry)?;
        tracing::info!(target: "tool_gate::audit", audit = %json, "tool call audit");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Keeps entries in memory. Used by tests and the `check` command.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemorySink {
    fn append(&self, entry: &AuditEntry) -> std::result::Result<(), AuditSinkError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Appends one JSON object per line to a file.
///
/// Each append is a synchronous write and flush made while the logger holds
/// its chain lock, so concurrent calls queue on disk latency. On a
/// multi-thread runtime the write is moved off the async worker with
/// [`tokio::task::block_in_place`]. Use the tracing sink for high call rates.
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFileSink {
    /// Open (or create) `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be opened.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// File being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.write_all(line)?;
        file.flush()
    }
}

impl AuditSink for JsonlFileSink {
    fn append(&self, entry: &AuditEntry) -> std::result::Result<(), AuditSinkError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let on_worker = Handle::try_current()
            .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
        if on_worker {
            tokio::task::block_in_place(|| self.write_line(&line))?;
        } else {
            self.write_line(&line)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Build the configured sink.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file sink has no path or cannot be opened.
pub fn from_config(config: &AuditConfig) -> Result<Arc<dyn AuditSink>> {
    match config.sink {
        AuditSinkKind::Tracing => Ok(Arc::new(TracingSink)),
        AuditSinkKind::Memory => Ok(Arc::new(MemorySink::new())),
        AuditSinkKind::File => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| Error::Config("audit.path is required for the file sink".into()))?;
            let sink = JsonlFileSink::open(path)
                .map_err(|e| Error::Config(format!("audit.path {}: {e}", path.display())))?;
            Ok(Arc::new(sink))
        }
    }
}
