// =============================================================================
// Trade Ledger — append-only NDJSON event log with size-based rotation
// =============================================================================
//
// Every fill, order, and signal is appended as one self-describing line:
// `{"event_type": ..., "timestamp": <ISO-8601>, "data": {...}}`. A fresh
// process can replay the file because each event carries full identity.
// Rotation renames the active file to a timestamped sibling once it exceeds
// the size cap.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::execution::order::Order;
use crate::position::Position;
use crate::types::{Fill, Signal};

/// Rotate once the active file exceeds this many bytes.
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

struct LedgerFile {
    file: File,
    bytes_written: u64,
}

/// Append-only trade ledger. Single writer; the file handle lives behind its
/// own mutex.
pub struct TradeLedger {
    path: PathBuf,
    inner: Mutex<LedgerFile>,
}

impl TradeLedger {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger dir {}", parent.display()))?;
        }

        let file = Self::open_append(&path)?;
        let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);

        info!(path = %path.display(), existing_bytes = bytes_written, "trade ledger opened");

        Ok(Self {
            path,
            inner: Mutex::new(LedgerFile {
                file,
                bytes_written,
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Event recording
    // -------------------------------------------------------------------------

    pub fn record_fill(&self, fill: &Fill) -> Result<()> {
        self.record_event("fill", serde_json::to_value(fill)?)
    }

    pub fn record_order(&self, order: &Order) -> Result<()> {
        self.record_event("order", serde_json::to_value(order)?)
    }

    pub fn record_signal(&self, signal: &Signal) -> Result<()> {
        self.record_event("signal", serde_json::to_value(signal)?)
    }

    pub fn record_position_snapshot(&self, position: &Position) -> Result<()> {
        self.record_event("position", serde_json::to_value(position)?)
    }

    /// Append one event line. Rotates first when the active file is full.
    pub fn record_event(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let line = json!({
            "event_type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });

        let mut inner = self.inner.lock();

        if inner.bytes_written >= MAX_FILE_SIZE {
            self.rotate_locked(&mut inner)?;
        }

        let mut serialized = serde_json::to_string(&line).context("failed to serialise event")?;
        serialized.push('\n');

        inner
            .file
            .write_all(serialized.as_bytes())
            .with_context(|| format!("failed to append to ledger {}", self.path.display()))?;
        inner.bytes_written += serialized.len() as u64;

        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.flush().context("ledger flush failed")
    }

    pub fn file_size(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Force a rotation regardless of size.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.rotate_locked(&mut inner)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open ledger {}", path.display()))
    }

    fn rotate_locked(&self, inner: &mut LedgerFile) -> Result<()> {
        inner.file.flush().ok();

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotated = self.path.with_extension(format!("{stamp}.json"));

        if let Err(e) = std::fs::rename(&self.path, &rotated) {
            warn!(error = %e, "ledger rotation rename failed");
        } else {
            info!(rotated = %rotated.display(), "ledger rotated");
        }

        inner.file = Self::open_append(&self.path)?;
        inner.bytes_written = 0;
        Ok(())
    }
}
