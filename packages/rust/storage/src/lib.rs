//! File-backed storage layer for phase graphs, issue queues, the status
//! document, and bridge artifacts.
//!
//! The [`FileStore`] owns the on-disk layout under a single root:
//!
//! ```text
//! <root>/
//! ├── status.json
//! ├── phases/
//! │   └── <phase>/
//! │       ├── graph.json
//! │       └── issues.json
//! └── bridges/
//!     └── <source>--<target>.json
//! ```
//!
//! **Write rules:**
//! - Every document is written to a temp file in the same directory, flushed,
//!   synced, and renamed over the target, so readers never see a torn write.
//! - A failed write is retried once after a short backoff, then surfaced.
//! - A document that fails to parse is reported as
//!   [`PhaseGraphError::CorruptPersistedFile`]; it is never replaced silently.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use phasegraph_shared::{PhaseGraphError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

const PHASES_DIR: &str = "phases";
const BRIDGES_DIR: &str = "bridges";
const GRAPH_FILE: &str = "graph.json";
const QUEUE_FILE: &str = "issues.json";
const STATUS_FILE: &str = "status.json";

/// Handle to a PhaseGraph data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    retry_backoff: Duration,
}

impl FileStore {
    /// Open (creating if needed) a data directory at `root`.
    pub fn open(root: impl Into<PathBuf>, retry_backoff: Duration) -> Result<Self> {
        let root = root.into();
        for dir in [root.clone(), root.join(PHASES_DIR), root.join(BRIDGES_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|e| PhaseGraphError::io(&dir, e))?;
        }
        debug!(root = %root.display(), "opened file store");
        Ok(Self {
            root,
            retry_backoff,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    /// Directory holding one phase's documents.
    pub fn phase_dir(&self, phase: &str) -> Result<PathBuf> {
        validate_component(phase)?;
        Ok(self.root.join(PHASES_DIR).join(phase))
    }

    pub fn graph_path(&self, phase: &str) -> Result<PathBuf> {
        Ok(self.phase_dir(phase)?.join(GRAPH_FILE))
    }

    pub fn queue_path(&self, phase: &str) -> Result<PathBuf> {
        Ok(self.phase_dir(phase)?.join(QUEUE_FILE))
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    /// Path of the bridge artifact handed from `source` to `target`.
    pub fn bridge_path(&self, source: &str, target: &str) -> Result<PathBuf> {
        validate_component(source)?;
        validate_component(target)?;
        Ok(self
            .root
            .join(BRIDGES_DIR)
            .join(format!("{source}--{target}.json")))
    }

    /// Names of all phase directories, sorted.
    pub fn list_phases(&self) -> Result<Vec<String>> {
        let dir = self.root.join(PHASES_DIR);
        let entries = std::fs::read_dir(&dir).map_err(|e| PhaseGraphError::io(&dir, e))?;

        let mut phases = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PhaseGraphError::io(&dir, e))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| PhaseGraphError::io(entry.path(), e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                phases.push(name.to_string());
            }
        }
        phases.sort();
        Ok(phases)
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Atomically write `data` as pretty JSON to `path`, retrying once.
    pub fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(data).map_err(|e| {
            PhaseGraphError::validation(format!("JSON serialization failed: {e}"))
        })?;

        match write_atomic(path, &json) {
            Ok(()) => {}
            Err(err) if err.is_retryable() => {
                warn!(path = %path.display(), error = %err, "write failed, retrying once");
                std::thread::sleep(self.retry_backoff);
                write_atomic(path, &json)?;
            }
            Err(err) => return Err(err),
        }

        debug!(path = %path.display(), bytes = json.len(), "wrote JSON file");
        Ok(())
    }

    /// Read a JSON document. Returns `Ok(None)` when the file does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PhaseGraphError::io(path, e)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| PhaseGraphError::corrupt(path, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Phase names become directory and file names; keep them to one safe segment.
fn validate_component(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains("--")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(PhaseGraphError::validation(format!(
            "invalid phase name '{name}': use letters, digits, '-', '_' or '.' (no '--')"
        )))
    }
}

/// Write to a sibling temp file, sync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PhaseGraphError::validation(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| PhaseGraphError::io(dir, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let temp = dir.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    let result = write_synced(&temp, bytes)
        .and_then(|()| std::fs::rename(&temp, path).map_err(|e| PhaseGraphError::io(path, e)));

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

/// The file handle is dropped (closed) on every exit path.
fn write_synced(temp: &Path, bytes: &[u8]) -> Result<()> {
    let file = File::create(temp).map_err(|e| PhaseGraphError::io(temp, e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(bytes)
        .map_err(|e| PhaseGraphError::io(temp, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| PhaseGraphError::io(temp, e.into_error()))?;
    file.sync_all().map_err(|e| PhaseGraphError::io(temp, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
