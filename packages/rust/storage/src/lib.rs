//! File-backed storage for pipeline artifacts.
//!
//! Every stage hands its output to the next through files on disk:
//! - JSONL logs (chunks, extraction records) via [`LogWriter`] and [`read_jsonl`]
//! - pretty JSON tables and Markdown documents via the atomic writers
//!
//! **Write rules:**
//! - Logs are append-only; nothing rewrites an existing line.
//! - Whole-file artifacts are written to a temp file and renamed into place.

mod log;

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use novelkb_shared::{NovelKbError, Result};

pub use log::LogWriter;

// ---------------------------------------------------------------------------
// JSONL reading
// ---------------------------------------------------------------------------

/// How to treat a line that does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Any malformed line is a fatal [`NovelKbError::Corrupt`].
    Strict,
    /// Malformed lines (e.g. a torn tail after a crash) are skipped and counted.
    Lenient,
}

/// Records decoded from a JSONL file.
#[derive(Debug, Clone)]
pub struct JsonlRead<T> {
    pub records: Vec<T>,
    /// Lines skipped in [`ReadMode::Lenient`].
    pub skipped: usize,
}

/// Read every non-blank line of `path` as a `T`.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path, mode: ReadMode) -> Result<JsonlRead<T>> {
    let content = std::fs::read_to_string(path).map_err(|e| NovelKbError::io(path, e))?;
    parse_jsonl(path, &content, mode)
}

/// Like [`read_jsonl`], but a missing file reads as empty.
pub fn read_jsonl_if_exists<T: DeserializeOwned>(
    path: &Path,
    mode: ReadMode,
) -> Result<JsonlRead<T>> {
    if !path.exists() {
        return Ok(JsonlRead {
            records: Vec::new(),
            skipped: 0,
        });
    }
    read_jsonl(path, mode)
}

fn parse_jsonl<T: DeserializeOwned>(path: &Path, content: &str, mode: ReadMode) -> Result<JsonlRead<T>> {
    let mut records = Vec::new();
    let mut skipped = 0;

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) => match mode {
                ReadMode::Strict => {
                    return Err(NovelKbError::corrupt(path, idx + 1, e.to_string()));
                }
                ReadMode::Lenient => {
                    warn!(path = %path.display(), line = idx + 1, error = %e, "skipping unreadable log line");
                    skipped += 1;
                }
            },
        }
    }

    debug!(path = %path.display(), records = records.len(), skipped, "read jsonl");
    Ok(JsonlRead { records, skipped })
}

// ---------------------------------------------------------------------------
// Atomic whole-file writes
// ---------------------------------------------------------------------------

/// Checksum and size of a written artifact.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArtifactMeta {
    pub filename: String,
    pub sha256: String,
    pub size_bytes: usize,
}

/// Write `content` to `path` atomically (temp file, then rename).
pub fn write_text_atomic(path: &Path, content: &str) -> Result<ArtifactMeta> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir,
        None => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| NovelKbError::io(dir, e))?;

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NovelKbError::validation(format!("not a file path: {}", path.display())))?
        .to_string();
    let temp = dir.join(format!(".{filename}.tmp"));

    std::fs::write(&temp, content).map_err(|e| NovelKbError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| NovelKbError::io(path, e))?;

    debug!(path = %path.display(), size = content.len(), "wrote file");

    Ok(ArtifactMeta {
        filename,
        sha256: sha256_hex(content.as_bytes()),
        size_bytes: content.len(),
    })
}

/// Write a pretty-printed JSON file atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<ArtifactMeta> {
    let mut json = serde_json::to_string_pretty(data)
        .map_err(|e| NovelKbError::validation(format!("JSON serialization failed: {e}")))?;
    json.push('\n');
    write_text_atomic(path, &json)
}

/// Write records as JSONL atomically (one compact object per line).
pub fn write_jsonl_atomic<T: Serialize>(path: &Path, records: &[T]) -> Result<ArtifactMeta> {
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| NovelKbError::validation(format!("JSONL serialization failed: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    write_text_atomic(path, &out)
}

/// Read a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| NovelKbError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| {
        NovelKbError::corrupt(path, e.line(), format!("invalid JSON: {e}"))
    })
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
