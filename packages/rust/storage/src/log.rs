//! Append-only JSONL log writer.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use novelkb_shared::{NovelKbError, Result};

/// Single owner of an append-only JSONL file.
///
/// Each [`append`](LogWriter::append) writes one whole line and syncs it to
/// disk before returning, so after a crash the file holds only complete
/// records, plus at most one torn tail line.
pub struct LogWriter {
    path: PathBuf,
    file: File,
    appended: usize,
}

impl LogWriter {
    /// Open (or create) `path` for appending.
    ///
    /// A torn tail left by an earlier crash is terminated with a newline so the
    /// next record starts on its own line; readers skip the fragment.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NovelKbError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .await
            .map_err(|e| NovelKbError::io(path, e))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| NovelKbError::io(path, e))?
            .len();

        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(std::io::SeekFrom::Start(len - 1))
                .await
                .map_err(|e| NovelKbError::io(path, e))?;
            file.read_exact(&mut last)
                .await
                .map_err(|e| NovelKbError::io(path, e))?;

            if last[0] != b'\n' {
                warn!(path = %path.display(), "log ends with a torn record, isolating it");
                file.write_all(b"\n")
                    .await
                    .map_err(|e| NovelKbError::io(path, e))?;
                file.sync_data().await.map_err(|e| NovelKbError::io(path, e))?;
            }
        }

        debug!(path = %path.display(), existing_bytes = len, "opened log for append");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            appended: 0,
        })
    }

    /// Serialize `record` as one line, write it, and fsync before returning.
    pub async fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| {
            NovelKbError::validation(format!("log record serialization failed: {e}"))
        })?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| NovelKbError::io(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| NovelKbError::io(&self.path, e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| NovelKbError::io(&self.path, e))?;

        self.appended += 1;
        Ok(())
    }

    /// Records appended through this writer.
    pub fn appended(&self) -> usize {
        self.appended
    }
}
