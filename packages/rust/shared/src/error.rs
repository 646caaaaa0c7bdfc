//! Error types for novelkb.
//!
//! Library crates use [`NovelKbError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum NovelKbError {
    /// Bad parameters or configuration, caught before any work starts.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An input artifact exists but its content is unusable.
    #[error("corrupt input {path:?} (line {line}): {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Data validation error (serialization failure, invalid artifact shape).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A broken internal invariant, e.g. a worker task that panicked.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, NovelKbError>;

impl NovelKbError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Report an unusable line in an input artifact.
    pub fn corrupt(path: impl Into<PathBuf>, line: usize, msg: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            line,
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = NovelKbError::config("overlap must be smaller than max_chars");
        assert_eq!(
            err.to_string(),
            "config error: overlap must be smaller than max_chars"
        );

        let err = NovelKbError::corrupt("out/chunks.jsonl", 7, "expected value");
        let msg = err.to_string();
        assert!(msg.contains("line 7"));
        assert!(msg.contains("chunks.jsonl"));

        let err = NovelKbError::Internal("extraction worker panicked".into());
        assert_eq!(err.to_string(), "internal error: extraction worker panicked");
    }
}
