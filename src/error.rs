//! Error types for the analysis pipelines

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Short write on {}: wrote {written} of {expected} bytes", path.display())]
    ShortWrite {
        path: PathBuf,
        expected: usize,
        written: usize,
    },

    #[error("Invalid shard file {}: {reason}", path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Worker '{role}' panicked")]
    WorkerPanicked { role: String },

    #[error("Pipeline invariant violated: {0}")]
    Pipeline(String),
}

impl AnalysisError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AnalysisError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AnalysisError::InvalidFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for the cooperative-stop outcome rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AnalysisError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_carries_path() {
        let err = AnalysisError::io(
            "/data/channel_0/shard_1.dat",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("shard_1.dat"), "{msg}");
        assert!(msg.contains("gone"), "{msg}");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled_is_recognised() {
        assert!(AnalysisError::Cancelled.is_cancelled());
    }
}
