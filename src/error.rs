//! Error types and exit codes for codemap-cache

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use thiserror::Error;

/// Main error type for cache and build orchestration
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid source '{source_location}': {reason}")]
    InvalidSource {
        source_location: String,
        reason: String,
    },

    #[error("Clone failed: {message}")]
    CloneFailed { message: String },

    #[error("Build failed: {message}")]
    BuildFailed { message: String },

    #[error("Metadata store at {} is corrupt: {message}", path.display())]
    StoreCorrupt { path: PathBuf, message: String },

    #[error("Cache holds {entries} entries but the limit is {max_entries} (all remaining entries are busy)")]
    CapacityExceeded { entries: usize, max_entries: usize },

    #[error("Operation already in progress for {}", path.display())]
    AlreadyInProgress { path: PathBuf },

    #[error("No cache entry for {}", path.display())]
    NotFound { path: PathBuf },

    #[error("{} is not ready: {reason}", path.display())]
    NotReady { path: PathBuf, reason: String },

    #[error("Failed to run {program}: {message}")]
    Process { program: String, message: String },

    #[error("{program} timed out after {}s", after.as_secs())]
    Timeout { program: String, after: Duration },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn invalid_source(source_location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSource {
            source_location: source_location.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error reports a busy entry rather than a failure
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::AlreadyInProgress { .. } | Self::NotReady { .. })
    }

    /// Convert error to the CLI exit code:
    /// - 1: IO error / entry not found
    /// - 2: Invalid source or configuration
    /// - 3: Clone failure
    /// - 4: Build failure or external process failure
    /// - 5: Corrupt metadata store
    /// - 6: Entry busy, not ready, or over capacity
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io(_) | Self::NotFound { .. } => ExitCode::from(1),
            Self::InvalidSource { .. } | Self::Config { .. } => ExitCode::from(2),
            Self::CloneFailed { .. } => ExitCode::from(3),
            Self::BuildFailed { .. } | Self::Process { .. } | Self::Timeout { .. } => {
                ExitCode::from(4)
            }
            Self::StoreCorrupt { .. } => ExitCode::from(5),
            Self::AlreadyInProgress { .. }
            | Self::NotReady { .. }
            | Self::CapacityExceeded { .. } => ExitCode::from(6),
        }
    }
}

/// Result type alias for codemap-cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
