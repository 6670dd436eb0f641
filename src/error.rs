//! Error types for the pool driver.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

use crate::tools::ToolError;

/// Result type alias for pool driver operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Main error type for the pool driver.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The requested operation is not supported by this driver.
    #[error("Operation not supported")]
    NotSupported,

    /// The requested operation is not implemented for this volume kind.
    #[error("Operation not implemented")]
    NotImplemented,

    /// The operation was cancelled before a tool was spawned.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Volume already exists: {name}")]
    VolumeExists { name: String },

    #[error("Cannot remove a volume that has snapshots")]
    VolumeHasSnapshots,

    #[error("Block volumes cannot be shrunk")]
    CannotShrinkBlockVolume,

    /// A tool or syscall failed; `context` names the device or path involved.
    #[error("{context}: {source}")]
    Tool {
        context: String,
        #[source]
        source: ToolError,
    },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PoolError {
    /// Wrap a tool-layer failure with an operation context string.
    pub fn tool(context: impl Into<String>, source: ToolError) -> Self {
        Self::Tool { context: context.into(), source }
    }

    /// Wrap an I/O failure with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
