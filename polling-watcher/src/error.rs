//! Error types for the polling watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur in the polling watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Invalid watcher configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Include or exclude pattern failed to compile.
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// The watched root is missing or not a directory at cycle start.
    #[error("watched root unavailable: {}", path.display())]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// `start` was called on a running watcher.
    #[error("watcher already running for: {}", .0.display())]
    AlreadyRunning(PathBuf),

    /// `start` was called while a stop is still in progress.
    #[error("watcher is stopping: {}", .0.display())]
    Stopping(PathBuf),

    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// The blocking scan task failed to complete.
    #[error("scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Config file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatcherError {
    /// Whether this error ends the polling loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RootUnavailable { .. } | Self::Task(_))
    }
}
