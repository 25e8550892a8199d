//! Error types for the server wrapper.
//!
//! Provides structured error handling using thiserror for every failure the
//! wrapper can surface: bind/listen failures, lifecycle misuse, graceful-stop
//! timeouts, and configuration problems. No retry policy lives here; callers
//! decide what is fatal.

use thiserror::Error;

/// Main error type for server lifecycle operations
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listener could not bind the configured address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `serve` was called twice, or a route was registered after `serve`
    #[error("server already started")]
    AlreadyStarted,

    /// `stop` or `graceful_stop` was called while the server was not serving
    #[error("server is not serving")]
    NotServing,

    /// The graceful-stop deadline elapsed before in-flight requests drained
    #[error("graceful stop deadline exceeded")]
    GracefulStopTimeout,

    /// Route registration error
    #[error("invalid route: {0}")]
    Route(String),

    /// Configuration error
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Metric registration failed
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The spawned serve task failed to join
    #[error("server task failed: {0}")]
    Runtime(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ServerError>;
