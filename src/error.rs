//! Error taxonomy for the pipeline.
//!
//! Every failure a task can hit maps onto one of these variants. The variant
//! decides how many attempts the scheduler spends on the task before the
//! owning sample is marked failed.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid or missing configuration. Fatal before scheduling starts.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Remote object store I/O failed after exhausting retries.
    #[error("Transfer of '{key}' failed after {attempts} attempt(s): {reason}")]
    Transfer {
        /// Object key being transferred
        key: String,
        /// Attempts made before giving up
        attempts: usize,
        /// Last underlying failure
        reason: String,
    },

    /// A merge input is missing or malformed.
    #[error("Merge input '{key}' unusable: {reason}")]
    Merge {
        /// Key of the missing or corrupt artifact
        key: String,
        /// What went wrong
        reason: String,
    },

    /// The external counting tool failed.
    #[error("Process '{program}' failed ({status}): {stderr}")]
    Process {
        /// Program that was invoked
        program: String,
        /// Exit status description
        status: String,
        /// Tail of the captured stderr
        stderr: String,
    },

    /// Internal task graph inconsistency.
    #[error("Task graph error: {message}")]
    Graph { message: String },

    /// A record or object that was required does not exist.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Progress store rejected an update.
    #[error("Progress record for '{sample}': {message}")]
    Progress { sample: String, message: String },

    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a merge error for the given artifact key.
    pub fn merge(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Merge {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a graph construction error.
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a progress store error.
    pub fn progress(sample: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Progress {
            sample: sample.into(),
            message: message.into(),
        }
    }

    /// Short label for the error category, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Transfer { .. } => "transfer",
            Self::Merge { .. } => "merge",
            Self::Process { .. } => "process",
            Self::Graph { .. } => "graph",
            Self::NotFound { .. } => "not_found",
            Self::Progress { .. } => "progress",
            Self::Io(_) => "io",
        }
    }

    /// Total attempts a task failing with this error may use.
    ///
    /// Merge failures get exactly one retry; transfer, process and local I/O
    /// failures get the configured task limit; everything else fails fast.
    pub fn attempt_budget(&self, task_retries: usize) -> usize {
        match self {
            Self::Transfer { .. } | Self::Process { .. } | Self::Io(_) => task_retries.max(1),
            Self::Merge { .. } => 2,
            Self::Config { .. } | Self::Graph { .. } | Self::NotFound { .. } | Self::Progress { .. } => 1,
        }
    }
}
