//! Error types.

use thiserror::Error;

/// Errors returned by control-plane clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The command ran but exited unsuccessfully.
    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },

    /// The command could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The operation is not available for this resource kind.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Output could not be interpreted.
    #[error("unexpected output: {0}")]
    Parse(String),
}

impl ClientError {
    /// Raw output of a failed command, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ClientError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Deletion was rejected because another resource still references the target.
    pub fn is_in_use(&self) -> bool {
        self.output().is_some_and(|o| o.contains("still in use"))
    }
}

/// Result type for control-plane operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors from the source repository.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("git clone failed: {0}")]
    Clone(String),

    #[error("failed to resolve HEAD: {0}")]
    Head(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from state persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a reconciliation cycle could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CycleError {
    #[error("already running")]
    AlreadyRunning,
}
