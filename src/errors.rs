//! Error types for the stackwatch controller

use thiserror::Error;

/// Coarse error classification consumed by the reconciler.
///
/// The reconciler is the sole decision point on retry vs. escalation;
/// components only tag their errors with a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration, fatal at startup
    ConfigInvalid,

    /// Network or filesystem trouble, the cycle aborts and is retried with backoff
    TransientIo,

    /// The recipe subprocess, staging or stack parsing failed
    RecipeFailed,

    /// The orchestrator rejected a request (4xx)
    OrchestratorRejected,

    /// A webhook post failed; never fails the cycle
    NotificationFailed,

    /// Shutdown requested, unwind without mutating state
    Cancelled,
}

/// Main error type for the stackwatch controller
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("command '{program}' failed: {detail}")]
    CmdLine { program: String, detail: String },

    #[error("command '{program}' exceeded its deadline")]
    CmdTimeout { program: String },

    #[error("git error: {0}")]
    Git(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("registry rejected credentials: {0}")]
    RegistryAuth(String),

    #[error("recipe failed: {0}")]
    Recipe(String),

    #[error("orchestrator rejected request: {0}")]
    OrchestratorRejected(String),

    #[error("orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("shutdown error: {0}")]
    Shutdown(String),

    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// Classify the error for the reconciler's retry decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ConfigInvalid(_) | AgentError::Server(_) | AgentError::Shutdown(_) => {
                ErrorKind::ConfigInvalid
            }
            AgentError::Io(_)
            | AgentError::Http(_)
            | AgentError::Git(_)
            | AgentError::Registry(_)
            | AgentError::RegistryAuth(_)
            | AgentError::CmdTimeout { .. }
            | AgentError::OrchestratorUnavailable(_) => ErrorKind::TransientIo,
            AgentError::Json(_)
            | AgentError::Yaml(_)
            | AgentError::CmdLine { .. }
            | AgentError::Recipe(_) => ErrorKind::RecipeFailed,
            AgentError::OrchestratorRejected(_) => ErrorKind::OrchestratorRejected,
            AgentError::Notification(_) => ErrorKind::NotificationFailed,
            AgentError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}
