//! Error types for sshmux-core

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`CoreError`]
///
/// Lets callers branch on the failing stage without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Credential,
    UserCancelled,
    Connectivity,
    Launch,
    Recorder,
    MonitorTick,
    Store,
    Io,
}

/// One group member that failed its connectivity probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub target: String,
    pub cause: String,
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.cause)
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Credential error for {target}: {message}")]
    Credential { target: String, message: String },

    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Cannot connect to {target}: {}", .causes.join("; "))]
    Connectivity { target: String, causes: Vec<String> },

    #[error("Probe of {target} timed out after {timeout:?}")]
    ProbeTimeout { target: String, timeout: Duration },

    #[error("Group {group} unreachable ({} failing): {}", .failures.len(), join_failures(.failures))]
    GroupConnectivity {
        group: String,
        failures: Vec<MemberFailure>,
    },

    #[error("Launch error for {session}: {message}")]
    Launch { session: String, message: String },

    #[error("Multiplexer error: {0}")]
    Multiplexer(String),

    #[error("History recorder error: {0}")]
    Recorder(String),

    #[error("Monitor tick failed: {0}")]
    MonitorTick(String),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Credential store error: {0}")]
    Store(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn join_failures(failures: &[MemberFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    /// Classify the error by failing stage
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Configuration(_) => ErrorKind::Configuration,
            CoreError::Credential { .. } => ErrorKind::Credential,
            CoreError::UserCancelled => ErrorKind::UserCancelled,
            CoreError::Connectivity { .. }
            | CoreError::ProbeTimeout { .. }
            | CoreError::GroupConnectivity { .. }
            | CoreError::Protocol(_) => ErrorKind::Connectivity,
            CoreError::Launch { .. } | CoreError::Multiplexer(_) => ErrorKind::Launch,
            CoreError::Recorder(_) => ErrorKind::Recorder,
            CoreError::MonitorTick(_) => ErrorKind::MonitorTick,
            CoreError::SecretNotFound(_) | CoreError::Store(_) => ErrorKind::Store,
            CoreError::Io(_) | CoreError::Serialization(_) => ErrorKind::Io,
        }
    }

    /// True when a probe deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::ProbeTimeout { .. })
    }

    pub fn credential(target: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Credential {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn launch(session: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Launch {
            session: session.into(),
            message: message.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;
