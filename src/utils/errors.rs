// src/utils/errors.rs
//! Error types for the arena engine
//!
//! The variants follow the host's failure taxonomy:
//!
//! - **PermissionViolation** / **ResourceExhausted**: handled locally, the offending
//!   agent is soft-eliminated and the round continues
//! - **Inactivity** / **UndeadThread**: escalating, recoverable at first and fatal
//!   when sustained
//! - **Load**: the agent is excluded from scheduling entirely
//! - **InternalFault**: aborts the current battle cleanly

use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Reasons an agent package could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("agent code not found: {0}")]
    Missing(String),

    #[error("malformed agent code in {unit}: {reason}")]
    Malformed { unit: String, reason: String },

    #[error("namespace policy violation: {0}")]
    NamespaceViolation(String),
}

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("permission violation by {agent}: {reason}")]
    PermissionViolation { agent: String, reason: String },

    #[error("{agent} exhausted its {resource} quota of {limit}")]
    ResourceExhausted {
        agent: String,
        resource: String,
        limit: u64,
    },

    #[error("{agent} skipped {skipped} consecutive turns")]
    Inactivity { agent: String, skipped: u32 },

    #[error("thread {thread} of {agent} did not stop")]
    UndeadThread { agent: String, thread: String },

    #[error("load error: {0}")]
    Load(#[from] LoadError),

    #[error("internal fault: {0}")]
    InternalFault(String),

    #[error("round aborted: {0}")]
    RoundAborted(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Errors that terminate the current round (or battle) when raised
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Inactivity { .. }
                | EngineError::UndeadThread { .. }
                | EngineError::InternalFault(_)
                | EngineError::RoundAborted(_)
        )
    }

    /// Sandbox breaches that are expected while running untrusted agents.
    /// They are reported as non-fatal diagnostics.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::PermissionViolation { .. } | EngineError::ResourceExhausted { .. }
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}
