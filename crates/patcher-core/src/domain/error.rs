//! Error taxonomy for the patcher.
//!
//! Build, POV and test failures are *not* errors: they travel as
//! [`ExecStatus`](super::build::ExecStatus) inside result values. Errors here
//! are the conditions that stop an operation from producing a result at all.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::session::SessionState;

/// Phase of a run an error or log artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Build,
    Pov,
    Test,
    Agent,
    Submission,
    Report,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Build => "build",
            Phase::Pov => "pov",
            Phase::Test => "test",
            Phase::Agent => "agent",
            Phase::Submission => "submission",
            Phase::Report => "report",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Patcher errors.
#[derive(Debug, thiserror::Error)]
pub enum PatcherError {
    /// Builder service unreachable or answered outside the protocol.
    #[error("builder infrastructure failure during {phase}: {message}")]
    Infrastructure { phase: Phase, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("source setup failed: {0}")]
    SourceSetup(String),

    #[error("failed to launch agent {agent}: {reason}")]
    AgentLaunch { agent: String, reason: String },

    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("run aborted during {phase}")]
    Aborted { phase: Phase },

    #[error("submission already forwarded: {0}")]
    AlreadyForwarded(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache error: {0}")]
    Cache(#[from] crate::cas::CasError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatcherError {
    pub fn infrastructure(phase: Phase, message: impl Into<String>) -> Self {
        PatcherError::Infrastructure {
            phase,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PatcherError::Infrastructure { .. })
    }

    /// Phase this error is attributed to.
    pub fn phase(&self) -> Phase {
        match self {
            PatcherError::Infrastructure { phase, .. } | PatcherError::Aborted { phase } => *phase,
            PatcherError::AgentLaunch { .. } | PatcherError::InvalidTransition { .. } => {
                Phase::Agent
            }
            PatcherError::AlreadyForwarded(_) => Phase::Submission,
            PatcherError::Serialization(_) => Phase::Report,
            _ => Phase::Setup,
        }
    }
}

/// Result type for patcher operations.
pub type Result<T> = std::result::Result<T, PatcherError>;
