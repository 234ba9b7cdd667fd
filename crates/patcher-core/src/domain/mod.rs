//! Domain models for the patcher.
//!
//! - `PovVariant` / `CrashLog`: crash inputs and their base reproduction
//! - `BuildId`, `BuildResult`, `RunResult`, `ExecStatus`: builder protocol values
//! - `PatchCandidate`: content-addressed diff
//! - `SessionState` / `SessionReport`: agent lifecycle
//! - `SubmissionRecord`: the one accepted patch

pub mod build;
pub mod error;
pub mod patch;
pub mod pov;
pub mod session;
pub mod submission;

pub use build::{
    BuildId, BuildResult, ExecStatus, LogBundle, RunResult, TIMEOUT_EXIT_CODE,
};
pub use error::{PatcherError, Phase, Result};
pub use patch::PatchCandidate;
pub use pov::{CrashLog, PovVariant, ReproducedPov};
pub use session::{SessionReport, SessionState, TerminationReason};
pub use submission::{RejectedSubmission, RejectionReason, SubmissionRecord};
