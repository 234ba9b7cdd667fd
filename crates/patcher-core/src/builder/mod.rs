//! Builder service access.
//!
//! The builder is an isolated service that compiles the target and runs
//! POVs and tests against a given build. [`BuilderService`] is the raw
//! protocol; [`BuilderClient`] layers the build cache and infrastructure
//! retries on top of it.
//!
//! # Modules
//!
//! - [`command`] — `CommandBuilderService`, the CLI-driven protocol
//! - [`client`]  — `BuilderClient`, `RetryPolicy`
//! - [`bundle`]  — response bundle reading and writing

pub mod bundle;
pub mod client;
pub mod command;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::{BuildId, BuildResult, PatchCandidate, Result, RunResult};

pub use client::{BuilderClient, RetryPolicy};
pub use command::CommandBuilderService;

/// Compile a patch against a clean copy of the source tree.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub patch: &'a PatchCandidate,
    pub builder_module: &'a str,
    pub response_dir: &'a Path,
}

/// Replay one POV input against a build.
#[derive(Debug, Clone)]
pub struct PovRunRequest<'a> {
    pub build_id: &'a BuildId,
    pub pov_path: &'a Path,
    pub harness: &'a str,
    pub builder_module: &'a str,
    pub response_dir: &'a Path,
}

/// Run the project's test suite against a build.
#[derive(Debug, Clone)]
pub struct TestRunRequest<'a> {
    pub build_id: &'a BuildId,
    pub builder_module: &'a str,
    pub response_dir: &'a Path,
}

/// Raw builder protocol.
///
/// Implementations return `Ok` with a failure/timeout status for anything
/// the builder itself reported, and `Err(PatcherError::Infrastructure)` only
/// when no valid response was obtained.
#[async_trait]
pub trait BuilderService: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Fail-fast reachability check.
    async fn probe(&self, builder_module: &str) -> Result<()> {
        let _ = builder_module;
        Ok(())
    }

    async fn apply_patch_build(&self, request: &BuildRequest<'_>) -> Result<BuildResult>;

    async fn run_pov(&self, request: &PovRunRequest<'_>) -> Result<RunResult>;

    async fn run_test(&self, request: &TestRunRequest<'_>) -> Result<RunResult>;
}

/// Standard response directory layout under a run's work dir.
pub fn response_dir(work_dir: &Path, scope: &str, operation: &str) -> PathBuf {
    work_dir.join(scope).join(operation)
}
