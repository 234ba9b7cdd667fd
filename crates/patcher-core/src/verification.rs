//! Confirmatory pass over an accepted patch.
//!
//! Rebuilds the patch, replays every POV against the new build and runs the
//! test suite. The agent is expected to have done the same; this pass only
//! checks its claim.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::builder::{response_dir, BuilderClient};
use crate::cas::Digest;
use crate::domain::{BuildId, ExecStatus, PatchCandidate, Phase, ReproducedPov};
use crate::obs;
use crate::reproducer::truncate_tail;

/// Log excerpt kept per failed check.
pub const MAX_CHECK_LOG_CHARS: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Mismatch,
    /// The pass could not be completed (builder infrastructure failure).
    Skipped,
}

/// One check that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCheck {
    pub phase: Phase,
    /// Variant id for POV checks, `build` / `test` otherwise.
    pub subject: String,
    pub status: ExecStatus,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub patch: Digest,
    pub verdict: Verdict,
    pub build_id: Option<BuildId>,
    #[serde(default)]
    pub build_cache_hit: bool,
    pub checks_run: usize,
    pub failed: Vec<FailedCheck>,
    /// Set when the verdict is `Skipped`.
    pub error: Option<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }

    pub fn is_mismatch(&self) -> bool {
        self.verdict == Verdict::Mismatch
    }

    fn skipped(patch: Digest, checks_run: usize, error: String) -> Self {
        Self {
            patch,
            verdict: Verdict::Skipped,
            build_id: None,
            build_cache_hit: false,
            checks_run,
            failed: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    client: BuilderClient,
    builder_module: String,
    work_dir: PathBuf,
}

impl Verifier {
    pub fn new(
        client: BuilderClient,
        builder_module: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            builder_module: builder_module.into(),
            work_dir: work_dir.into(),
        }
    }

    pub async fn verify(&self, patch: &PatchCandidate, povs: &[ReproducedPov]) -> VerificationReport {
        let digest = patch.digest();
        let scope = format!("verify-{}", digest.short());
        let mut checks_run = 0;
        let mut failed = Vec::new();

        let build = match self
            .client
            .apply_patch_and_build(
                patch,
                &self.builder_module,
                &response_dir(&self.work_dir, &scope, "build"),
            )
            .await
        {
            Ok(build) => build,
            Err(e) => return self.finish(VerificationReport::skipped(digest, checks_run, e.to_string())),
        };
        checks_run += 1;

        let build_id = match (build.status, build.build_id.clone()) {
            (ExecStatus::Success, Some(id)) => id,
            (status, _) => {
                failed.push(FailedCheck {
                    phase: Phase::Build,
                    subject: "build".to_string(),
                    status,
                    log: excerpt(build.build_log().unwrap_or_default()),
                });
                return self.finish(VerificationReport {
                    patch: digest,
                    verdict: Verdict::Mismatch,
                    build_id: None,
                    build_cache_hit: build.cache_hit,
                    checks_run,
                    failed,
                    error: None,
                });
            }
        };

        for pov in povs {
            if pov.variant.harness.is_empty() {
                continue;
            }
            let dir = response_dir(&self.work_dir, &scope, &format!("pov-{}", pov.variant.id));
            let run = match self
                .client
                .run_pov(
                    &build_id,
                    &pov.variant.path,
                    &pov.variant.harness,
                    &self.builder_module,
                    &dir,
                )
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    return self.finish(VerificationReport::skipped(digest, checks_run, e.to_string()))
                }
            };
            checks_run += 1;
            if !run.passed() {
                let log = run
                    .logs
                    .first_of(&["pov_stderr.log", "pov_stdout.log"])
                    .unwrap_or(&run.stderr);
                failed.push(FailedCheck {
                    phase: Phase::Pov,
                    subject: pov.variant.id.clone(),
                    status: run.status,
                    log: excerpt(log),
                });
            }
        }

        let tests = match self
            .client
            .run_test(
                &build_id,
                &self.builder_module,
                &response_dir(&self.work_dir, &scope, "test"),
            )
            .await
        {
            Ok(tests) => tests,
            Err(e) => return self.finish(VerificationReport::skipped(digest, checks_run, e.to_string())),
        };
        checks_run += 1;
        if !tests.passed() {
            let log = tests
                .logs
                .first_of(&["test_stderr.log", "test_stdout.log"])
                .unwrap_or(&tests.stderr);
            failed.push(FailedCheck {
                phase: Phase::Test,
                subject: "test".to_string(),
                status: tests.status,
                log: excerpt(log),
            });
        }

        let verdict = if failed.is_empty() {
            Verdict::Passed
        } else {
            Verdict::Mismatch
        };
        self.finish(VerificationReport {
            patch: digest,
            verdict,
            build_id: Some(build_id),
            build_cache_hit: build.cache_hit,
            checks_run,
            failed,
            error: None,
        })
    }

    fn finish(&self, report: VerificationReport) -> VerificationReport {
        if let Some(error) = &report.error {
            warn!(event = "verification.skipped", patch = %report.patch.short(), error = %error);
        }
        obs::emit_verification_finished(&report.patch, report.passed(), report.failed.len());
        report
    }
}

fn excerpt(log: &str) -> String {
    truncate_tail(log, MAX_CHECK_LOG_CHARS)
}
