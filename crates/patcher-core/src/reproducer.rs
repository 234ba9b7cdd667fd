//! Base-build crash reproduction.
//!
//! Every variant is replayed once against `base` before the agent starts;
//! the crash logs are persisted next to the agent's working files and reused
//! for the rest of the run.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, info};

use crate::builder::{response_dir, BuilderClient};
use crate::domain::{BuildId, CrashLog, ExecStatus, PovVariant, ReproducedPov, Result};
use crate::obs;

/// Sanitizer summaries sit at the end of the log, so the tail is kept.
pub const MAX_CRASH_LOG_CHARS: usize = 16_384;

pub const TRUNCATION_MARKER: &str = "[...truncated...]\n";
pub const NO_HARNESS_LOG: &str = "No harness configured";
pub const NO_OUTPUT_LOG: &str = "No crash output captured";

pub const NON_REPRODUCING: &str = "non-reproducing";
pub const TIMED_OUT_ON_BASE: &str = "timed out on base";

/// Keep the last `max_chars` characters, prefixed with a truncation marker.
pub fn truncate_tail(log: &str, max_chars: usize) -> String {
    let total = log.chars().count();
    if total <= max_chars {
        return log.to_string();
    }
    let tail: String = log.chars().skip(total - max_chars).collect();
    format!("{TRUNCATION_MARKER}{tail}")
}

/// Replays POVs against the unpatched build.
#[derive(Debug, Clone)]
pub struct CrashReproducer {
    client: BuilderClient,
    builder_module: String,
    /// Response bundles land in `<work_dir>/pov-<id>/reproduce`.
    work_dir: PathBuf,
    /// Crash logs land in `<agent_dir>/crash_log_<i>.txt`.
    agent_dir: PathBuf,
    max_log_chars: usize,
}

impl CrashReproducer {
    pub fn new(
        client: BuilderClient,
        builder_module: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        agent_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            builder_module: builder_module.into(),
            work_dir: work_dir.into(),
            agent_dir: agent_dir.into(),
            max_log_chars: MAX_CRASH_LOG_CHARS,
        }
    }

    pub fn with_max_log_chars(mut self, max: usize) -> Self {
        self.max_log_chars = max;
        self
    }

    /// Reproduce every variant, in order. Produces exactly one crash log per
    /// variant; only filesystem errors while persisting logs fail the call.
    pub async fn reproduce_all(&self, variants: &[PovVariant]) -> Result<Vec<ReproducedPov>> {
        tokio::fs::create_dir_all(&self.agent_dir).await?;

        let mut reproduced = Vec::with_capacity(variants.len());
        for (i, variant) in variants.iter().enumerate() {
            info!(event = "pov.reproducing", variant = %variant.id, path = %variant.path.display());
            let (status, text) = self.replay(variant).await;
            let text = truncate_tail(&text, self.max_log_chars);

            let crash_log = CrashLog {
                variant_id: variant.id.clone(),
                build_id: BuildId::base(),
                status,
                text,
                captured_at: Utc::now(),
            };

            let crash_log_path = self.agent_dir.join(format!("crash_log_{i}.txt"));
            tokio::fs::write(&crash_log_path, &crash_log.text).await?;

            let annotation = annotate(&crash_log);
            match (&annotation, status) {
                (Some(note), _) => obs::emit_pov_non_reproducing(&variant.id, note),
                (None, Some(status)) => {
                    obs::emit_pov_reproduced(&variant.id, &status, crash_log.text.len())
                }
                (None, None) => {}
            }

            reproduced.push(ReproducedPov {
                variant: variant.clone(),
                crash_log,
                crash_log_path,
                annotation,
            });
        }
        Ok(reproduced)
    }

    async fn replay(&self, variant: &PovVariant) -> (Option<ExecStatus>, String) {
        if variant.harness.is_empty() {
            return (None, NO_HARNESS_LOG.to_string());
        }

        let response = response_dir(&self.work_dir, &format!("pov-{}", variant.id), "reproduce");
        match self
            .client
            .run_pov(
                &BuildId::base(),
                &variant.path,
                &variant.harness,
                &self.builder_module,
                &response,
            )
            .await
        {
            Ok(result) => {
                let text = result
                    .logs
                    .first_of(&["pov_stderr.log", "pov_stdout.log"])
                    .map(str::to_string)
                    .or_else(|| (!result.stderr.is_empty()).then(|| result.stderr.clone()))
                    .unwrap_or_else(|| NO_OUTPUT_LOG.to_string());
                (Some(result.status), text)
            }
            Err(err) => {
                error!(event = "pov.reproduce_failed", variant = %variant.id, error = %err);
                (None, format!("Error reproducing crash: {err}"))
            }
        }
    }

    pub fn agent_dir(&self) -> &Path {
        &self.agent_dir
    }
}

fn annotate(log: &CrashLog) -> Option<String> {
    match log.status {
        Some(ExecStatus::Failure(_)) => None,
        Some(ExecStatus::Timeout) => Some(TIMED_OUT_ON_BASE.to_string()),
        Some(ExecStatus::Success) | None => Some(NON_REPRODUCING.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_cache::BuildCache;
    use crate::builder::{BuildRequest, BuilderService, PovRunRequest, TestRunRequest};
    use crate::domain::{BuildResult, LogBundle, RunResult};
    use std::sync::Arc;

    #[test]
    fn short_logs_are_untouched() {
        assert_eq!(truncate_tail("==1==ERROR", 100), "==1==ERROR");
    }

    #[test]
    fn long_logs_keep_tail_with_marker() {
        let log = format!("{}SUMMARY: AddressSanitizer", "x".repeat(50));
        let out = truncate_tail(&log, 26);
        assert_eq!(out, format!("{TRUNCATION_MARKER}SUMMARY: AddressSanitizer"));
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let log = "é".repeat(10);
        let out = truncate_tail(&log, 4);
        assert!(out.ends_with("éééé"));
    }

    #[test]
    fn annotations_follow_status() {
        let mut log = CrashLog {
            variant_id: "a".into(),
            build_id: BuildId::base(),
            status: Some(ExecStatus::Failure(1)),
            text: String::new(),
            captured_at: Utc::now(),
        };
        assert_eq!(annotate(&log), None);
        log.status = Some(ExecStatus::Success);
        assert_eq!(annotate(&log).as_deref(), Some(NON_REPRODUCING));
        log.status = Some(ExecStatus::Timeout);
        assert_eq!(annotate(&log).as_deref(), Some(TIMED_OUT_ON_BASE));
    }

    /// Crashes every POV with a long sanitizer report.
    struct NoisyBuilder;

    #[async_trait::async_trait]
    impl BuilderService for NoisyBuilder {
        fn name(&self) -> &str {
            "noisy"
        }

        async fn apply_patch_build(&self, _: &BuildRequest<'_>) -> Result<BuildResult> {
            unreachable!("reproduction never builds")
        }

        async fn run_pov(&self, _: &PovRunRequest<'_>) -> Result<RunResult> {
            let stderr = format!("{}SUMMARY: AddressSanitizer", "#0 frame\n".repeat(200));
            Ok(RunResult::new(ExecStatus::Failure(1), stderr, LogBundle::default()))
        }

        async fn run_test(&self, _: &TestRunRequest<'_>) -> Result<RunResult> {
            unreachable!("reproduction never runs tests")
        }
    }

    #[tokio::test]
    async fn one_truncated_log_per_variant() {
        let dir = tempfile::tempdir().unwrap();
        let client = BuilderClient::new(Arc::new(NoisyBuilder), Arc::new(BuildCache::in_memory()));
        let reproducer = CrashReproducer::new(
            client,
            "inc-builder-asan",
            dir.path(),
            dir.path().join("agent"),
        )
        .with_max_log_chars(64);

        let variants = vec![
            PovVariant::new("a", dir.path().join("a.bin"), "fuzz_png"),
            PovVariant::new("b", dir.path().join("b.bin"), ""),
        ];
        let povs = reproducer.reproduce_all(&variants).await.unwrap();

        assert_eq!(povs.len(), 2);
        let first = std::fs::read_to_string(reproducer.agent_dir().join("crash_log_0.txt")).unwrap();
        assert!(first.starts_with(TRUNCATION_MARKER));
        assert!(first.ends_with("SUMMARY: AddressSanitizer"));
        assert!(povs[0].annotation.is_none());

        // No harness: still one log, flagged for the agent.
        assert_eq!(povs[1].crash_log.text, NO_HARNESS_LOG);
        assert_eq!(povs[1].annotation.as_deref(), Some(NON_REPRODUCING));
        assert!(reproducer.agent_dir().join("crash_log_1.txt").exists());
    }
}
