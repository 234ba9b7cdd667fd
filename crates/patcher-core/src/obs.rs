//! Structured observability hooks for patcher run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span (`run_span`)
//! - Emission functions for key events: reproduction, builds, agent session,
//!   submissions, verification and the final outcome
//!
//! Events are emitted with an `event = "<domain>.<action>"` field so log
//! pipelines can filter on it. For JSON output use `init_tracing(true, ..)`.

use tracing::{info, warn};

use crate::cas::Digest;
use crate::domain::{BuildId, ExecStatus, Phase, SessionState, TerminationReason};

/// Span tagged with the run id and target; attach with `Instrument::instrument`.
///
/// ```ignore
/// orchestrate().instrument(run_span("run-12345", "libpng")).await
/// ```
pub fn run_span(run_id: &str, target: &str) -> tracing::Span {
    tracing::info_span!("patcher.run", run_id = %run_id, target = %target)
}

pub fn emit_run_started(run_id: &str, pov_count: usize, builder_module: &str, agent: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        pov_count = pov_count,
        builder = %builder_module,
        agent = %agent,
    );
}

pub fn emit_run_finished(run_id: &str, outcome: &str, duration_ms: u64) {
    info!(event = "run.finished", run_id = %run_id, outcome = %outcome, duration_ms = duration_ms);
}

pub fn emit_pov_reproduced(variant_id: &str, status: &ExecStatus, crash_log_chars: usize) {
    info!(
        event = "pov.reproduced",
        variant = %variant_id,
        status = %status,
        crash_log_chars = crash_log_chars,
    );
}

/// A variant that did not crash `base`. Kept in the batch, flagged here.
pub fn emit_pov_non_reproducing(variant_id: &str, annotation: &str) {
    warn!(event = "pov.non_reproducing", variant = %variant_id, annotation = %annotation);
}

pub fn emit_build_cache_hit(patch: &Digest, builder_module: &str) {
    info!(event = "build.cache_hit", patch = %patch.short(), builder = %builder_module);
}

pub fn emit_build_finished(patch: &Digest, builder_module: &str, status: &ExecStatus) {
    info!(
        event = "build.finished",
        patch = %patch.short(),
        builder = %builder_module,
        status = %status,
    );
}

/// A POV or test run completed against a build.
pub fn emit_builder_run_finished(phase: Phase, build_id: &BuildId, status: &ExecStatus) {
    info!(
        event = "builder.run_finished",
        phase = %phase,
        build_id = %build_id,
        status = %status,
        timeout = status.is_timeout(),
    );
}

pub fn emit_agent_started(agent: &str, pid: Option<u32>, deadline_secs: Option<u64>) {
    info!(event = "agent.started", agent = %agent, pid = ?pid, deadline_secs = ?deadline_secs);
}

pub fn emit_agent_terminating(agent: &str, reason: TerminationReason) {
    warn!(event = "agent.terminating", agent = %agent, reason = ?reason);
}

pub fn emit_agent_finished(agent: &str, state: SessionState, exit_code: Option<i32>, forced_kill: bool) {
    info!(
        event = "agent.finished",
        agent = %agent,
        state = ?state,
        exit_code = ?exit_code,
        forced_kill = forced_kill,
    );
}

pub fn emit_submission_accepted(patch: &Digest, path: &str, files_changed: usize) {
    info!(
        event = "submission.accepted",
        patch = %patch.short(),
        path = %path,
        files_changed = files_changed,
    );
}

pub fn emit_submission_rejected(path: &str, reason: &str) {
    warn!(event = "submission.rejected", path = %path, reason = %reason);
}

pub fn emit_verification_finished(patch: &Digest, passed: bool, failed_checks: usize) {
    info!(
        event = "verification.finished",
        patch = %patch.short(),
        passed = passed,
        failed_checks = failed_checks,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id", "target");
        let _entered = span.enter();
        emit_run_finished("test-run-id", "no_povs", 0);
    }
}
