//! End-to-end run: reproduce, supervise, accept, verify, forward, report.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::agent::{backend_for, AgentBackend, AgentSupervisor, LaunchContext, SupervisorConfig};
use crate::build_cache::BuildCache;
use crate::builder::BuilderClient;
use crate::config::{PatcherConfig, VerificationPolicy};
use crate::domain::{
    PatcherError, Phase, PovVariant, RejectedSubmission, ReproducedPov, Result, SessionReport,
    SubmissionRecord,
};
use crate::instructions::Instructions;
use crate::obs;
use crate::reporting::{write_run_report, RunOutcome, RunReport, RUN_REPORT_SCHEMA};
use crate::reproducer::CrashReproducer;
use crate::source;
use crate::submission::{
    DirectorySink, ForwardReceipt, InPlaceSink, SubmissionSink, SubmissionSlot, SubmissionWatcher,
};
use crate::verification::Verifier;

pub struct Orchestrator {
    config: PatcherConfig,
    client: BuilderClient,
    backend: Arc<dyn AgentBackend>,
    sink: Box<dyn SubmissionSink>,
}

/// Everything gathered along the way, folded into the report at the end.
#[derive(Default)]
struct RunState {
    povs: Vec<ReproducedPov>,
    session: Option<SessionReport>,
    forwarded: Option<ForwardReceipt>,
    rejected: Vec<RejectedSubmission>,
}

impl Orchestrator {
    pub fn new(
        config: PatcherConfig,
        client: BuilderClient,
        backend: Arc<dyn AgentBackend>,
        sink: Box<dyn SubmissionSink>,
    ) -> Self {
        Self {
            config,
            client,
            backend,
            sink,
        }
    }

    /// Production wiring: CLI builder, persistent cache, configured agent
    /// and sink.
    pub fn from_config(config: PatcherConfig) -> Result<Self> {
        config.validate()?;

        let cache = BuildCache::persistent(config.cache_root())?;
        let client = BuilderClient::new(Arc::new(config.builder_service()), Arc::new(cache))
            .with_retry_policy(config.retry.clone());

        let backend = backend_for(&config)?;
        let sink: Box<dyn SubmissionSink> = match &config.forward_dir {
            Some(dir) => Box::new(DirectorySink::new(dir.clone())),
            None => Box::new(InPlaceSink::new(config.withheld_dir())),
        };
        Ok(Self::new(config, client, backend, sink))
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    /// Run once. `abort` kills the agent session and cuts grace periods short.
    ///
    /// A run that stops on an error still writes its report, with the
    /// error's phase and message as the outcome, before returning the error.
    pub async fn run(self, abort: CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, &self.config.target);
        async move {
            let started_at = Utc::now();
            let mut state = RunState::default();
            match self.execute(&run_id, &abort, &mut state).await {
                Ok(outcome) => Ok(self.finish(run_id, started_at, outcome, state)),
                Err(e) => {
                    let outcome = RunOutcome::Failed {
                        phase: e.phase(),
                        message: e.to_string(),
                    };
                    self.finish(run_id, started_at, outcome, state);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        run_id: &str,
        abort: &CancellationToken,
        state: &mut RunState,
    ) -> Result<RunOutcome> {
        let config = &self.config;

        for dir in [&config.work_dir, &config.patches_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let source_dir = source::locate_project(&config.source_root())?;
        info!(event = "source.located", path = %source_dir.display());

        let pov_paths = source::discover_povs(&config.pov_dir())?;
        obs::emit_run_started(
            run_id,
            pov_paths.len(),
            &config.builder_module,
            self.backend.name(),
        );
        if pov_paths.is_empty() {
            warn!(event = "run.no_povs", dir = %config.pov_dir().display());
            return Ok(RunOutcome::NoPovs);
        }
        let variants = PovVariant::from_paths(&pov_paths, &config.harness);
        let ref_diff = source::read_reference_diff(&config.diff_dir());

        abortable(abort, Phase::Setup, self.client.probe(&config.builder_module)).await?;

        let agent_dir = config.agent_dir();
        let reproducer = CrashReproducer::new(
            self.client.clone(),
            config.builder_module.clone(),
            config.work_dir.clone(),
            agent_dir.clone(),
        );
        state.povs = abortable(abort, Phase::Pov, reproducer.reproduce_all(&variants)).await?;
        let anomalous = state.povs.iter().filter(|p| p.is_anomalous()).count();
        if anomalous > 0 {
            warn!(
                event = "pov.anomalous",
                anomalous = anomalous,
                total = state.povs.len(),
            );
        }

        source::reset_source(&source_dir).await;

        let cache_root = config.cache_root();
        let instructions = Instructions {
            language: &config.language,
            sanitizer: &config.sanitizer,
            harness: &config.harness,
            builder_module: &config.builder_module,
            gateway: &config.gateway_program,
            work_dir: &agent_dir,
            patches_dir: &config.patches_dir,
            povs: &state.povs,
            ref_diff: ref_diff.as_deref(),
        };
        instructions.write_to(&source_dir)?;
        let prompt = instructions.prompt();

        let ctx = LaunchContext {
            source_dir: &source_dir,
            work_dir: &agent_dir,
            patches_dir: &config.patches_dir,
            builder_module: &config.builder_module,
            harness: &config.harness,
            builder_program: &config.builder_program,
            cache_dir: &cache_root,
            prompt: &prompt,
        };
        let slot = Arc::new(SubmissionSlot::new());
        let session = self.supervise(&ctx, &slot, abort).await;
        source::reset_source(&source_dir).await;
        state.rejected = slot.rejected();
        let session = session?;
        let session_state = session.state;
        state.session = Some(session);

        let record = slot.get().cloned();
        self.withhold_rejected(&state.rejected, record.as_ref());

        let Some(record) = record else {
            warn!(event = "run.no_patch", session_state = ?session_state);
            return Ok(RunOutcome::NoPatch { session_state });
        };

        let verification = match config.verify {
            VerificationPolicy::Off => None,
            _ => {
                let verifier = Verifier::new(
                    self.client.clone(),
                    config.builder_module.clone(),
                    config.work_dir.clone(),
                );
                let verify = async { Ok(verifier.verify(&record.candidate, &state.povs).await) };
                // An accepted patch is still forwarded, unverified, on abort.
                match abortable(abort, Phase::Build, verify).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        warn!(event = "verification.aborted", error = %e);
                        None
                    }
                }
            }
        };

        if let Some(report) = verification.as_ref().filter(|v| v.is_mismatch()) {
            warn!(
                event = "verification.mismatch",
                policy = %config.verify,
                failed_checks = report.failed.len(),
            );
            if config.verify == VerificationPolicy::Block {
                self.withhold(&record.source_path);
                return Ok(RunOutcome::VerificationBlocked {
                    record,
                    verification: report.clone(),
                });
            }
        }

        state.forwarded = Some(self.sink.forward(&record)?);

        let grace = Duration::from_secs(config.post_submit_grace_secs);
        if !grace.is_zero() {
            info!(event = "run.post_submit_grace", secs = grace.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = abort.cancelled() => {}
            }
        }

        Ok(RunOutcome::Submitted {
            record,
            verification,
        })
    }

    /// Move every rejected diff still in the patches directory out of it,
    /// except the file that was accepted.
    fn withhold_rejected(&self, rejected: &[RejectedSubmission], accepted: Option<&SubmissionRecord>) {
        let mut paths: Vec<&Path> = rejected
            .iter()
            .map(|r| r.path.as_path())
            .filter(|path| accepted.map_or(true, |a| a.source_path != *path))
            .collect();
        paths.sort();
        paths.dedup();
        for path in paths {
            self.withhold(path);
        }
    }

    fn withhold(&self, path: &Path) {
        if let Err(e) = self.sink.withhold(path) {
            warn!(event = "submission.withhold_failed", path = %path.display(), error = %e);
        }
    }

    /// Agent session plus watcher; the watcher lingers briefly after the
    /// session ends to pick up a late write.
    async fn supervise(
        &self,
        ctx: &LaunchContext<'_>,
        slot: &Arc<SubmissionSlot>,
        abort: &CancellationToken,
    ) -> Result<SessionReport> {
        let config = &self.config;
        let submitted = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let watcher = SubmissionWatcher::new(
            config.patches_dir.clone(),
            Arc::clone(slot),
            Duration::from_millis(config.poll_interval_ms),
            submitted.clone(),
        );
        let watcher_task = tokio::spawn(watcher.run(shutdown.clone()));

        let mut supervisor = AgentSupervisor::new(
            Arc::clone(&self.backend),
            SupervisorConfig::new(
                config.agent_timeout_secs,
                config.agent_grace_ms,
                config.stop_on_submission,
            ),
        );
        let session = supervisor.run(ctx, abort, &submitted).await;

        if !slot.is_sealed() && !abort.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(config.watcher_linger_ms)).await;
        }
        shutdown.cancel();
        if let Err(e) = watcher_task.await {
            warn!(event = "submission.watcher_failed", error = %e);
        }
        session
    }

    fn finish(
        &self,
        run_id: String,
        started_at: chrono::DateTime<Utc>,
        outcome: RunOutcome,
        state: RunState,
    ) -> RunReport {
        let config = &self.config;
        let report = RunReport {
            schema_version: RUN_REPORT_SCHEMA.to_string(),
            run_id,
            target: config.target.clone(),
            harness: config.harness.clone(),
            builder_module: config.builder_module.clone(),
            agent: self.backend.name().to_string(),
            verify: config.verify,
            started_at,
            finished_at: Utc::now(),
            outcome,
            povs: state.povs,
            session: state.session,
            rejected: state.rejected,
            forwarded: state.forwarded,
            build_cache: self.client.cache_stats(),
        };

        let path = config.report_path();
        if let Err(e) = write_run_report(&path, &report) {
            warn!(event = "report.write_failed", path = %path.display(), error = %e);
        }
        obs::emit_run_finished(&report.run_id, report.outcome.as_str(), report.duration_ms());
        report
    }
}

/// Drop `fut` (and any builder child it owns) as soon as `abort` fires.
async fn abortable<T>(
    abort: &CancellationToken,
    phase: Phase,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = abort.cancelled() => Err(PatcherError::Aborted { phase }),
        result = fut => result,
    }
}
