//! CLI-driven builder protocol.
//!
//! ```text
//! <prog> apply-patch-build <patch-file> <response-dir> --builder <module>
//! <prog> run-pov <pov-file> <response-dir> --harness <h> --build-id <id> --builder <module>
//! <prog> run-test <response-dir> --build-id <id> --builder <module>
//! ```
//!
//! The exit code is taken from the `retcode` file when present, otherwise from
//! the process. A non-zero process exit that left nothing in the response
//! directory means the request never reached the builder.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::bundle::{prepare_response_dir, read_response_dir, ResponseFiles, PATCH_FILE};
use super::{BuildRequest, BuilderService, PovRunRequest, TestRunRequest};
use crate::domain::{BuildResult, ExecStatus, PatcherError, Phase, Result, RunResult};

/// Default builder CLI.
pub const DEFAULT_BUILDER_PROGRAM: &str = "libCRS";

/// Builder service reached through a command-line client.
#[derive(Debug, Clone)]
pub struct CommandBuilderService {
    program: String,
    /// Service host resolved by [`BuilderService::probe`].
    host: Option<String>,
    /// Hard cap on one CLI round trip; exceeding it is an infrastructure failure.
    round_trip_timeout: Option<Duration>,
}

impl Default for CommandBuilderService {
    fn default() -> Self {
        Self::new(DEFAULT_BUILDER_PROGRAM)
    }
}

impl CommandBuilderService {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            host: None,
            round_trip_timeout: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, phase: Phase, args: &[String], response_dir: &Path) -> Result<Invocation> {
        let snapshot = prepare_response_dir(response_dir).await?;
        let start = Instant::now();

        debug!(event = "builder.invoke", phase = %phase, program = %self.program, args = ?args);

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PatcherError::infrastructure(
                    phase,
                    format!("failed to spawn builder client {}: {e}", self.program),
                )
            })?;

        let output = match self.round_trip_timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    PatcherError::infrastructure(
                        phase,
                        format!("builder did not answer within {}s", limit.as_secs()),
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        let mut files = read_response_dir(response_dir, phase)?;
        snapshot.retain_fresh(response_dir, &mut files);
        let client_stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let exit_code = match (files.retcode, output.status.code()) {
            (Some(code), _) => code,
            (None, Some(0)) => 0,
            (None, Some(code)) if !files.is_empty() => code,
            (None, Some(code)) => {
                return Err(PatcherError::infrastructure(
                    phase,
                    format!(
                        "builder client exited {code} without a response: {}",
                        client_stderr.trim()
                    ),
                ))
            }
            (None, None) => {
                return Err(PatcherError::infrastructure(
                    phase,
                    "builder client terminated by signal",
                ))
            }
        };

        if !output.stdout.is_empty() {
            files.logs.artifacts.insert(
                "client_stdout.log".to_string(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
            );
        }
        if !client_stderr.is_empty() {
            files
                .logs
                .artifacts
                .insert("client_stderr.log".to_string(), client_stderr);
        }

        info!(
            event = "builder.response",
            phase = %phase,
            exit_code = exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
        );

        Ok(Invocation {
            status: ExecStatus::from_exit_code(exit_code),
            files,
        })
    }
}

struct Invocation {
    status: ExecStatus,
    files: ResponseFiles,
}

fn run_result(invocation: Invocation, stderr_names: &[&str]) -> RunResult {
    let stderr = invocation
        .files
        .logs
        .first_of(stderr_names)
        .unwrap_or_default()
        .to_string();
    RunResult::new(invocation.status, stderr, invocation.files.logs)
}

#[async_trait]
impl BuilderService for CommandBuilderService {
    fn name(&self) -> &str {
        &self.program
    }

    async fn probe(&self, builder_module: &str) -> Result<()> {
        let Some(host) = &self.host else {
            return Ok(());
        };
        let mut addrs = tokio::net::lookup_host((host.as_str(), 0))
            .await
            .map_err(|e| {
                PatcherError::infrastructure(
                    Phase::Setup,
                    format!("builder {builder_module} host {host} did not resolve: {e}"),
                )
            })?;
        match addrs.next() {
            Some(addr) => {
                info!(event = "builder.resolved", builder = %builder_module, addr = %addr.ip());
                Ok(())
            }
            None => Err(PatcherError::infrastructure(
                Phase::Setup,
                format!("builder {builder_module} host {host} has no addresses"),
            )),
        }
    }

    async fn apply_patch_build(&self, request: &BuildRequest<'_>) -> Result<BuildResult> {
        tokio::fs::create_dir_all(request.response_dir).await?;
        let patch_path = request.response_dir.join(PATCH_FILE);
        tokio::fs::write(&patch_path, request.patch.bytes()).await?;

        let args = vec![
            "apply-patch-build".to_string(),
            patch_path.display().to_string(),
            request.response_dir.display().to_string(),
            "--builder".to_string(),
            request.builder_module.to_string(),
        ];
        let invocation = self.invoke(Phase::Build, &args, request.response_dir).await?;

        match invocation.status {
            ExecStatus::Success => {
                let build_id = invocation.files.build_id.ok_or_else(|| {
                    PatcherError::infrastructure(
                        Phase::Build,
                        "build succeeded but no build_id was returned",
                    )
                })?;
                Ok(BuildResult::success(build_id, invocation.files.logs))
            }
            status => Ok(BuildResult::failed(status, invocation.files.logs)),
        }
    }

    async fn run_pov(&self, request: &PovRunRequest<'_>) -> Result<RunResult> {
        let args = vec![
            "run-pov".to_string(),
            request.pov_path.display().to_string(),
            request.response_dir.display().to_string(),
            "--harness".to_string(),
            request.harness.to_string(),
            "--build-id".to_string(),
            request.build_id.to_string(),
            "--builder".to_string(),
            request.builder_module.to_string(),
        ];
        let invocation = self.invoke(Phase::Pov, &args, request.response_dir).await?;
        Ok(run_result(invocation, &["pov_stderr.log", "stderr.log"]))
    }

    async fn run_test(&self, request: &TestRunRequest<'_>) -> Result<RunResult> {
        let args = vec![
            "run-test".to_string(),
            request.response_dir.display().to_string(),
            "--build-id".to_string(),
            request.build_id.to_string(),
            "--builder".to_string(),
            request.builder_module.to_string(),
        ];
        let invocation = self.invoke(Phase::Test, &args, request.response_dir).await?;
        Ok(run_result(invocation, &["test_stderr.log", "stderr.log"]))
    }
}
