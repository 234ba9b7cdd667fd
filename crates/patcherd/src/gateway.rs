//! Caching gateway in front of the builder CLI.
//!
//! Agents call `patcherd apply-patch-build|run-pov|run-test` with the same
//! arguments they would pass the builder. Builds share the persistent cache
//! at `PATCHER_CACHE_DIR` with the orchestrator; POV and test runs always
//! go upstream.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use patcher_core::builder::bundle::write_response_bundle;
use patcher_core::{
    BuildCache, BuildId, BuilderClient, ExecStatus, LogBundle, PatchCandidate, PatcherConfig,
    RunResult,
};
use tracing::{error, info};

/// Exit code when no valid builder response could be obtained.
pub const EXIT_INFRASTRUCTURE: u8 = 2;

/// Map an operation result to the process exit code.
pub fn exit(result: Result<ExecStatus>) -> ExitCode {
    if let Err(e) = &result {
        error!(event = "gateway.failed", error = %format!("{e:#}"));
    }
    ExitCode::from(exit_code(&result))
}

fn exit_code(result: &Result<ExecStatus>) -> u8 {
    match result {
        // Codes that do not fit a u8 still read as a failure.
        Ok(status) => match u8::try_from(status.exit_code()) {
            Ok(code) => code,
            Err(_) => 1,
        },
        Err(_) => EXIT_INFRASTRUCTURE,
    }
}

fn client() -> Result<BuilderClient> {
    let config = PatcherConfig::from_env().context("invalid environment configuration")?;
    let upstream = Path::new(&config.builder_program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if upstream == env!("CARGO_PKG_NAME") {
        bail!(
            "PATCHER_BUILDER_PROGRAM points at the gateway itself ({})",
            config.builder_program
        );
    }

    let service = config.builder_service();
    let cache_root = config.cache_root();
    let cache = BuildCache::persistent(&cache_root)
        .with_context(|| format!("open build cache at {}", cache_root.display()))?;
    Ok(BuilderClient::new(Arc::new(service), Arc::new(cache)).with_retry_policy(config.retry))
}

pub async fn apply_patch_build(
    patch: &Path,
    response_dir: &Path,
    builder: &str,
) -> Result<ExecStatus> {
    let bytes = std::fs::read(patch).with_context(|| format!("read {}", patch.display()))?;
    let candidate = PatchCandidate::new(bytes);
    let client = client()?;

    let result = client
        .apply_patch_and_build(&candidate, builder, response_dir)
        .await
        .context("apply-patch-build")?;

    // Normalize retcode and build_id whichever side produced the bundle.
    write_response_bundle(
        response_dir,
        result.status,
        result.build_id.as_ref(),
        &LogBundle::default(),
        result.cache_hit,
    )
    .context("write response bundle")?;

    info!(
        event = "gateway.build",
        patch = %candidate.digest().short(),
        builder = %builder,
        cache_hit = result.cache_hit,
        status = %result.status,
    );
    if let Some(id) = &result.build_id {
        println!("{id}");
    }
    Ok(result.status)
}

pub async fn run_pov(
    pov: &Path,
    response_dir: &Path,
    harness: &str,
    build_id: &str,
    builder: &str,
) -> Result<ExecStatus> {
    let client = client()?;
    let build_id = BuildId::new(build_id);
    let result = client
        .run_pov(&build_id, pov, harness, builder, response_dir)
        .await
        .context("run-pov")?;
    finish_run(response_dir, &build_id, &result)
}

pub async fn run_test(response_dir: &Path, build_id: &str, builder: &str) -> Result<ExecStatus> {
    let client = client()?;
    let build_id = BuildId::new(build_id);
    let result = client
        .run_test(&build_id, builder, response_dir)
        .await
        .context("run-test")?;
    finish_run(response_dir, &build_id, &result)
}

fn finish_run(response_dir: &Path, build_id: &BuildId, result: &RunResult) -> Result<ExecStatus> {
    write_response_bundle(
        response_dir,
        result.status,
        Some(build_id),
        &LogBundle::default(),
        false,
    )
    .context("write response bundle")?;
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    Ok(result.status)
}
