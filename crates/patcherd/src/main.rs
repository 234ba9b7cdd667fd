//! POV Patcher daemon
//!
//! ## Commands
//!
//! - `run`: one full orchestrated run (reproduce, supervise agent, submit)
//! - `apply-patch-build`, `run-pov`, `run-test`: caching builder gateway
//!   with the same command-line contract as the upstream builder CLI

mod gateway;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patcher_core::{AgentKind, Orchestrator, PatcherConfig, VerificationPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

/// Exit code for setup or builder infrastructure errors during `run`.
const EXIT_RUN_ERROR: u8 = 1;

#[derive(Parser)]
#[command(name = "patcherd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Autonomous POV patcher and caching builder gateway", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline once
    Run(RunArgs),

    /// Build a patch through the cache
    ApplyPatchBuild {
        /// Unified diff to apply
        patch: PathBuf,
        /// Directory receiving retcode, build_id and logs
        response_dir: PathBuf,
        #[arg(long, env = "BUILDER_MODULE")]
        builder: String,
    },

    /// Replay a POV input against a build
    RunPov {
        pov: PathBuf,
        response_dir: PathBuf,
        #[arg(long, env = "OSS_CRS_TARGET_HARNESS")]
        harness: String,
        #[arg(long)]
        build_id: String,
        #[arg(long, env = "BUILDER_MODULE")]
        builder: String,
    },

    /// Run the test suite against a build
    RunTest {
        response_dir: PathBuf,
        #[arg(long)]
        build_id: String,
        #[arg(long, env = "BUILDER_MODULE")]
        builder: String,
    },
}

/// Overrides on top of the environment-derived configuration.
///
/// Environment keys are read by `PatcherConfig::from_env`, which tolerates
/// bad numeric values; flags here only override.
#[derive(clap::Args)]
struct RunArgs {
    /// Framework work directory (povs/, diffs/, src/)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Directory the agent writes its diff into
    #[arg(long)]
    patches_dir: Option<PathBuf>,

    /// Copy the accepted patch here instead of submitting in place
    #[arg(long)]
    forward_dir: Option<PathBuf>,

    /// Persistent build cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Builder module selector
    #[arg(long)]
    builder: Option<String>,

    /// Fuzzing harness name
    #[arg(long)]
    harness: Option<String>,

    /// Agent backend (copilot_cli | external)
    #[arg(long)]
    agent: Option<String>,

    /// Model selector for the agent
    #[arg(long)]
    model: Option<String>,

    /// Agent deadline in seconds (0 = none)
    #[arg(long)]
    agent_timeout: Option<u64>,

    /// Verification policy (off | annotate | block)
    #[arg(long)]
    verify: Option<String>,

    /// Seconds to wait after forwarding a patch
    #[arg(long)]
    post_submit_grace: Option<u64>,
}

impl RunArgs {
    fn apply(self, config: &mut PatcherConfig) -> Result<()> {
        if let Some(v) = self.work_dir {
            config.work_dir = v;
        }
        if let Some(v) = self.patches_dir {
            config.patches_dir = v;
        }
        if let Some(v) = self.forward_dir {
            config.forward_dir = Some(v);
        }
        if let Some(v) = self.cache_dir {
            config.cache_dir = Some(v);
        }
        if let Some(v) = self.builder {
            config.builder_module = v;
        }
        if let Some(v) = self.harness {
            config.harness = v;
        }
        if let Some(v) = self.agent {
            config.agent = v.parse::<AgentKind>().context("invalid --agent")?;
        }
        if let Some(v) = self.model {
            config.model = v;
        }
        if let Some(v) = self.agent_timeout {
            config.agent_timeout_secs = v;
        }
        if let Some(v) = self.verify {
            config.verify = v
                .parse::<VerificationPolicy>()
                .context("invalid --verify")?;
        }
        if let Some(v) = self.post_submit_grace {
            config.post_submit_grace_secs = v;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    patcher_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => match cmd_run(args).await {
            Ok(code) => ExitCode::from(code),
            Err(e) => {
                error!(event = "run.failed", error = %format!("{e:#}"));
                ExitCode::from(EXIT_RUN_ERROR)
            }
        },
        Commands::ApplyPatchBuild {
            patch,
            response_dir,
            builder,
        } => gateway::exit(gateway::apply_patch_build(&patch, &response_dir, &builder).await),
        Commands::RunPov {
            pov,
            response_dir,
            harness,
            build_id,
            builder,
        } => gateway::exit(
            gateway::run_pov(&pov, &response_dir, &harness, &build_id, &builder).await,
        ),
        Commands::RunTest {
            response_dir,
            build_id,
            builder,
        } => gateway::exit(gateway::run_test(&response_dir, &build_id, &builder).await),
    }
}

async fn cmd_run(args: RunArgs) -> Result<u8> {
    let mut config = PatcherConfig::from_env().context("invalid environment configuration")?;
    args.apply(&mut config)?;

    info!(
        event = "patcherd.starting",
        version = patcher_core::VERSION,
        target = %config.target,
        harness = %config.harness,
        agent = %config.agent,
        builder = %config.builder_module,
        verify = %config.verify,
        deadline_secs = ?config.deadline_secs(),
    );

    let orchestrator = Orchestrator::from_config(config).context("failed to set up run")?;

    let abort = CancellationToken::new();
    tokio::spawn(abort_on_signal(abort.clone()));

    let report = orchestrator.run(abort).await.context("run failed")?;
    let code = report.outcome.exit_code();
    info!(
        event = "patcherd.finished",
        outcome = report.outcome.as_str(),
        exit_code = code,
    );
    Ok(u8::try_from(code).unwrap_or(EXIT_RUN_ERROR))
}

/// Cancel `abort` on SIGINT or SIGTERM.
async fn abort_on_signal(abort: CancellationToken) {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(event = "patcherd.signal_unavailable", error = %e);
            let _ = tokio::signal::ctrl_c().await;
            abort.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    warn!(event = "patcherd.abort", "termination signal received");
    abort.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "patcherd",
            "run",
            "--work-dir",
            "/tmp/w",
            "--verify",
            "block",
            "--agent-timeout",
            "60",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut config = PatcherConfig::default();
        args.apply(&mut config).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/tmp/w"));
        assert_eq!(config.verify, VerificationPolicy::Block);
        assert_eq!(config.agent_timeout_secs, 60);
    }

    #[test]
    fn invalid_timeout_in_environment_does_not_break_run() {
        std::env::set_var("AGENT_TIMEOUT", "soon");
        std::env::set_var("PATCHER_POST_SUBMIT_GRACE", "later");
        let cli = Cli::try_parse_from(["patcherd", "run"]).unwrap();
        std::env::remove_var("AGENT_TIMEOUT");
        std::env::remove_var("PATCHER_POST_SUBMIT_GRACE");

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.agent_timeout, None);

        let mut config = PatcherConfig::from_lookup(|key| match key {
            "AGENT_TIMEOUT" => Some("soon".to_string()),
            _ => None,
        })
        .unwrap();
        args.apply(&mut config).unwrap();
        assert_eq!(config.deadline_secs(), None);
    }

    #[test]
    fn gateway_run_pov_parses_builder_contract() {
        let cli = Cli::try_parse_from([
            "patcherd",
            "run-pov",
            "/work/povs/a.bin",
            "/work/agent/r1",
            "--harness",
            "fuzz_png",
            "--build-id",
            "b-3",
            "--builder",
            "inc-builder-asan",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::RunPov { ref build_id, .. } if build_id == "b-3"
        ));
    }
}
