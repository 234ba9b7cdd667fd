//! Agent backends: how to turn a launch context into one command line.

use std::path::Path;
use std::sync::Arc;

use crate::config::{AgentKind, PatcherConfig};
use crate::domain::{PatcherError, Result};

pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Everything a backend may need to build the invocation.
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    /// Clean project checkout; the agent's working directory.
    pub source_dir: &'a Path,
    /// Agent scratch dir (crash logs, stdout/stderr logs).
    pub work_dir: &'a Path,
    pub patches_dir: &'a Path,
    pub builder_module: &'a str,
    pub harness: &'a str,
    /// Upstream builder CLI and shared build cache for gateway calls.
    pub builder_program: &'a str,
    pub cache_dir: &'a Path,
    pub prompt: &'a str,
}

/// Paths and selectors every agent receives.
pub fn framework_env(ctx: &LaunchContext<'_>) -> Vec<(String, String)> {
    vec![
        (
            "PATCHER_PATCHES_DIR".to_string(),
            ctx.patches_dir.display().to_string(),
        ),
        (
            "PATCHER_WORK_DIR".to_string(),
            ctx.work_dir.display().to_string(),
        ),
        (
            "PATCHER_BUILDER_MODULE".to_string(),
            ctx.builder_module.to_string(),
        ),
        ("PATCHER_HARNESS".to_string(), ctx.harness.to_string()),
        (
            "PATCHER_BUILDER_PROGRAM".to_string(),
            ctx.builder_program.to_string(),
        ),
        (
            "PATCHER_CACHE_DIR".to_string(),
            ctx.cache_dir.display().to_string(),
        ),
    ]
}

/// A fully resolved agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Narrow capability interface to a coding agent.
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Program and arguments for a single non-interactive run.
    fn invocation(&self, ctx: &LaunchContext<'_>) -> (String, Vec<String>);

    /// Environment handed to the agent.
    fn env(&self, ctx: &LaunchContext<'_>) -> Vec<(String, String)> {
        framework_env(ctx)
    }

    fn command(&self, ctx: &LaunchContext<'_>) -> AgentCommand {
        let (program, args) = self.invocation(ctx);
        AgentCommand {
            program,
            args,
            env: self.env(ctx),
        }
    }
}

/// GitHub Copilot CLI in autonomous mode.
#[derive(Debug, Clone)]
pub struct CopilotCli {
    program: String,
    model: String,
}

impl CopilotCli {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            program: "copilot".to_string(),
            model: model.into(),
        }
    }
}

impl AgentBackend for CopilotCli {
    fn name(&self) -> &str {
        "copilot_cli"
    }

    fn invocation(&self, ctx: &LaunchContext<'_>) -> (String, Vec<String>) {
        (
            self.program.clone(),
            vec![
                "-p".to_string(),
                ctx.prompt.to_string(),
                "--model".to_string(),
                self.model.clone(),
                "--yolo".to_string(),
            ],
        )
    }

    fn env(&self, ctx: &LaunchContext<'_>) -> Vec<(String, String)> {
        let mut env = vec![
            ("IS_SANDBOX".to_string(), "1".to_string()),
            ("COPILOT_MODEL".to_string(), self.model.clone()),
        ];
        env.extend(framework_env(ctx));
        env
    }
}

/// Any other agent: fixed program plus args with `{prompt}` substituted.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    name: String,
    program: String,
    args: Vec<String>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let name = Path::new(&program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        Self {
            name,
            program,
            args,
        }
    }

    /// `argv[0]` is the program.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            PatcherError::InvalidConfig("external agent command is empty".to_string())
        })?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

impl AgentBackend for ExternalCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn invocation(&self, ctx: &LaunchContext<'_>) -> (String, Vec<String>) {
        let args = self
            .args
            .iter()
            .map(|a| a.replace(PROMPT_PLACEHOLDER, ctx.prompt))
            .collect();
        (self.program.clone(), args)
    }
}

/// Backend selected by `config.agent`.
pub fn backend_for(config: &PatcherConfig) -> Result<Arc<dyn AgentBackend>> {
    match config.agent {
        AgentKind::CopilotCli => Ok(Arc::new(CopilotCli::new(config.model.clone()))),
        AgentKind::External => Ok(Arc::new(ExternalCommand::from_argv(&config.agent_command)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(prompt: &'a str) -> LaunchContext<'a> {
        LaunchContext {
            source_dir: Path::new("/work/src/repo"),
            work_dir: Path::new("/work/agent"),
            patches_dir: Path::new("/patches"),
            builder_module: "inc-builder-asan",
            harness: "fuzz_png",
            builder_program: "libCRS",
            cache_dir: Path::new("/work/build-cache"),
            prompt,
        }
    }

    #[test]
    fn copilot_command_line() {
        let cmd = CopilotCli::new("claude-sonnet-4.5").command(&ctx("Fix it."));
        assert_eq!(cmd.program, "copilot");
        assert_eq!(
            cmd.args,
            vec!["-p", "Fix it.", "--model", "claude-sonnet-4.5", "--yolo"]
        );
        assert!(cmd
            .env
            .contains(&("PATCHER_PATCHES_DIR".to_string(), "/patches".to_string())));
        assert!(cmd
            .env
            .contains(&("PATCHER_HARNESS".to_string(), "fuzz_png".to_string())));
    }

    #[test]
    fn external_substitutes_prompt() {
        let backend = ExternalCommand::from_argv(&[
            "/opt/agents/run.sh".to_string(),
            "--task={prompt}".to_string(),
            "--quiet".to_string(),
        ])
        .unwrap();
        assert_eq!(backend.name(), "run.sh");
        let cmd = backend.command(&ctx("go"));
        assert_eq!(cmd.program, "/opt/agents/run.sh");
        assert_eq!(cmd.args, vec!["--task=go", "--quiet"]);
        assert_eq!(cmd.env.len(), 6);
    }

    #[test]
    fn empty_external_command_is_config_error() {
        assert!(ExternalCommand::from_argv(&[]).is_err());
    }
}
