//! Run configuration.
//!
//! Defaults match the framework container layout. `from_env()` reads the
//! framework's environment variables on top of them; `patcherd` flags
//! override both.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::builder::command::DEFAULT_BUILDER_PROGRAM;
use crate::builder::{CommandBuilderService, RetryPolicy};
use crate::domain::{PatcherError, Result};

pub const DEFAULT_BUILDER_MODULE: &str = "inc-builder-asan";
pub const DEFAULT_GATEWAY_PROGRAM: &str = "patcherd";
pub const DEFAULT_COPILOT_MODEL: &str = "claude-sonnet-4.5";

/// What to do when the confirmatory pass disagrees with the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// No confirmatory pass.
    Off,
    /// Verify, report mismatches, forward anyway.
    #[default]
    Annotate,
    /// Verify and withhold forwarding on mismatch.
    Block,
}

impl VerificationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationPolicy::Off => "off",
            VerificationPolicy::Annotate => "annotate",
            VerificationPolicy::Block => "block",
        }
    }
}

impl fmt::Display for VerificationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationPolicy {
    type Err = PatcherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(VerificationPolicy::Off),
            "annotate" => Ok(VerificationPolicy::Annotate),
            "block" => Ok(VerificationPolicy::Block),
            other => Err(PatcherError::InvalidConfig(format!(
                "unknown verification policy {other:?} (expected off|annotate|block)"
            ))),
        }
    }
}

/// Which agent backend drives the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    CopilotCli,
    External,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::CopilotCli => "copilot_cli",
            AgentKind::External => "external",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = PatcherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "copilot_cli" | "copilot" => Ok(AgentKind::CopilotCli),
            "external" => Ok(AgentKind::External),
            other => Err(PatcherError::InvalidConfig(format!("unknown agent {other:?}"))),
        }
    }
}

/// Full configuration for one orchestrated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherConfig {
    pub target: String,
    /// Empty when the framework did not name a harness.
    pub harness: String,
    pub language: String,
    pub sanitizer: String,
    pub builder_module: String,

    pub agent: AgentKind,
    pub model: String,
    /// Program and arguments for [`AgentKind::External`]; `{prompt}` is
    /// substituted in each argument.
    pub agent_command: Vec<String>,
    /// Wall-clock limit for the agent session; 0 means none.
    pub agent_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL.
    pub agent_grace_ms: u64,
    /// Stop the agent as soon as a submission is accepted.
    pub stop_on_submission: bool,

    pub work_dir: PathBuf,
    /// Directory the agent writes `*.diff` files into.
    pub patches_dir: PathBuf,
    /// When set, accepted patches are copied here exactly once.
    pub forward_dir: Option<PathBuf>,
    /// Build cache root; `<work>/build-cache` when unset.
    pub cache_dir: Option<PathBuf>,

    pub builder_program: String,
    /// Command the agent is told to use for builds and runs.
    pub gateway_program: String,
    /// Builder service host for the fail-fast probe.
    pub builder_host: Option<String>,
    /// Cap on one builder CLI round trip; 0 means none.
    pub builder_timeout_secs: u64,
    pub retry: RetryPolicy,

    pub verify: VerificationPolicy,
    pub post_submit_grace_secs: u64,
    pub poll_interval_ms: u64,
    /// How long the watcher keeps polling after the session ends.
    pub watcher_linger_ms: u64,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            harness: String::new(),
            language: "c".to_string(),
            sanitizer: "address".to_string(),
            builder_module: DEFAULT_BUILDER_MODULE.to_string(),
            agent: AgentKind::default(),
            model: DEFAULT_COPILOT_MODEL.to_string(),
            agent_command: Vec::new(),
            agent_timeout_secs: 0,
            agent_grace_ms: 2_000,
            stop_on_submission: true,
            work_dir: PathBuf::from("/work"),
            patches_dir: PathBuf::from("/patches"),
            forward_dir: None,
            cache_dir: None,
            builder_program: DEFAULT_BUILDER_PROGRAM.to_string(),
            gateway_program: DEFAULT_GATEWAY_PROGRAM.to_string(),
            builder_host: None,
            builder_timeout_secs: 0,
            retry: RetryPolicy::default(),
            verify: VerificationPolicy::default(),
            post_submit_grace_secs: 30,
            poll_interval_ms: 500,
            watcher_linger_ms: 1_000,
        }
    }
}

impl PatcherConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("OSS_CRS_TARGET") {
            config.target = v;
        }
        if let Some(v) = get("OSS_CRS_TARGET_HARNESS") {
            config.harness = v;
        }
        if let Some(v) = get("FUZZING_LANGUAGE") {
            config.language = v;
        }
        if let Some(v) = get("SANITIZER") {
            config.sanitizer = v;
        }
        if let Some(v) = get("BUILDER_MODULE") {
            config.builder_module = v;
        }
        if let Some(v) = get("CRS_AGENT") {
            config.agent = v.parse()?;
        }
        if let Some(v) = get("COPILOT_MODEL") {
            config.model = v;
        }
        if let Some(v) = get("PATCHER_AGENT_COMMAND") {
            config.agent_command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = get("AGENT_TIMEOUT") {
            config.agent_timeout_secs = v.trim().parse().unwrap_or_else(|_| {
                warn!(event = "config.invalid_value", key = "AGENT_TIMEOUT", value = %v);
                0
            });
        }
        if let Some(v) = get("PATCHER_WORK_DIR") {
            config.work_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PATCHER_PATCHES_DIR") {
            config.patches_dir = PathBuf::from(v);
        }
        config.forward_dir = get("PATCHER_FORWARD_DIR").map(PathBuf::from);
        config.cache_dir = get("PATCHER_CACHE_DIR").map(PathBuf::from);
        if let Some(v) = get("PATCHER_BUILDER_PROGRAM") {
            config.builder_program = v;
        }
        if let Some(v) = get("PATCHER_GATEWAY") {
            config.gateway_program = v;
        }
        config.builder_host = get("PATCHER_BUILDER_HOST");
        if let Some(v) = get("PATCHER_BUILDER_TIMEOUT") {
            match v.trim().parse() {
                Ok(secs) => config.builder_timeout_secs = secs,
                Err(_) => {
                    warn!(event = "config.invalid_value", key = "PATCHER_BUILDER_TIMEOUT", value = %v)
                }
            }
        }
        if let Some(v) = get("PATCHER_VERIFY") {
            config.verify = v.parse()?;
        }
        if let Some(v) = get("PATCHER_POST_SUBMIT_GRACE") {
            match v.trim().parse() {
                Ok(secs) => config.post_submit_grace_secs = secs,
                Err(_) => {
                    warn!(event = "config.invalid_value", key = "PATCHER_POST_SUBMIT_GRACE", value = %v)
                }
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.builder_module.trim().is_empty() {
            return Err(PatcherError::InvalidConfig(
                "builder module must not be empty".to_string(),
            ));
        }
        if self.builder_program.trim().is_empty() {
            return Err(PatcherError::InvalidConfig(
                "builder program must not be empty".to_string(),
            ));
        }
        match self.agent {
            AgentKind::CopilotCli if self.model.trim().is_empty() => {
                return Err(PatcherError::InvalidConfig(
                    "copilot_cli agent requires a model".to_string(),
                ))
            }
            AgentKind::External if self.agent_command.is_empty() => {
                return Err(PatcherError::InvalidConfig(
                    "external agent requires PATCHER_AGENT_COMMAND".to_string(),
                ))
            }
            _ => {}
        }
        if self.poll_interval_ms == 0 {
            return Err(PatcherError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.forward_dir.as_ref() == Some(&self.patches_dir) {
            return Err(PatcherError::InvalidConfig(
                "forward dir must differ from the patches dir".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pov_dir(&self) -> PathBuf {
        self.work_dir.join("povs")
    }

    pub fn diff_dir(&self) -> PathBuf {
        self.work_dir.join("diffs")
    }

    pub fn source_root(&self) -> PathBuf {
        self.work_dir.join("src")
    }

    /// Agent scratch dir: crash logs and agent stdout/stderr.
    pub fn agent_dir(&self) -> PathBuf {
        self.work_dir.join("agent")
    }

    /// Build cache root shared with gateway invocations.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("build-cache"))
    }

    /// Where an in-place run moves diffs that must not be submitted.
    pub fn withheld_dir(&self) -> PathBuf {
        self.work_dir.join("withheld")
    }

    pub fn report_path(&self) -> PathBuf {
        self.work_dir.join("run_report.json")
    }

    /// Upstream builder CLI client for this configuration.
    pub fn builder_service(&self) -> CommandBuilderService {
        let mut service = CommandBuilderService::new(self.builder_program.clone());
        if let Some(host) = &self.builder_host {
            service = service.with_host(host.clone());
        }
        if self.builder_timeout_secs > 0 {
            service =
                service.with_round_trip_timeout(Duration::from_secs(self.builder_timeout_secs));
        }
        service
    }

    /// `None` when no deadline is configured.
    pub fn deadline_secs(&self) -> Option<u64> {
        (self.agent_timeout_secs > 0).then_some(self.agent_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_container_layout() {
        let config = PatcherConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.builder_module, "inc-builder-asan");
        assert_eq!(config.agent, AgentKind::CopilotCli);
        assert_eq!(config.work_dir, PathBuf::from("/work"));
        assert_eq!(config.patches_dir, PathBuf::from("/patches"));
        assert_eq!(config.pov_dir(), PathBuf::from("/work/povs"));
        assert_eq!(config.verify, VerificationPolicy::Annotate);
        assert_eq!(config.post_submit_grace_secs, 30);
        assert_eq!(config.deadline_secs(), None);
        config.validate().unwrap();
    }

    #[test]
    fn env_values_override_defaults() {
        let config = PatcherConfig::from_lookup(lookup(&[
            ("OSS_CRS_TARGET", "libpng"),
            ("OSS_CRS_TARGET_HARNESS", "png_read_fuzzer"),
            ("BUILDER_MODULE", "inc-builder-ubsan"),
            ("AGENT_TIMEOUT", "900"),
            ("PATCHER_VERIFY", "block"),
            ("PATCHER_FORWARD_DIR", "/out/patches"),
        ]))
        .unwrap();
        assert_eq!(config.target, "libpng");
        assert_eq!(config.harness, "png_read_fuzzer");
        assert_eq!(config.builder_module, "inc-builder-ubsan");
        assert_eq!(config.deadline_secs(), Some(900));
        assert_eq!(config.verify, VerificationPolicy::Block);
        assert_eq!(config.forward_dir, Some(PathBuf::from("/out/patches")));
    }

    #[test]
    fn invalid_timeout_means_no_deadline() {
        let config = PatcherConfig::from_lookup(lookup(&[("AGENT_TIMEOUT", "soon")])).unwrap();
        assert_eq!(config.deadline_secs(), None);
    }

    #[test]
    fn builder_service_follows_program_setting() {
        let config = PatcherConfig::from_lookup(lookup(&[
            ("PATCHER_BUILDER_PROGRAM", "/opt/crs/bin/libCRS"),
            ("PATCHER_BUILDER_TIMEOUT", "600"),
        ]))
        .unwrap();
        assert_eq!(config.builder_timeout_secs, 600);
        assert_eq!(config.builder_service().program(), "/opt/crs/bin/libCRS");
    }

    #[test]
    fn unknown_policy_or_agent_is_rejected() {
        assert!(PatcherConfig::from_lookup(lookup(&[("PATCHER_VERIFY", "maybe")])).is_err());
        assert!(PatcherConfig::from_lookup(lookup(&[("CRS_AGENT", "clippy")])).is_err());
    }

    #[test]
    fn external_agent_requires_command() {
        let mut config = PatcherConfig {
            agent: AgentKind::External,
            ..PatcherConfig::default()
        };
        assert!(config.validate().is_err());
        config.agent_command = vec!["my-agent".into(), "{prompt}".into()];
        config.validate().unwrap();
    }

    #[test]
    fn serde_fills_missing_fields_with_defaults() {
        let config: PatcherConfig =
            serde_json::from_str(r#"{"harness":"fuzz_x","verify":"off"}"#).unwrap();
        assert_eq!(config.harness, "fuzz_x");
        assert_eq!(config.verify, VerificationPolicy::Off);
        assert_eq!(config.agent_grace_ms, 2_000);
    }
}
