//! Build and run results exchanged with the builder service.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Exit code the builder uses to signal an execution timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Opaque identifier of a compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    /// The unpatched build. Always available, never rebuilt.
    pub const BASE: &'static str = "base";

    pub fn new(id: impl Into<String>) -> Self {
        BuildId(id.into())
    }

    pub fn base() -> Self {
        BuildId(Self::BASE.to_string())
    }

    pub fn is_base(&self) -> bool {
        self.0 == Self::BASE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Three-way outcome of any builder operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "code")]
pub enum ExecStatus {
    /// Exit 0: build succeeded, POV no longer crashes, or tests pass/skip.
    Success,
    /// Any other non-zero exit: build error, reproduced crash, failing tests.
    Failure(i32),
    /// Exit 124.
    Timeout,
}

impl ExecStatus {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ExecStatus::Success,
            TIMEOUT_EXIT_CODE => ExecStatus::Timeout,
            other => ExecStatus::Failure(other),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ExecStatus::Success => 0,
            ExecStatus::Failure(code) => *code,
            ExecStatus::Timeout => TIMEOUT_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecStatus::Success)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecStatus::Timeout)
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecStatus::Success => f.write_str("success"),
            ExecStatus::Failure(code) => write!(f, "failure (exit {code})"),
            ExecStatus::Timeout => f.write_str("timeout"),
        }
    }
}

/// Log artifacts written by one builder call, keyed by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBundle {
    /// Directory the bundle was read from or written to.
    pub response_dir: Option<PathBuf>,

    /// Artifact name (e.g. `build.log`, `pov_stderr.log`) to text.
    pub artifacts: BTreeMap<String, String>,
}

impl LogBundle {
    pub fn new(response_dir: Option<PathBuf>) -> Self {
        Self {
            response_dir,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn with_artifact(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.artifacts.insert(name.into(), text.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.artifacts.get(name).map(String::as_str)
    }

    /// First artifact present among `names`, in order.
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|n| self.get(n))
    }
}

/// Outcome of an apply-patch-build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    /// Present only on success.
    pub build_id: Option<BuildId>,
    pub status: ExecStatus,
    pub logs: LogBundle,
    /// Set when served from the build cache instead of the builder.
    #[serde(default)]
    pub cache_hit: bool,
}

impl BuildResult {
    pub fn success(build_id: BuildId, logs: LogBundle) -> Self {
        Self {
            build_id: Some(build_id),
            status: ExecStatus::Success,
            logs,
            cache_hit: false,
        }
    }

    pub fn failed(status: ExecStatus, logs: LogBundle) -> Self {
        Self {
            build_id: None,
            status,
            logs,
            cache_hit: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.build_id.is_some()
    }

    /// Primary build log text, if the builder produced one.
    pub fn build_log(&self) -> Option<&str> {
        self.logs.first_of(&["build.log", "stdout.log", "stderr.log"])
    }
}

/// Outcome of a run-pov or run-test request. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: ExecStatus,
    /// Captured stderr of the run (empty if none was produced).
    pub stderr: String,
    pub logs: LogBundle,
}

impl RunResult {
    pub fn new(status: ExecStatus, stderr: impl Into<String>, logs: LogBundle) -> Self {
        Self {
            status,
            stderr: stderr.into(),
            logs,
        }
    }

    pub fn passed(&self) -> bool {
        self.status.is_success()
    }
}
