//! Shared fixtures: a scripted builder, a work-dir layout and shell agents.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use patcher_core::builder::{BuildRequest, PovRunRequest, TestRunRequest};
use patcher_core::{
    backend_for, AgentKind, BuildCache, BuildId, BuildResult, BuilderClient, BuilderService,
    DirectorySink, ExecStatus, LogBundle, InPlaceSink, Orchestrator, PatcherConfig, PatcherError,
    Phase, RetryPolicy, RunResult, SubmissionSink,
};
use tempfile::TempDir;

pub const HARNESS: &str = "fuzz_png";
pub const MODULE: &str = "inc-builder-asan";

pub const ASAN_REPORT: &str =
    "==42==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602000000011\n";

/// Structurally valid one-file fix.
pub const FIX_DIFF: &str = "\
--- a/src/pngread.c
+++ b/src/pngread.c
@@ -10,3 +10,4 @@
 int len = hdr->len;
 char buf[16];
+if (len > 16) return -1;
 memcpy(buf, hdr->data, len);
";

/// A different valid fix touching another file.
pub const OTHER_DIFF: &str = "\
--- a/src/pngrutil.c
+++ b/src/pngrutil.c
@@ -1,2 +1,2 @@
-size_t n = width * height;
+size_t n = (size_t)width * height;
 return n;
";

/// In-process builder with canned answers and call counters.
///
/// Builds succeed with ids `build-<n>`; POVs crash on the base build and
/// pass on patched builds unless configured otherwise.
pub struct ScriptedBuilder {
    pub builds: AtomicU32,
    pub pov_runs: AtomicU32,
    pub test_runs: AtomicU32,
    infra_failures: AtomicU32,
    unreachable: bool,
    build_code: i32,
    base_pov_code: i32,
    patched_pov_code: i32,
    test_code: i32,
}

impl Default for ScriptedBuilder {
    fn default() -> Self {
        Self {
            builds: AtomicU32::new(0),
            pov_runs: AtomicU32::new(0),
            test_runs: AtomicU32::new(0),
            infra_failures: AtomicU32::new(0),
            unreachable: false,
            build_code: 0,
            base_pov_code: 1,
            patched_pov_code: 0,
            test_code: 0,
        }
    }
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_code(mut self, code: i32) -> Self {
        self.build_code = code;
        self
    }

    pub fn base_pov_code(mut self, code: i32) -> Self {
        self.base_pov_code = code;
        self
    }

    pub fn patched_pov_code(mut self, code: i32) -> Self {
        self.patched_pov_code = code;
        self
    }

    pub fn test_code(mut self, code: i32) -> Self {
        self.test_code = code;
        self
    }

    /// The first `n` build requests fail as unreachable.
    pub fn infra_failures(self, n: u32) -> Self {
        self.infra_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every probe fails as unreachable.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn builds(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn pov_runs(&self) -> u32 {
        self.pov_runs.load(Ordering::SeqCst)
    }

    pub fn test_runs(&self) -> u32 {
        self.test_runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuilderService for ScriptedBuilder {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self, builder_module: &str) -> patcher_core::Result<()> {
        if self.unreachable {
            return Err(PatcherError::infrastructure(
                Phase::Setup,
                format!("{builder_module}: name resolution failed"),
            ));
        }
        Ok(())
    }

    async fn apply_patch_build(&self, _request: &BuildRequest<'_>) -> patcher_core::Result<BuildResult> {
        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = self.infra_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.infra_failures.store(pending - 1, Ordering::SeqCst);
            return Err(PatcherError::Infrastructure {
                phase: Phase::Build,
                message: "connection refused".to_string(),
            });
        }
        match ExecStatus::from_exit_code(self.build_code) {
            ExecStatus::Success => Ok(BuildResult::success(
                BuildId::new(format!("build-{n}")),
                LogBundle::default().with_artifact("build.log", "compiled 12 units"),
            )),
            status => Ok(BuildResult::failed(
                status,
                LogBundle::default().with_artifact("build.log", "error: expected ';'"),
            )),
        }
    }

    async fn run_pov(&self, request: &PovRunRequest<'_>) -> patcher_core::Result<RunResult> {
        self.pov_runs.fetch_add(1, Ordering::SeqCst);
        let code = if request.build_id.is_base() {
            self.base_pov_code
        } else {
            self.patched_pov_code
        };
        let status = ExecStatus::from_exit_code(code);
        let stderr = if status.is_success() { "" } else { ASAN_REPORT };
        Ok(RunResult::new(status, stderr, LogBundle::default()))
    }

    async fn run_test(&self, _request: &TestRunRequest<'_>) -> patcher_core::Result<RunResult> {
        self.test_runs.fetch_add(1, Ordering::SeqCst);
        Ok(RunResult::new(
            ExecStatus::from_exit_code(self.test_code),
            "",
            LogBundle::default(),
        ))
    }
}

pub fn client(builder: &Arc<ScriptedBuilder>, cache: BuildCache) -> BuilderClient {
    let service: Arc<dyn BuilderService> = builder.clone();
    BuilderClient::new(service, Arc::new(cache)).with_retry_policy(RetryPolicy {
        max_retries: 2,
        backoff_base_ms: 1,
    })
}

pub fn run_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git");
    assert!(status.success(), "git {:?} failed", args);
}

pub fn make_git_repo(dir: &Path) {
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(dir.join("src/pngread.c"), "int main(void) { return 0; }\n").unwrap();
    run_git(dir, &["init", "-q"]);
    run_git(dir, &["config", "user.email", "ci@example.com"]);
    run_git(dir, &["config", "user.name", "ci"]);
    run_git(dir, &["add", "."]);
    run_git(dir, &["commit", "-q", "-m", "base"]);
}

/// Framework layout under a temp dir: `work/{src/repo,povs}` and `patches/`.
pub struct Workspace {
    pub root: TempDir,
    pub work: PathBuf,
    pub repo: PathBuf,
    pub patches: PathBuf,
}

impl Workspace {
    pub fn new(pov_count: usize) -> Self {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("work");
        let repo = work.join("src/repo");
        let patches = root.path().join("patches");
        make_git_repo(&repo);

        let povs = work.join("povs");
        std::fs::create_dir_all(&povs).unwrap();
        for i in 0..pov_count {
            std::fs::write(povs.join(format!("pov_{i}.bin")), [0x89, b'P', b'N', b'G', i as u8])
                .unwrap();
        }
        std::fs::create_dir_all(&patches).unwrap();

        Self {
            root,
            work,
            repo,
            patches,
        }
    }

    /// Write `content` next to the work dir for agents to copy from.
    pub fn fixture(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Executable `/bin/sh` agent with `body` as its script.
    pub fn agent_script(&self, body: &str) -> PathBuf {
        let path = self.root.path().join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Names of the files left in the patches directory.
    pub fn patch_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.patches)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn forward_dir(&self) -> PathBuf {
        self.root.path().join("forwarded")
    }

    /// Fast settings for tests; `agent` is the script to run.
    pub fn config(&self, agent: &Path) -> PatcherConfig {
        PatcherConfig {
            target: "libpng".to_string(),
            harness: HARNESS.to_string(),
            builder_module: MODULE.to_string(),
            agent: AgentKind::External,
            agent_command: vec![agent.display().to_string()],
            agent_timeout_secs: 20,
            agent_grace_ms: 300,
            work_dir: self.work.clone(),
            patches_dir: self.patches.clone(),
            post_submit_grace_secs: 0,
            poll_interval_ms: 20,
            watcher_linger_ms: 200,
            retry: RetryPolicy::none(),
            ..PatcherConfig::default()
        }
    }
}

/// Orchestrator over `builder` with an in-memory cache.
pub fn orchestrator(config: PatcherConfig, builder: &Arc<ScriptedBuilder>) -> Orchestrator {
    let client = client(builder, BuildCache::in_memory());
    let backend = backend_for(&config).unwrap();
    let sink: Box<dyn SubmissionSink> = match &config.forward_dir {
        Some(dir) => Box::new(DirectorySink::new(dir.clone())),
        None => Box::new(InPlaceSink::new(config.withheld_dir())),
    };
    Orchestrator::new(config, client, backend, sink)
}
