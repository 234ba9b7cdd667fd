//! POV Patcher Core Library
//!
//! Crash reproduction, agent supervision, build caching and exactly-once
//! patch submission for autonomous vulnerability repair.

pub mod agent;
pub mod build_cache;
pub mod builder;
pub mod cas;
pub mod config;
pub mod domain;
pub mod instructions;
pub mod obs;
pub mod orchestrator;
pub mod patch_format;
pub mod reporting;
pub mod reproducer;
pub mod source;
pub mod submission;
pub mod telemetry;
pub mod verification;

pub use agent::{
    backend_for, AgentBackend, AgentCommand, AgentSupervisor, CopilotCli, ExternalCommand,
    LaunchContext, SupervisorConfig,
};
pub use build_cache::{BuildCache, CacheKey, CacheStats};
pub use builder::{
    BuildRequest, BuilderClient, BuilderService, CommandBuilderService, PovRunRequest,
    RetryPolicy, TestRunRequest,
};
pub use cas::{CasError, Digest};
pub use config::{AgentKind, PatcherConfig, VerificationPolicy};

pub use domain::{
    BuildId, BuildResult, CrashLog, ExecStatus, LogBundle, PatchCandidate, PatcherError, Phase,
    PovVariant, RejectedSubmission, RejectionReason, ReproducedPov, Result, RunResult,
    SessionReport, SessionState, SubmissionRecord, TerminationReason,
};

pub use instructions::Instructions;
pub use orchestrator::Orchestrator;
pub use patch_format::{DiffError, UnifiedDiff};
pub use reporting::{read_run_report, write_run_report, RunOutcome, RunReport};
pub use reproducer::CrashReproducer;
pub use submission::{
    DirectorySink, ForwardReceipt, InPlaceSink, SubmissionSink, SubmissionSlot, SubmissionWatcher,
};
pub use verification::{FailedCheck, Verdict, VerificationReport, Verifier};

pub use obs::run_span;
pub use telemetry::init_tracing;

/// Patcher version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
