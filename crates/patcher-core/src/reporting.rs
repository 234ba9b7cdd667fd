use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::build_cache::CacheStats;
use crate::config::VerificationPolicy;
use crate::domain::{
    Phase, RejectedSubmission, ReproducedPov, SessionReport, SessionState, SubmissionRecord,
};
use crate::submission::ForwardReceipt;
use crate::verification::VerificationReport;

pub const RUN_REPORT_SCHEMA: &str = "pov-patcher.run-report/v1";

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    /// The patch was forwarded. `verification` is absent when the policy is off.
    Submitted {
        record: SubmissionRecord,
        verification: Option<VerificationReport>,
    },
    /// Verification disagreed under `block`; nothing was forwarded.
    VerificationBlocked {
        record: SubmissionRecord,
        verification: VerificationReport,
    },
    NoPatch {
        session_state: SessionState,
    },
    NoPovs,
    /// The run stopped on an error before reaching an outcome.
    Failed {
        phase: Phase,
        message: String,
    },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Submitted { .. } => "submitted",
            RunOutcome::VerificationBlocked { .. } => "verification_blocked",
            RunOutcome::NoPatch { .. } => "no_patch",
            RunOutcome::NoPovs => "no_povs",
            RunOutcome::Failed { .. } => "failed",
        }
    }

    /// Process exit code for `patcherd run`.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Submitted { .. } | RunOutcome::NoPovs => 0,
            RunOutcome::NoPatch { .. } => 3,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::VerificationBlocked { .. } => 4,
        }
    }

    pub fn record(&self) -> Option<&SubmissionRecord> {
        match self {
            RunOutcome::Submitted { record, .. } | RunOutcome::VerificationBlocked { record, .. } => {
                Some(record)
            }
            _ => None,
        }
    }

    /// An accepted patch the confirmatory pass did not confirm.
    pub fn has_verification_mismatch(&self) -> bool {
        match self {
            RunOutcome::Submitted {
                verification: Some(v),
                ..
            }
            | RunOutcome::VerificationBlocked {
                verification: v, ..
            } => v.is_mismatch(),
            _ => false,
        }
    }
}

/// Canonical run artifact written to `<work>/run_report.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub target: String,
    pub harness: String,
    pub builder_module: String,
    pub agent: String,
    pub verify: VerificationPolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub povs: Vec<ReproducedPov>,
    pub session: Option<SessionReport>,
    pub rejected: Vec<RejectedSubmission>,
    pub forwarded: Option<ForwardReceipt>,
    pub build_cache: CacheStats,
}

impl RunReport {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Write run_report.json in pretty JSON format.
pub fn write_run_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

pub fn read_run_report(path: &Path) -> Result<RunReport> {
    let content = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("parse {:?}", path))
}
