//! Accepted and rejected submissions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::patch::PatchCandidate;

/// The single patch accepted from the output directory in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub candidate: PatchCandidate,
    pub source_path: PathBuf,
    /// Number of files the diff touches.
    pub files_changed: usize,
    pub accepted_at: DateTime<Utc>,
}

/// Why a diff file was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum RejectionReason {
    /// Another submission already sealed the slot.
    Late,
    /// Empty or not a unified diff. Does not consume the slot.
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedSubmission {
    pub path: PathBuf,
    pub reason: RejectionReason,
    pub rejected_at: DateTime<Utc>,
}
