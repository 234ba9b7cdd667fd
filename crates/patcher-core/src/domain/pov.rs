//! POV variants and their crash logs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::{BuildId, ExecStatus};

/// One crash-triggering input. Variants in a batch share a root cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PovVariant {
    /// Stable identifier, unique within the batch (derived from the file stem).
    pub id: String,
    pub path: PathBuf,
    pub harness: String,
}

impl PovVariant {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, harness: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            harness: harness.into(),
        }
    }

    /// Build variants from sorted POV file paths, disambiguating repeated stems.
    pub fn from_paths(paths: &[PathBuf], harness: &str) -> Vec<PovVariant> {
        let mut seen = std::collections::HashSet::new();
        paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let stem = file_stem(path);
                let id = if seen.insert(stem.clone()) {
                    stem
                } else {
                    format!("{stem}-{i}")
                };
                PovVariant::new(id, path.clone(), harness)
            })
            .collect()
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "pov".to_string())
}

/// Captured output of replaying one variant against one build. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashLog {
    pub variant_id: String,
    pub build_id: BuildId,
    /// `None` when no replay was attempted or the builder failed.
    pub status: Option<ExecStatus>,
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

impl CrashLog {
    /// Whether the replay actually crashed the build.
    pub fn reproduced(&self) -> bool {
        matches!(self.status, Some(ExecStatus::Failure(_)))
    }
}

/// A variant after base reproduction, ready to hand to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproducedPov {
    pub variant: PovVariant,
    pub crash_log: CrashLog,
    /// Where the crash log was persisted for the agent.
    pub crash_log_path: PathBuf,
    /// Set for variants that did not crash `base`; they stay in the batch.
    pub annotation: Option<String>,
}

impl ReproducedPov {
    pub fn is_anomalous(&self) -> bool {
        self.annotation.is_some()
    }
}
