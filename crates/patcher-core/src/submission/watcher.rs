//! Output directory watcher.
//!
//! Polls the patches directory for `*.diff` files. A file becomes a
//! candidate once its size and mtime have not changed between two polls.
//! An accepted or late file is considered once; a malformed one is looked
//! at again only after it changes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::slot::SubmissionSlot;
use crate::domain::{PatchCandidate, RejectedSubmission, RejectionReason, SubmissionRecord};
use crate::obs;
use crate::patch_format::UnifiedDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    len: u64,
    modified: SystemTime,
}

pub struct SubmissionWatcher {
    dir: PathBuf,
    slot: Arc<SubmissionSlot>,
    interval: Duration,
    /// Cancelled on the first acceptance.
    submitted: CancellationToken,
    last_seen: HashMap<PathBuf, Observation>,
    /// Accepted or rejected late.
    settled: HashSet<PathBuf>,
    /// Rejected as malformed, with the state that was rejected.
    malformed: HashMap<PathBuf, Observation>,
}

impl SubmissionWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        slot: Arc<SubmissionSlot>,
        interval: Duration,
        submitted: CancellationToken,
    ) -> Self {
        Self {
            dir: dir.into(),
            slot,
            interval,
            submitted,
            last_seen: HashMap::new(),
            settled: HashSet::new(),
            malformed: HashMap::new(),
        }
    }

    /// Poll until `shutdown` is cancelled, then sweep whatever is left.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
        self.sweep().await;
    }

    /// One poll: process every diff that was stable since the last poll.
    pub async fn poll_once(&mut self) {
        let current = self.scan().await;
        let mut ready: Vec<(SystemTime, PathBuf, Observation)> = current
            .iter()
            .filter(|(path, seen)| seen.len > 0 && self.last_seen.get(*path) == Some(*seen))
            .map(|(path, seen)| (seen.modified, path.clone(), *seen))
            .collect();
        ready.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        self.last_seen = current;

        for (_, path, seen) in ready {
            self.consider(&path, seen).await;
        }
    }

    /// Process all remaining diffs regardless of stability.
    pub async fn sweep(&mut self) {
        let mut remaining: Vec<(SystemTime, PathBuf, Observation)> = self
            .scan()
            .await
            .into_iter()
            .map(|(path, seen)| (seen.modified, path, seen))
            .collect();
        remaining.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        for (_, path, seen) in remaining {
            self.consider(&path, seen).await;
        }
    }

    /// Diff files not yet settled, minus malformed ones that have not changed.
    async fn scan(&self) -> HashMap<PathBuf, Observation> {
        let mut found = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(event = "submission.scan_failed", dir = %self.dir.display(), error = %e);
                }
                return found;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_diff_name(&entry.file_name().to_string_lossy()) || self.settled.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let seen = Observation {
                len: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            };
            if self.malformed.get(&path) == Some(&seen) {
                continue;
            }
            found.insert(path, seen);
        }
        found
    }

    async fn consider(&mut self, path: &Path, seen: Observation) {
        if self.settled.contains(path) || self.malformed.get(path) == Some(&seen) {
            return;
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.reject_malformed(path, seen, format!("unreadable: {e}"));
                return;
            }
        };

        let diff = match UnifiedDiff::parse_bytes(&bytes) {
            Ok(diff) => diff,
            Err(e) => {
                self.reject_malformed(path, seen, e.to_string());
                return;
            }
        };

        self.malformed.remove(path);
        self.settled.insert(path.to_path_buf());
        let record = SubmissionRecord {
            candidate: PatchCandidate::new(bytes),
            source_path: path.to_path_buf(),
            files_changed: diff.files_changed(),
            accepted_at: Utc::now(),
        };
        let digest = record.candidate.digest();
        let files_changed = record.files_changed;

        match self.slot.try_accept(record) {
            Ok(()) => {
                obs::emit_submission_accepted(&digest, &path.display().to_string(), files_changed);
                self.submitted.cancel();
            }
            Err(_) => self.reject(path, RejectionReason::Late),
        }
    }

    fn reject_malformed(&mut self, path: &Path, seen: Observation, message: String) {
        self.malformed.insert(path.to_path_buf(), seen);
        self.reject(path, RejectionReason::Malformed(message));
    }

    fn reject(&self, path: &Path, reason: RejectionReason) {
        let detail = match &reason {
            RejectionReason::Late => "late".to_string(),
            RejectionReason::Malformed(msg) => format!("malformed: {msg}"),
        };
        obs::emit_submission_rejected(&path.display().to_string(), &detail);
        debug!(event = "submission.slot_state", sealed = self.slot.is_sealed());
        self.slot.reject(RejectedSubmission {
            path: path.to_path_buf(),
            reason,
            rejected_at: Utc::now(),
        });
    }
}

fn is_diff_name(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(".diff")
}
