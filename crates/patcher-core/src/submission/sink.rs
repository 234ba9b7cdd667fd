//! Forwarding of the accepted patch to the framework.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::domain::{PatcherError, Result, SubmissionRecord};

/// Where a forwarded patch ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardReceipt {
    pub sink: String,
    /// `None` when the sink did not copy anything.
    pub path: Option<PathBuf>,
}

/// Final hand-off of the accepted patch. Each sink forwards at most once.
pub trait SubmissionSink: Send + Sync {
    fn name(&self) -> &str;

    fn forward(&self, record: &SubmissionRecord) -> Result<ForwardReceipt>;

    /// Put a watched file the framework must not submit out of its reach.
    /// Returns where it went, or `None` when nothing needed to move.
    fn withhold(&self, path: &Path) -> Result<Option<PathBuf>> {
        let _ = path;
        Ok(None)
    }
}

/// The watched directory already is the framework's submit directory, so
/// forwarding leaves the patch where it is and withheld files are moved
/// into `withheld_dir`.
#[derive(Debug)]
pub struct InPlaceSink {
    withheld_dir: PathBuf,
    forwarded: AtomicBool,
}

impl InPlaceSink {
    pub fn new(withheld_dir: impl Into<PathBuf>) -> Self {
        Self {
            withheld_dir: withheld_dir.into(),
            forwarded: AtomicBool::new(false),
        }
    }
}

impl SubmissionSink for InPlaceSink {
    fn name(&self) -> &str {
        "in_place"
    }

    fn withhold(&self, path: &Path) -> Result<Option<PathBuf>> {
        if !path.is_file() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.withheld_dir)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "submission".to_string());

        // Never ends in `.diff`.
        let mut target = self.withheld_dir.join(format!("{name}.withheld"));
        let mut n = 1;
        while target.exists() {
            target = self.withheld_dir.join(format!("{name}.{n}.withheld"));
            n += 1;
        }
        std::fs::rename(path, &target)?;
        info!(event = "submission.withheld", from = %path.display(), to = %target.display());
        Ok(Some(target))
    }

    fn forward(&self, record: &SubmissionRecord) -> Result<ForwardReceipt> {
        if self.forwarded.swap(true, Ordering::SeqCst) {
            return Err(PatcherError::AlreadyForwarded(
                record.candidate.digest().short(),
            ));
        }
        Ok(ForwardReceipt {
            sink: self.name().to_string(),
            path: None,
        })
    }
}

/// Copies the patch into a separate submit directory as `<digest>.diff`.
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
    forwarded: AtomicBool,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            forwarded: AtomicBool::new(false),
        }
    }
}

impl SubmissionSink for DirectorySink {
    fn name(&self) -> &str {
        "directory"
    }

    fn forward(&self, record: &SubmissionRecord) -> Result<ForwardReceipt> {
        let short = record.candidate.digest().short();
        if self.forwarded.swap(true, Ordering::SeqCst) {
            return Err(PatcherError::AlreadyForwarded(short));
        }

        std::fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(format!("{short}.diff"));

        // Written under a hidden temp name so framework watchers never see
        // a partial file.
        let mut tmp = NamedTempFile::with_prefix_in(".forward-", &self.dir)?;
        tmp.write_all(record.candidate.bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&target).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                PatcherError::AlreadyForwarded(short.clone())
            } else {
                PatcherError::Io(e.error)
            }
        })?;

        info!(event = "submission.forwarded", path = %target.display());
        Ok(ForwardReceipt {
            sink: self.name().to_string(),
            path: Some(target),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PatchCandidate;
    use chrono::Utc;

    fn record() -> SubmissionRecord {
        SubmissionRecord {
            candidate: PatchCandidate::new(b"--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n".to_vec()),
            source_path: PathBuf::from("/patches/fix.diff"),
            files_changed: 1,
            accepted_at: Utc::now(),
        }
    }

    #[test]
    fn directory_sink_copies_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let rec = record();

        let receipt = sink.forward(&rec).unwrap();
        let path = receipt.path.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), rec.candidate.bytes());

        let err = sink.forward(&rec).unwrap_err();
        assert!(matches!(err, PatcherError::AlreadyForwarded(_)));

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn existing_target_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record();
        DirectorySink::new(dir.path()).forward(&rec).unwrap();
        let err = DirectorySink::new(dir.path()).forward(&rec).unwrap_err();
        assert!(matches!(err, PatcherError::AlreadyForwarded(_)));
    }

    #[test]
    fn in_place_sink_forwards_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InPlaceSink::new(dir.path().join("withheld"));
        assert_eq!(sink.forward(&record()).unwrap().path, None);
        assert!(sink.forward(&record()).is_err());
    }

    #[test]
    fn in_place_sink_moves_withheld_files_out_of_the_submit_dir() {
        let dir = tempfile::tempdir().unwrap();
        let submit = dir.path().join("patches");
        std::fs::create_dir_all(&submit).unwrap();
        let sink = InPlaceSink::new(dir.path().join("withheld"));

        for _ in 0..2 {
            std::fs::write(submit.join("b.diff"), "late").unwrap();
            let moved = sink.withhold(&submit.join("b.diff")).unwrap().unwrap();
            assert!(!moved.to_string_lossy().ends_with(".diff"));
            assert_eq!(std::fs::read_to_string(&moved).unwrap(), "late");
        }
        assert_eq!(std::fs::read_dir(&submit).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("withheld")).unwrap().count(), 2);
        assert_eq!(sink.withhold(&submit.join("gone.diff")).unwrap(), None);
    }

    #[test]
    fn directory_sink_leaves_watched_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("b.diff");
        std::fs::write(&file, "late").unwrap();
        let sink = DirectorySink::new(dir.path().join("forward"));
        assert_eq!(sink.withhold(&file).unwrap(), None);
        assert!(file.exists());
    }
}
