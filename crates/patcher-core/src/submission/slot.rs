//! Single-assignment submission slot.

use std::sync::{Mutex, OnceLock};

use crate::domain::{RejectedSubmission, SubmissionRecord};

/// Holds the one accepted submission of a run plus every rejection.
///
/// The first `try_accept` wins; the slot is sealed from then on.
#[derive(Debug, Default)]
pub struct SubmissionSlot {
    record: OnceLock<SubmissionRecord>,
    rejected: Mutex<Vec<RejectedSubmission>>,
}

impl SubmissionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `record` if the slot is empty. A sealed slot hands the
    /// candidate back unchanged.
    pub fn try_accept(&self, record: SubmissionRecord) -> Result<(), SubmissionRecord> {
        self.record.set(record)
    }

    pub fn get(&self) -> Option<&SubmissionRecord> {
        self.record.get()
    }

    pub fn is_sealed(&self) -> bool {
        self.record.get().is_some()
    }

    pub fn reject(&self, rejection: RejectedSubmission) {
        self.rejected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(rejection);
    }

    pub fn rejected(&self) -> Vec<RejectedSubmission> {
        self.rejected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
