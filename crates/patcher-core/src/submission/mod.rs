//! Exactly-once patch submission.
//!
//! The agent writes `*.diff` files into the patches directory. The
//! [`SubmissionWatcher`] validates them and records the first valid one in
//! the [`SubmissionSlot`]; after the run the orchestrator hands the record
//! to a [`SubmissionSink`].

pub mod sink;
pub mod slot;
pub mod watcher;

pub use sink::{DirectorySink, ForwardReceipt, InPlaceSink, SubmissionSink};
pub use slot::SubmissionSlot;
pub use watcher::SubmissionWatcher;
