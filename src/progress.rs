//! Job states, progress events and cooperative cancellation.
//!
//! Background jobs never touch caller state. Everything they report travels
//! as an immutable [`JobEvent`] over an unbounded Tokio channel, and the
//! only thing a caller can push back is a [`CancelFlag`].
//!
//! # Why a channel instead of callbacks?
//!
//! A UI (or the CLI's progress bar) owns its state on one thread and wants
//! to drain updates at its own pace. A channel gives it exactly that, and a
//! slow consumer can never stall the pipeline because sending is
//! non-blocking.
//!
//! # Example
//!
//! ```rust
//! use fichegen::{CancelFlag, JobState};
//!
//! let flag = CancelFlag::new();
//! let for_worker = flag.clone();
//! flag.cancel();
//! assert!(for_worker.is_cancelled());
//! assert_eq!(JobState::Generating.label(), "Generating lesson content");
//! ```

use crate::document::DocumentTree;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Lifecycle of one pipeline job, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum JobState {
    Queued,
    ExtractingGuides,
    Generating,
    BuildingDocument,
    Illustrating,
    Rendering,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Human-readable stage label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::ExtractingGuides => "Indexing guides",
            Self::Generating => "Generating lesson content",
            Self::BuildingDocument => "Building document",
            Self::Illustrating => "Generating illustrations",
            Self::Rendering => "Rendering outputs",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Process-unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl JobId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Shared cancellation request, checked between stages and before each
/// external call. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        tree: DocumentTree,
        /// Files written by the renderers.
        outputs: Vec<PathBuf>,
    },
    Failed {
        /// Stage that raised the error.
        stage: JobState,
        cause: String,
    },
    Cancelled {
        /// Last stage that completed before the flag was observed.
        after: JobState,
    },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Completed { .. } => JobState::Completed,
            Self::Failed { .. } => JobState::Failed,
            Self::Cancelled { .. } => JobState::Cancelled,
        }
    }
}

/// Message sent from a running job to its observer.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Sent after every state transition.
    Progress {
        job: JobId,
        state: JobState,
        label: String,
    },
    /// A guide could not be indexed and was left out of the prompt.
    GuideSkipped {
        job: JobId,
        path: PathBuf,
        reason: String,
    },
    /// Informational detail within a stage (excerpt count, model used…).
    Detail { job: JobId, message: String },
    /// Last event of every job.
    Finished { job: JobId, outcome: JobOutcome },
}

pub type EventSender = mpsc::UnboundedSender<JobEvent>;

/// Stream of a job's events, ending after `Finished`.
pub type JobEvents = UnboundedReceiverStream<JobEvent>;

/// Create a connected event sender and stream.
pub fn event_channel() -> (EventSender, JobEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}

/// Sends events for one job; a dropped receiver is not an error.
#[derive(Debug, Clone)]
pub struct Reporter {
    job: JobId,
    tx: EventSender,
}

impl Reporter {
    pub fn new(job: JobId, tx: EventSender) -> Self {
        Self { job, tx }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn state(&self, state: JobState) {
        let _ = self.tx.send(JobEvent::Progress {
            job: self.job,
            state,
            label: state.label().to_string(),
        });
    }

    pub fn guide_skipped(&self, path: PathBuf, reason: String) {
        let _ = self.tx.send(JobEvent::GuideSkipped {
            job: self.job,
            path,
            reason,
        });
    }

    pub fn detail(&self, message: impl Into<String>) {
        let _ = self.tx.send(JobEvent::Detail {
            job: self.job,
            message: message.into(),
        });
    }

    pub fn finished(&self, outcome: JobOutcome) {
        let _ = self.tx.send(JobEvent::Finished {
            job: self.job,
            outcome,
        });
    }
}
