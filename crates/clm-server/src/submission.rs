//! The submission registry.
//!
//! A submission is the unit of work: one `execute` request carrying user
//! code. The registry keeps two partitions: `active` (states `running` and
//! `async`) and `finished` (terminal states, retained in memory for the
//! supervisor's lifetime so history stays queryable). Ids are allocated from
//! a monotonically increasing counter.
//!
//! Only the supervisor actor mutates the registry; everything else submits
//! intents over its channel.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use codeloom_core::control::OutputStream;

/// Lifecycle state of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    /// Evaluating, with a synchronous waiter attached (until handover).
    Running,
    /// Evaluating in the background after handover.
    Async,
    /// Terminated normally (with or without an evaluation error).
    Completed,
    /// Terminated by a kill request or a worker transport failure.
    Killed,
}

impl SubmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionState::Completed | SubmissionState::Killed)
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionState::Running => write!(f, "running"),
            SubmissionState::Async => write!(f, "async"),
            SubmissionState::Completed => write!(f, "completed"),
            SubmissionState::Killed => write!(f, "killed"),
        }
    }
}

/// One captured line of user-code output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub text: String,
}

/// The outcome delivered to a submission's synchronous waiter. Exactly one
/// arrives: handover and natural completion are mutually exclusive.
#[derive(Debug)]
pub enum ExecOutcome {
    /// The fragment terminated while the waiter was still attached.
    Completed {
        ok: bool,
        value: Option<String>,
        error: Option<String>,
        output: Vec<OutputEntry>,
    },
    /// The handover interval elapsed first; the snapshot carries everything
    /// emitted before the handover instant, in order.
    HandedOver { id: u64, snapshot: Vec<OutputEntry> },
    /// A kill request won.
    Killed { id: u64 },
}

/// One submission.
pub struct Submission {
    pub id: u64,
    pub code: String,
    pub working_directory: PathBuf,
    pub state: SubmissionState,
    pub start_time: DateTime<Utc>,
    pub async_start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    /// Append-only while non-terminal; cleared exactly once, at handover.
    pub output_history: Vec<OutputEntry>,
    pub killed_flag: bool,
    pub completion_error: Option<String>,
    /// Rendered terminal value on successful completion.
    pub value: Option<String>,
    /// Set once stdin data has met a blocked reader.
    pub interactive: bool,
    /// Synchronous waiter, present until the first outcome is delivered or
    /// the wait is cancelled.
    pub(crate) waiter: Option<oneshot::Sender<ExecOutcome>>,
    /// The armed handover timer. At most one per running submission.
    pub(crate) handover_timer: Option<AbortHandle>,
}

impl Submission {
    pub fn summary(&self) -> SubmissionSummary {
        let end = self.completion_time.unwrap_or_else(Utc::now);
        SubmissionSummary {
            id: self.id,
            state: self.state,
            started_at: self.start_time,
            duration_secs: (end - self.start_time).num_seconds().max(0) as u64,
            output_lines: self.output_history.len(),
            interactive: self.interactive,
            completed: self.state.is_terminal(),
        }
    }
}

/// Serializable summary used by `list_async_executions` and the periodic
/// report.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionSummary {
    pub id: u64,
    pub state: SubmissionState,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub output_lines: usize,
    pub interactive: bool,
    pub completed: bool,
}

/// The two-partition registry owned by the supervisor actor.
#[derive(Default)]
pub struct SubmissionRegistry {
    next_id: u64,
    active: HashMap<u64, Submission>,
    finished: HashMap<u64, Submission>,
}

impl SubmissionRegistry {
    /// Create a new running submission and return its id.
    pub fn create(
        &mut self,
        code: String,
        working_directory: PathBuf,
        waiter: oneshot::Sender<ExecOutcome>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(
            id,
            Submission {
                id,
                code,
                working_directory,
                state: SubmissionState::Running,
                start_time: Utc::now(),
                async_start_time: None,
                completion_time: None,
                output_history: Vec::new(),
                killed_flag: false,
                completion_error: None,
                value: None,
                interactive: false,
                waiter: Some(waiter),
                handover_timer: None,
            },
        );
        id
    }

    pub fn get(&self, id: u64) -> Option<&Submission> {
        self.active.get(&id).or_else(|| self.finished.get(&id))
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Submission> {
        if self.active.contains_key(&id) {
            self.active.get_mut(&id)
        } else {
            self.finished.get_mut(&id)
        }
    }

    pub fn get_active_mut(&mut self, id: u64) -> Option<&mut Submission> {
        self.active.get_mut(&id)
    }

    /// Remove a submission from the active partition (for terminal
    /// transitions).
    pub fn take_active(&mut self, id: u64) -> Option<Submission> {
        self.active.remove(&id)
    }

    /// Park a terminal submission in the finished partition.
    pub fn finish(&mut self, submission: Submission) {
        debug_assert!(submission.state.is_terminal());
        self.finished.insert(submission.id, submission);
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Summaries of every non-terminal submission, ordered by id.
    pub fn active_summaries(&self) -> Vec<SubmissionSummary> {
        let mut summaries: Vec<SubmissionSummary> =
            self.active.values().map(Submission::summary).collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }
}
