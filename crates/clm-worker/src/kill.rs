//! Cooperative kill flags.
//!
//! A kill is a flag, not an interruption: user code observes it at capability
//! call boundaries, inside blocking primitives (`read_stdin`, `sleep`), and
//! through the evaluator's progress hook. Flags stay set for the worker's
//! lifetime so a late-starting submission that was killed while queued
//! terminates immediately.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct KillFlags {
    killed: Mutex<HashSet<u64>>,
}

impl KillFlags {
    /// Mark one submission killed.
    pub fn kill(&self, submission_id: u64) {
        self.killed
            .lock()
            .expect("kill flag lock poisoned")
            .insert(submission_id);
    }

    /// Whether the submission has been killed.
    pub fn is_killed(&self, submission_id: u64) -> bool {
        self.killed
            .lock()
            .expect("kill flag lock poisoned")
            .contains(&submission_id)
    }
}
