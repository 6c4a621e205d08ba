//! Capability-call correlation between the evaluator thread and the
//! supervisor.
//!
//! A capability invocation from user code sends a `capability_call` event to
//! the supervisor and blocks the evaluator thread until the correlated
//! `capability_reply` arrives. The reply sender is installed in the pending
//! table *before* the event is transmitted, so a fast reply can never race
//! past its waiter. Waits poll the kill flag so a killed submission abandons
//! its call at the next boundary; the orphaned reply is dropped on arrival.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use codeloom_core::control::WorkerEvent;

use crate::kill::KillFlags;

/// How often a blocked capability wait re-checks the kill flag.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct CapabilityBridge {
    next_call_id: AtomicU64,
    pending: Mutex<HashMap<u64, mpsc::Sender<Result<Value, String>>>>,
    events: UnboundedSender<WorkerEvent>,
}

impl CapabilityBridge {
    pub fn new(events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            next_call_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Issue one capability call and block until its reply, an error, or a
    /// kill.
    ///
    /// # Errors
    ///
    /// Returns the textual failure of the invocable: a downstream error
    /// relayed by the supervisor, a closed control channel, or a kill
    /// observed while waiting.
    pub fn call(
        &self,
        kill: &KillFlags,
        submission_id: u64,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, String> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(call_id, tx);

        let sent = self.events.send(WorkerEvent::CapabilityCall {
            call_id,
            submission_id,
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
        });
        if sent.is_err() {
            self.remove(call_id);
            return Err("control channel closed".to_string());
        }

        loop {
            if kill.is_killed(submission_id) {
                self.remove(call_id);
                return Err("submission killed".to_string());
            }
            match rx.recv_timeout(KILL_POLL_INTERVAL) {
                Ok(outcome) => return outcome,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err("control channel closed".to_string());
                }
            }
        }
    }

    /// Deliver a reply for an outstanding call. Unknown ids (an abandoned
    /// call's late reply) are dropped.
    pub fn resolve(&self, call_id: u64, outcome: Result<Value, String>) {
        if let Some(tx) = self.remove(call_id) {
            let _ = tx.send(outcome);
        }
    }

    fn remove(&self, call_id: u64) -> Option<mpsc::Sender<Result<Value, String>>> {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(&call_id)
    }
}
