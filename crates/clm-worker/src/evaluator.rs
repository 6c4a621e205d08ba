//! The evaluation thread.
//!
//! One OS thread owns the rhai engine and the persistent [`Environment`] for
//! the worker's lifetime; `execute` dispatches are serialized through its job
//! queue. Around each submission the environment is restored into a fresh
//! scope and captured back out, so variable persistence is explicit rather
//! than an engine-global.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread::JoinHandle;

use rhai::{Dynamic, Engine, Scope};

use codeloom_core::control::WorkerEvent;
use codeloom_core::manifest::CapabilityManifest;

use crate::WorkerShared;
use crate::bindings;
use crate::environment::Environment;

/// One queued submission.
pub struct EvalJob {
    pub submission_id: u64,
    pub code: String,
    pub working_directory: String,
}

pub struct Evaluator {
    engine: Engine,
    environment: Environment,
    shared: Arc<WorkerShared>,
}

impl Evaluator {
    /// Build an evaluator with the manifest's capabilities bound.
    pub fn new(manifest: &CapabilityManifest, shared: Arc<WorkerShared>) -> Self {
        Self {
            engine: bindings::build_engine(manifest, &shared),
            environment: Environment::default(),
            shared,
        }
    }

    /// Start the evaluation thread and return its job queue.
    ///
    /// The thread exits when the queue's sender side is dropped.
    pub fn spawn(
        manifest: CapabilityManifest,
        shared: Arc<WorkerShared>,
    ) -> (JoinHandle<()>, mpsc::Sender<EvalJob>) {
        let (tx, rx) = mpsc::channel::<EvalJob>();
        let handle = std::thread::Builder::new()
            .name("evaluator".to_string())
            .spawn(move || {
                let mut evaluator = Evaluator::new(&manifest, shared);
                while let Ok(job) = rx.recv() {
                    evaluator.run_submission(job);
                }
            })
            .expect("spawn evaluator thread");
        (handle, tx)
    }

    /// Run one submission to completion, emitting its `exec_result`.
    pub fn run_submission(&mut self, job: EvalJob) {
        let id = job.submission_id;
        self.shared.current.store(id, Ordering::Relaxed);

        // A kill can land while the job is still queued.
        if self.shared.kill.is_killed(id) {
            self.report(id, false, None, Some("submission killed".to_string()));
            return;
        }

        // The process working directory is deliberately global; the evaluator
        // thread serializes submissions, so each one sees its own cwd.
        if !job.working_directory.is_empty() {
            if let Err(e) = std::env::set_current_dir(&job.working_directory) {
                self.report(
                    id,
                    false,
                    None,
                    Some(format!(
                        "cannot enter working directory {}: {e}",
                        job.working_directory
                    )),
                );
                return;
            }
        }

        let mut scope = Scope::new();
        self.environment.restore_into(&mut scope);

        let outcome = self.engine.eval_with_scope::<Dynamic>(&mut scope, &job.code);

        if self.shared.reset_requested.swap(false, Ordering::Relaxed) {
            self.environment.clear();
        } else {
            self.environment = Environment::capture(&scope);
        }

        match outcome {
            Ok(value) => {
                let rendered = if value.is_unit() {
                    None
                } else {
                    Some(value.to_string())
                };
                self.report(id, true, rendered, None);
            }
            Err(err) => {
                self.report(id, false, None, Some(err.to_string()));
            }
        }
    }

    /// Number of persisted variables (test observability).
    pub fn environment_len(&self) -> usize {
        self.environment.len()
    }

    fn report(&self, submission_id: u64, ok: bool, value: Option<String>, error: Option<String>) {
        let _ = self.shared.events.send(WorkerEvent::ExecResult {
            submission_id,
            ok,
            value,
            error,
        });
    }
}
