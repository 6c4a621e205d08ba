//! codeloom-worker — the long-lived execution worker.
//!
//! The worker is a single child process of the supervisor. It evaluates
//! user-submitted code fragments in a persistent global environment, with the
//! capability manifest bound as callable functions, and talks to the
//! supervisor over its own stdio (newline-delimited JSON control messages).
//!
//! Layout:
//!
//! - [`runtime`]    — the control-channel loop (commands in, events out)
//! - [`evaluator`]  — the rhai engine on its dedicated thread
//! - [`bindings`]   — manifest → rhai functions, argument assembly, aliasing
//! - [`environment`] — the persistent name-to-value record
//! - [`bridge`]     — capability-call correlation with the supervisor
//! - [`stdin`]      — per-submission stdin queues
//! - [`kill`]       — cooperative kill flags

pub mod bindings;
pub mod bridge;
pub mod environment;
pub mod evaluator;
pub mod kill;
pub mod runtime;
pub mod stdin;

use std::sync::atomic::{AtomicBool, AtomicU64};
use tokio::sync::mpsc::UnboundedSender;

use codeloom_core::control::WorkerEvent;

/// State shared between the control loop and the evaluator thread.
pub struct WorkerShared {
    /// Capability-call correlation.
    pub bridge: bridge::CapabilityBridge,
    /// Per-submission stdin queues.
    pub stdin: stdin::StdinQueues,
    /// Cooperative kill flags.
    pub kill: kill::KillFlags,
    /// Id of the submission the evaluator is currently running.
    pub current: AtomicU64,
    /// Set by the `reset` primitive; consumed after the submission completes.
    pub reset_requested: AtomicBool,
    /// Outbound event channel to the control loop.
    pub events: UnboundedSender<WorkerEvent>,
}

impl WorkerShared {
    pub fn new(events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            bridge: bridge::CapabilityBridge::new(events.clone()),
            stdin: stdin::StdinQueues::default(),
            kill: kill::KillFlags::default(),
            current: AtomicU64::new(0),
            reset_requested: AtomicBool::new(false),
            events,
        }
    }
}
