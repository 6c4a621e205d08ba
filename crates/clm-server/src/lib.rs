//! codeloom-server — the execution supervisor.
//!
//! The supervisor multiplexes three worlds:
//!
//! - the client tool-server protocol on its own stdio ([`service`])
//! - a fleet of downstream tool-server subprocesses ([`downstream`],
//!   [`registry`]), whose aggregated catalog the [`binder`] turns into the
//!   worker's capability manifest
//! - a single long-lived execution worker child process ([`worker_link`]),
//!   driven by the [`supervisor`] actor which owns the submission registry
//!   ([`submission`])

pub mod binder;
pub mod cli;
pub mod commands;
pub mod downstream;
pub mod registry;
pub mod service;
pub mod submission;
pub mod supervisor;
pub mod worker_link;

pub use worker_link::{MockWorkerHandle, MockWorkerTransport};
