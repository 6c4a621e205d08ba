//! codeloom-worker — long-lived execution worker for the codeloom supervisor.
//!
//! Spawned once by the supervisor; speaks the worker control protocol on its
//! own stdio. Not intended to be run by hand.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    codeloom_core::logging::init();
    codeloom_worker::runtime::run(tokio::io::stdin(), tokio::io::stdout()).await
}
