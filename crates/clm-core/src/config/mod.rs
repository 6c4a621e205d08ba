//! Configuration for the codeloom supervisor.
//!
//! Split into [`types`] (the deserialized shape and its defaults) and
//! [`discovery`] (locating and loading `config.json`).

pub mod discovery;
pub mod types;

pub use discovery::{candidate_paths, load};
pub use types::{Config, ServerSpec, RESERVED_SERVER_NAME};
