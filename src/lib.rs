#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod action;
mod core;
mod engine;
mod error;
mod graph;
mod resolver;
mod store;
mod task;

pub use crate::action::{Action, Outcome};
pub use crate::core::{Fingerprint, Hash32};
pub use crate::engine::Controller;
pub use crate::error::*;
pub use crate::store::DigestStore;
pub use crate::task::{Registry, Task};

/// Installs a `tracing` subscriber reading its filter from the
/// `RUST_LOG` environment variable. Purely a convenience for binaries
/// embedding the engine; libraries should leave subscribers alone.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
