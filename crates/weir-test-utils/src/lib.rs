//! Shared test utilities for Weir.
//!
//! Provides:
//! - [`TracingMemoryBackend`]: storage that records operations and injects
//!   transient failures
//! - [`fixtures`]: topology builders, notification records and a ready-made
//!   engine harness driven by a manual clock

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::must_use_candidate,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc
)]

pub mod fixtures;
pub mod storage;

pub use fixtures::{object_record, TestContext, TopologyBuilder};
pub use storage::{StorageOp, TracingMemoryBackend};

/// Initializes tracing for tests, honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("weir=debug".parse().expect("directive")),
        )
        .with_test_writer()
        .try_init();
}
