//! # weir-flow
//!
//! Completion and triggering engine for Weir dataflows.
//!
//! Object-created notifications land on **boundaries**. The engine groups
//! them into **lots**, decides when a lot is complete, writes a single
//! **manifest** for it, and triggers every downstream **arc** exactly once
//! per lot, over a substrate that redelivers, reorders and partially fails.
//!
//! ## Components
//!
//! - **Normalizer** ([`event`]): raw payloads to canonical object events
//! - **Lot resolver** ([`resolver`]): object events to `(boundary, lot)`
//! - **Completion tracker** ([`tracker`]): accumulates objects, evaluates
//!   [`policy::CompletenessPolicy`]
//! - **Manifest store** ([`manifest`]): write-once manifests and consumption
//!   records, the single point of truth
//! - **Arc trigger dispatcher** ([`dispatch`]): one trigger per arc and lot
//! - **Lease layer** ([`lease`]): at most one in-flight attempt per arc and lot
//! - **Engine** ([`engine`]): batch processing, arc completion and periodic
//!   sweeps
//!
//! ## Guarantees
//!
//! - **No global lock**: safety comes from conditional writes only
//! - **Order independent**: duplicates and reordering never change a verdict
//! - **Never silent**: a completion is dispatched, retried, or recorded as
//!   failed for operators
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use weir_core::storage::MemoryBackend;
//! use weir_flow::dispatch::memory::InMemoryTriggerTarget;
//! use weir_flow::topology::{Topology, TopologyDecl};
//! use weir_flow::{Engine, Result};
//!
//! # async fn run() -> Result<()> {
//! let decl = TopologyDecl::from_yaml_str(
//!     "boundaries:\n  - id: raw\n    path_pattern: raw/{date}\n    completeness_policy: { kind: count, count: 2 }\n",
//! )?;
//! let engine = Engine::builder(
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(Topology::load(&decl)?),
//!     Arc::new(InMemoryTriggerTarget::default()),
//! )
//! .build()?;
//!
//! let report = engine.process_payload(br#"[{"boundary_id":"raw","path":"raw/2024-01-01/a.csv","size":1,"event_time":"2024-01-01T00:00:00Z","event_id":"e1"}]"#).await?;
//! assert_eq!(report.count("pending"), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod interval;
pub mod lease;
pub mod lot;
pub mod manifest;
pub mod metrics;
pub mod pattern;
pub mod policy;
pub mod resolver;
pub mod retry;
pub mod topology;
pub mod tracker;

pub use config::EngineConfig;
pub use engine::{
    ArcCompletion, ArcState, BatchReport, Engine, EngineBuilder, EventOutcome, SinkOutput,
    SweepReport,
};
pub use error::{Error, Result};
pub use lease::{AcquireResult, Lease, LeaseLayer};
pub use manifest::{CompletionResult, ConsumptionResult, ManifestRecord, ManifestStore};
