//! # weir-core
//!
//! Shared primitives for the Weir dataflow completion engine.
//!
//! - **Identifiers**: validated names for boundaries, arcs, lots and events
//! - **Storage**: the conditional-write contract all engine state relies on
//! - **Storage keys**: typed paths for every persisted record
//! - **Clock**: injectable time for leases and quiescence windows
//! - **Observability**: logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use weir_core::prelude::*;
//!
//! let boundary = BoundaryId::new("raw").unwrap();
//! let lot = LotKey::new("2024-01-01").unwrap();
//! let key = ManifestKey::lot(&boundary, &lot);
//! assert!(key.path().starts_with("manifests/raw/"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod id;
pub mod observability;
pub mod storage;
pub mod storage_keys;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::id::{ArcId, BoundaryId, EventId, LeaseToken, LotKey};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, Versioned, WritePrecondition, WriteResult,
    };
    pub use crate::storage_keys::{
        ConsumptionKey, DispatchKey, EventMarkerKey, FailedDispatchKey, LotStateKey, ManifestKey,
        ObservedObjectKey, StorageKey,
    };
}

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{ArcId, BoundaryId, EventId, LeaseToken, LotKey};
pub use storage::{MemoryBackend, StorageBackend, WritePrecondition, WriteResult};
