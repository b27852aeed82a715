//! Core types for the mongo-mirror sync engine.
//!
//! This crate provides the foundational types used across the engine:
//!
//! - [`Value`] / [`Document`] / [`DocumentId`] - schemaless document model
//! - [`ChangeEvent`] / [`ChangeOp`] - change capture events
//! - [`CollectionSpec`] - per-collection replication configuration
//! - [`Fingerprint`] - canonical content hashes for reconciliation
//! - [`SyncError`] - error taxonomy shared by all components
//! - [`RetryPolicy`] - exponential backoff discipline
//! - [`ProgressAggregator`] - process-wide per-collection counters
//!
//! # Architecture
//!
//! The sync-core crate sits at the foundation of the engine:
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── checkpoint      (persists cursors keyed by DocumentId)
//!    │
//!    └─── mongo-mirror    (bulk copier, capture workers, applier, verifier)
//! ```

pub mod change;
pub mod error;
pub mod fingerprint;
pub mod progress;
pub mod retry;
pub mod values;

// Re-exports for convenience
pub use change::{ChangeEvent, ChangeOp, CollectionSpec};
pub use error::SyncError;
pub use fingerprint::{fingerprint, Fingerprint};
pub use progress::{CollectionState, ProgressAggregator, ProgressSnapshot};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use values::{Document, DocumentId, Value, MODIFIED_AT_FIELD};
