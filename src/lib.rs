//! mongo-mirror library.
//!
//! A library for migrating MongoDB collections between deployments and
//! keeping them continuously synchronized.
//!
//! # Features
//!
//! - Bulk copy: checkpointed, resumable initial migration with index
//!   replication
//! - Change capture: change-stream based streaming per collection, with a
//!   timestamp-polling fallback (including deletion detection by sampling)
//! - Idempotent application: at-least-once capture is absorbed by
//!   id-keyed upserts and deletes
//! - Verification: count and content-fingerprint reconciliation that
//!   reports without mutating the target
//!
//! # Structure
//!
//! Database access goes through the [`source::SourceReader`] and
//! [`sink::TargetWriter`] traits; production implementations wrap the
//! MongoDB driver and [`testing`] provides in-memory ones. Durable state
//! lives in the `checkpoint` crate, shared types in `sync-core`.

pub mod apply;
pub mod bulk_copy;
pub mod capture;
pub mod config;
pub mod convert;
pub mod failed;
pub mod sink;
pub mod source;
pub mod testing;
pub mod verify;

// Re-export the core types alongside the engine for convenience.
pub use sync_core::{
    fingerprint, ChangeEvent, ChangeOp, CollectionSpec, CollectionState, Document, DocumentId,
    Fingerprint, ProgressAggregator, ProgressSnapshot, RetryPolicy, SyncError, Value,
};

pub use apply::{ApplyOutcome, ApplyStats, ChangeApplier};
pub use bulk_copy::{BulkCopier, CopyReport};
pub use capture::{
    CaptureConfig, CaptureContext, CaptureWorker, CycleStats, WorkerPool, WorkerState,
};
pub use config::{load_collections, ConnectionOpts, SyncOpts, Threads};
pub use failed::{FailedDocument, FailedDocumentSink};
pub use sink::{MongoTarget, TargetWriter};
pub use source::{ChangeFeed, IndexSpec, MongoSource, SourceReader};
pub use verify::{VerificationResult, Verifier, VerifyOptions, VerifyStatus};
