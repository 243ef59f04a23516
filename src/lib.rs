//! # mutalog - Durable Mutation Queue
//!
//! mutalog is the durable write log of an offline-capable document-sync
//! client. Local writes are queued as ordered *mutation batches* that survive
//! restarts, get replayed against a backend when it is reachable, and are
//! garbage-collected once acknowledged and no longer needed locally.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            AsyncPersistence / AutocommitQueue                   │
//! │        (one transaction per call, or per async task)            │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ run_transaction(label, mode, work)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MutationQueue  ◀── GarbageCollector ──▶  ReferenceSet          │
//! │  (ordering, acks, stream token)   (eager or no-op)  (view pins) │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Mutation Batch Store: batch tree + document index + metadata   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//!                       SQLite (WAL, WITHOUT ROWID)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Ids never reused**: batch ids strictly increase per user queue, even
//!    after removals and restarts
//! 2. **Ordered acknowledgment**: acknowledgments follow id order and the
//!    acknowledged id never decreases
//! 3. **Index in lockstep**: the document index changes in the same
//!    transaction as the batch it describes
//! 4. **Memory never leads disk**: the queue keeps no copy of stored state
//! 5. **Safe collection**: garbage collection never removes a pending batch
//!
//! ## Module Organization
//!
//! - [`error`]: Error type and classification
//! - [`types`]: Domain newtypes (BatchId, DocumentKey, StreamToken, ...)
//! - [`mutation`]: Mutations and mutation batches
//! - [`query`]: Query targets used to filter batches
//! - [`config`]: Persistence settings
//! - [`schema`]: SQLite DDL and initialization
//! - [`persistence`]: Scoped transactions
//! - [`codec`]: Batch payload encoding and checksums
//! - [`queue`]: The mutation queue
//! - [`gc`]: Garbage collector contract and implementations
//! - [`reference_set`]: Document pins held by local views
//! - [`autocommit`]: One transaction per queue operation
//! - [`api`]: Async facade

/// Error types for queue operations.
///
/// A single error enum, classified into precondition, consistency and
/// internal failures.
pub mod error;

/// Domain types.
///
/// Uses the newtype pattern so batch ids, user ids, stream tokens and
/// document keys can't be mixed up.
pub mod types;

/// Mutations and immutable mutation batches.
pub mod mutation;

/// Query targets: the path-level part of a document query.
pub mod query;

/// Persistence configuration.
pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Scoped read-only and read-write transactions over one connection.
pub mod persistence;

/// Mutation list encoding: JSON, optional zstd, XXH3 checksum.
pub mod codec;

mod store;

/// The durable mutation queue.
pub mod queue;

/// Garbage collection of documents no longer referenced by batches or views.
pub mod gc;

/// Reference-counted document pins for local views.
pub mod reference_set;

/// Autocommit wrapper running every queue operation in its own transaction.
pub mod autocommit;

/// Async API running transactions on Tokio's blocking pool.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::AsyncPersistence;
pub use autocommit::AutocommitQueue;
pub use config::{PersistenceConfig, SynchronousMode};
pub use error::{Error, ErrorKind, Result};
pub use gc::{garbage_source_handle, EagerGarbageCollector, GarbageCollector, GarbageSource, NoOpGarbageCollector};
pub use mutation::{Mutation, MutationBatch};
pub use persistence::{Persistence, PersistenceTransaction, TransactionMode};
pub use query::Query;
pub use queue::MutationQueue;
pub use reference_set::ReferenceSet;

pub use types::{
    BatchId, DocumentKey, DocumentKeySet, ResourcePath, StreamToken, TargetId, Timestamp, UserId,
};
