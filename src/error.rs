//! # Error Handling for the Mutation Queue
//!
//! A single error enum ([`Error`]) covers every failure mode of the queue, the
//! batch store and the persistence substrate. Callers usually only care about
//! which *kind* of failure happened, so [`Error::kind`] classifies variants.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Precondition | Write in read-only transaction, out-of-order ack | Fix the caller |
//! | Consistency | Metadata ahead of stored ids, checksum mismatch | Abort, investigate |
//! | Internal | SQLite error, blocking task panicked | Log and retry the transaction |
//!
//! "Not found" is not an error: lookups return `Option`.

use thiserror::Error;

use crate::types::BatchId;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in mutation queue operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Precondition Violations (caller bugs)
    // =========================================================================

    /// A write was attempted inside a read-only transaction.
    ///
    /// `label` is the diagnostic label the transaction was opened with.
    #[error("transaction '{label}' is read-only: cannot {operation}")]
    ReadOnlyTransaction {
        /// Label passed to `run_transaction`.
        label: String,
        /// The store operation that was refused.
        operation: &'static str,
    },

    /// An acknowledgment did not target the next pending batch.
    ///
    /// # When This Happens
    ///
    /// - Acknowledging a batch at or below the current high-water mark
    ///   (including acknowledging the same batch twice)
    /// - Skipping over an unacknowledged batch
    #[error(
        "cannot acknowledge batch {batch_id}: last acknowledged is {last_acknowledged}, next pending is {next_pending}"
    )]
    AcknowledgeOutOfOrder {
        /// The batch the caller tried to acknowledge.
        batch_id: BatchId,
        /// Current `last_acknowledged_batch_id`.
        last_acknowledged: BatchId,
        /// The batch that must be acknowledged next (`none` if nothing is pending).
        next_pending: BatchId,
    },

    /// Removal targeted a batch that is not stored.
    #[error("mutation batch {batch_id} does not exist")]
    BatchNotFound {
        /// The missing batch id.
        batch_id: BatchId,
    },

    /// Removal targeted a batch the backend has not acknowledged yet.
    #[error(
        "cannot remove unacknowledged batch {batch_id}: last acknowledged is {last_acknowledged}"
    )]
    RemoveUnacknowledged {
        /// The pending batch.
        batch_id: BatchId,
        /// Current `last_acknowledged_batch_id`.
        last_acknowledged: BatchId,
    },

    /// `add_mutation_batch` was called without mutations.
    #[error("mutation batch must contain at least one mutation")]
    EmptyBatch,

    /// A queue operation ran before `start()` created the queue metadata.
    #[error("mutation queue for user '{user}' has not been started")]
    QueueNotStarted {
        /// The queue's user id.
        user: String,
    },

    /// A resource path or document key was malformed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    // =========================================================================
    // Consistency Violations (corrupted state)
    // =========================================================================

    /// Persisted queue state violates an invariant.
    ///
    /// Raised by `start()` and `perform_consistency_check()`; initialization
    /// must not proceed on this state.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A stored batch failed checksum or decoding.
    #[error("corrupted mutation batch {batch_id}: {reason}")]
    Corruption {
        /// The batch whose blob is damaged.
        batch_id: BatchId,
        /// Description of the failure.
        reason: String,
    },

    /// Schema version mismatch.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Mutation payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression layer I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A transaction running on the blocking pool panicked or was cancelled.
    #[error("transaction task failed: {0}")]
    TaskFailed(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller broke an API contract.
    Precondition,
    /// Persisted state is inconsistent or damaged.
    Consistency,
    /// The substrate or runtime failed.
    Internal,
}

impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ReadOnlyTransaction { .. }
            | Error::AcknowledgeOutOfOrder { .. }
            | Error::BatchNotFound { .. }
            | Error::RemoveUnacknowledged { .. }
            | Error::EmptyBatch
            | Error::QueueNotStarted { .. }
            | Error::InvalidPath { .. } => ErrorKind::Precondition,
            Error::Consistency(_) | Error::Corruption { .. } | Error::Schema(_) => {
                ErrorKind::Consistency
            }
            Error::Sqlite(_) | Error::Serialization(_) | Error::Io(_) | Error::TaskFailed(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Shorthand for `kind() == ErrorKind::Precondition`.
    pub fn is_precondition(&self) -> bool {
        self.kind() == ErrorKind::Precondition
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let ack = Error::AcknowledgeOutOfOrder {
            batch_id: BatchId::from_raw(1),
            last_acknowledged: BatchId::from_raw(1),
            next_pending: BatchId::from_raw(2),
        };
        assert_eq!(
            ack.to_string(),
            "cannot acknowledge batch 1: last acknowledged is 1, next pending is 2"
        );

        let read_only = Error::ReadOnlyTransaction {
            label: "lookup".to_string(),
            operation: "insert mutation batch",
        };
        assert_eq!(
            read_only.to_string(),
            "transaction 'lookup' is read-only: cannot insert mutation batch"
        );

        let missing = Error::BatchNotFound {
            batch_id: BatchId::from_raw(7),
        };
        assert_eq!(missing.to_string(), "mutation batch 7 does not exist");

        let pending = Error::RemoveUnacknowledged {
            batch_id: BatchId::from_raw(3),
            last_acknowledged: BatchId::NONE,
        };
        assert_eq!(
            pending.to_string(),
            "cannot remove unacknowledged batch 3: last acknowledged is none"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::EmptyBatch.kind(), ErrorKind::Precondition);
        assert!(Error::EmptyBatch.is_precondition());
        assert_eq!(
            Error::Consistency("ack ahead of ids".into()).kind(),
            ErrorKind::Consistency
        );
        assert_eq!(
            Error::TaskFailed("panicked".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
        assert_eq!(our_err.kind(), ErrorKind::Internal);
    }
}
