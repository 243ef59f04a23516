//! # Async API
//!
//! SQLite work is blocking, so async callers hand a whole transaction to
//! Tokio's blocking pool and await its result:
//!
//! ```text
//!  async task                      blocking pool
//!  ──────────                      ─────────────
//!  run_transaction(work) ──────▶  Persistence::run_transaction
//!        .await                      begin
//!          ·                         work(&txn)   queue ops, no suspension
//!          ·                         commit / rollback
//!  Result<T> ◀───────────────────
//! ```
//!
//! Suspension happens only at transaction boundaries: the closure runs to
//! completion on one thread and never yields. Dropping the returned future
//! does not cancel a transaction that already started; it still commits or
//! rolls back as a unit.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mutalog::{AsyncPersistence, MutationQueue, TransactionMode, UserId};
//!
//! let db = AsyncPersistence::open("queue.db").await?;
//! let queue = Arc::new(MutationQueue::new(UserId::new("alice")));
//!
//! let q = Arc::clone(&queue);
//! db.run_transaction("start", TransactionMode::ReadWrite, move |txn| q.start(txn))
//!     .await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use crate::persistence::{Persistence, PersistenceTransaction, TransactionMode};

/// Async handle to a [`Persistence`]. Cheap to clone; clones share the
/// connection.
#[derive(Debug, Clone)]
pub struct AsyncPersistence {
    inner: Arc<Persistence>,
}

impl AsyncPersistence {
    /// Opens (creating if needed) a database file on the blocking pool.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PersistenceConfig::default()).await
    }

    pub async fn open_with_config<P: AsRef<Path>>(path: P, config: PersistenceConfig) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let persistence = tokio::task::spawn_blocking(move || Persistence::open_with_config(path, config))
            .await
            .map_err(|e| Error::TaskFailed(format!("open task join error: {e}")))??;
        Ok(Self::from_persistence(Arc::new(persistence)))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_persistence(Arc::new(Persistence::open_in_memory()?)))
    }

    /// Wraps a persistence that is also used synchronously elsewhere.
    pub fn from_persistence(inner: Arc<Persistence>) -> Self {
        Self { inner }
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.inner
    }

    /// Runs `work` in one transaction on the blocking pool.
    ///
    /// Semantics match [`Persistence::run_transaction`]. A panic inside
    /// `work` rolls the transaction back and surfaces as
    /// [`Error::TaskFailed`].
    pub async fn run_transaction<T, F>(&self, label: impl Into<String>, mode: TransactionMode, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PersistenceTransaction<'_>) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let label = label.into();

        tokio::task::spawn_blocking(move || inner.run_transaction(&label, mode, work))
            .await
            .map_err(|e| Error::TaskFailed(format!("transaction task join error: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MutationQueue;
    use crate::types::UserId;

    #[tokio::test]
    async fn test_run_transaction_returns_value() {
        let db = AsyncPersistence::open_in_memory().unwrap();
        let queue = Arc::new(MutationQueue::new(UserId::new("alice")));

        let q = Arc::clone(&queue);
        db.run_transaction("start", TransactionMode::ReadWrite, move |txn| q.start(txn))
            .await
            .unwrap();

        let q = Arc::clone(&queue);
        let empty = db
            .run_transaction("check", TransactionMode::ReadOnly, move |txn| q.check_empty(txn))
            .await
            .unwrap();
        assert!(empty);
    }

    #[tokio::test]
    async fn test_panic_surfaces_as_task_failed() {
        let db = AsyncPersistence::open_in_memory().unwrap();
        let err = db
            .run_transaction("boom", TransactionMode::ReadWrite, |_txn| -> Result<()> {
                panic!("work panicked")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed(_)));
    }
}
