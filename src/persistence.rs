//! # Persistence Substrate
//!
//! Scoped transactions over a single SQLite connection. Every queue operation
//! receives a [`PersistenceTransaction`] and runs entirely inside it:
//!
//! ```text
//! persistence.run_transaction("add batch", ReadWrite, |txn| {
//!     queue.add_mutation_batch(txn, now, mutations)   ─┐
//!     queue.acknowledge_batch(txn, &prev, token)       ├─ one atomic commit
//! })                                                  ─┘
//! ```
//!
//! ## Guarantees
//!
//! - **Atomicity**: if `work` returns `Err`, every write it made is rolled
//!   back and the error is returned unchanged.
//! - **Isolation**: the connection lock is held for the whole transaction, so
//!   read-write transactions never interleave. Read-write transactions take
//!   SQLite's write lock up front (`BEGIN IMMEDIATE`).
//! - **Read-only mode**: store writes check the mode first and fail with
//!   [`Error::ReadOnlyTransaction`]; read-only transactions are always
//!   rolled back at the end.
//! - **Scoping**: a `PersistenceTransaction` only exists inside the closure
//!   passed to [`Persistence::run_transaction`]. Its lifetime keeps it from
//!   escaping, so queue operations cannot be called outside a transaction.
//!
//! Calling `run_transaction` from inside `work` deadlocks: one logical
//! operation must never span two transactions.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use crate::schema;

// =============================================================================
// Transaction Mode
// =============================================================================

/// Whether a transaction may change stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl TransactionMode {
    pub fn is_read_write(self) -> bool {
        self == TransactionMode::ReadWrite
    }

    fn behavior(self) -> TransactionBehavior {
        match self {
            TransactionMode::ReadOnly => TransactionBehavior::Deferred,
            TransactionMode::ReadWrite => TransactionBehavior::Immediate,
        }
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// Owner of the SQLite connection and entry point for transactions.
///
/// `Persistence` is `Send + Sync`; share it behind an `Arc` to run
/// transactions from several threads. They are serialized on the connection
/// lock.
pub struct Persistence {
    conn: Mutex<Connection>,
    config: PersistenceConfig,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Persistence {
    /// Opens (creating if needed) a database file with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, PersistenceConfig::default())
    }

    /// Opens a database file with explicit settings.
    pub fn open_with_config(path: impl AsRef<Path>, config: PersistenceConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        schema::initialize(&conn, &config)?;
        debug!(path = %path.display(), "opened mutation queue database");
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// Opens a private in-memory database. Contents vanish on drop.
    pub fn open_in_memory() -> Result<Self> {
        let config = PersistenceConfig::default();
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn, &config)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Runs `work` inside one transaction.
    ///
    /// Read-write transactions commit if `work` succeeds; read-only ones are
    /// rolled back either way. On error, all writes are discarded and the
    /// error from `work` is returned.
    ///
    /// `label` is used for diagnostics only.
    pub fn run_transaction<T, F>(&self, label: &str, mode: TransactionMode, work: F) -> Result<T>
    where
        F: FnOnce(&PersistenceTransaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(mode.behavior())?;
        let txn = PersistenceTransaction {
            tx,
            mode,
            label,
            config: &self.config,
        };
        debug!(label, ?mode, "transaction started");

        match work(&txn) {
            Ok(value) => {
                match mode {
                    TransactionMode::ReadWrite => txn.tx.commit()?,
                    TransactionMode::ReadOnly => txn.tx.rollback()?,
                }
                debug!(label, ?mode, "transaction finished");
                Ok(value)
            }
            Err(err) => {
                if mode.is_read_write() {
                    warn!(label, error = %err, "transaction rolled back");
                }
                if let Err(rollback_err) = txn.tx.rollback() {
                    warn!(label, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

// =============================================================================
// Transaction Handle
// =============================================================================

/// An open transaction. Only obtainable inside [`Persistence::run_transaction`].
pub struct PersistenceTransaction<'a> {
    tx: Transaction<'a>,
    mode: TransactionMode,
    label: &'a str,
    config: &'a PersistenceConfig,
}

impl<'a> PersistenceTransaction<'a> {
    /// The diagnostic label this transaction was opened with.
    pub fn label(&self) -> &str {
        self.label
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Fails with [`Error::ReadOnlyTransaction`] unless this transaction may
    /// write. `operation` names the refused write in the error.
    pub fn require_read_write(&self, operation: &'static str) -> Result<()> {
        if self.mode.is_read_write() {
            Ok(())
        } else {
            Err(Error::ReadOnlyTransaction {
                label: self.label.to_string(),
                operation,
            })
        }
    }

    pub(crate) fn sql(&self) -> &Connection {
        &self.tx
    }

    pub(crate) fn config(&self) -> &PersistenceConfig {
        self.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn count_queues(persistence: &Persistence) -> i64 {
        persistence
            .run_transaction("count", TransactionMode::ReadOnly, |txn| {
                Ok(txn
                    .sql()
                    .query_row("SELECT COUNT(*) FROM mutation_queues", [], |row| row.get(0))?)
            })
            .unwrap()
    }

    fn insert_queue(txn: &PersistenceTransaction<'_>, user: &str) -> Result<()> {
        txn.require_read_write("insert queue")?;
        txn.sql().execute(
            "INSERT INTO mutation_queues VALUES (?, 0, 0, x'')",
            [user],
        )?;
        Ok(())
    }

    #[test]
    fn test_read_write_commits() {
        let persistence = Persistence::open_in_memory().unwrap();
        persistence
            .run_transaction("insert", TransactionMode::ReadWrite, |txn| {
                insert_queue(txn, "alice")
            })
            .unwrap();
        assert_eq!(count_queues(&persistence), 1);
    }

    #[test]
    fn test_error_rolls_back() {
        let persistence = Persistence::open_in_memory().unwrap();
        let result: Result<()> =
            persistence.run_transaction("failing", TransactionMode::ReadWrite, |txn| {
                insert_queue(txn, "alice")?;
                Err(Error::Consistency("boom".into()))
            });
        assert!(matches!(result, Err(Error::Consistency(_))));
        assert_eq!(count_queues(&persistence), 0);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let persistence = Persistence::open_in_memory().unwrap();
        let err = persistence
            .run_transaction("lookup", TransactionMode::ReadOnly, |txn| {
                insert_queue(txn, "alice")
            })
            .unwrap_err();
        match err {
            Error::ReadOnlyTransaction { label, operation } => {
                assert_eq!(label, "lookup");
                assert_eq!(operation, "insert queue");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(count_queues(&persistence), 0);
    }

    #[test]
    fn test_transaction_exposes_label_and_mode() {
        let persistence = Persistence::open_in_memory().unwrap();
        persistence
            .run_transaction("probe", TransactionMode::ReadOnly, |txn| {
                assert_eq!(txn.label(), "probe");
                assert_eq!(txn.mode(), TransactionMode::ReadOnly);
                assert!(txn.require_read_write("anything").is_err());
                Ok(())
            })
            .unwrap();
    }
}
