//! # Mutation Batch Store
//!
//! Durable representation of one user's queued batches. The store owns three
//! pieces of state, all keyed by user id and all updated through the caller's
//! transaction:
//!
//! - the **batch tree** (`mutations`): encoded batches keyed by batch id
//! - the **key index** (`document_mutations`): one row per (document, batch),
//!   maintained in lockstep with the batch tree
//! - the **queue metadata row** (`mutation_queues`)
//!
//! The store enforces read-only transactions and encoding; ordering and
//! acknowledgment rules live in [`MutationQueue`](crate::MutationQueue).

use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::codec::{decode_mutations, encode_mutations};
use crate::error::{Error, Result};
use crate::mutation::MutationBatch;
use crate::persistence::PersistenceTransaction;
use crate::types::{BatchId, DocumentKey, ResourcePath, StreamToken, Timestamp, UserId};

// =============================================================================
// Queue Metadata
// =============================================================================

/// The singleton metadata row of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueMetadata {
    pub last_acknowledged_batch_id: BatchId,
    pub highest_batch_id: BatchId,
    pub last_stream_token: StreamToken,
}

impl QueueMetadata {
    pub fn new() -> Self {
        Self {
            last_acknowledged_batch_id: BatchId::NONE,
            highest_batch_id: BatchId::NONE,
            last_stream_token: StreamToken::empty(),
        }
    }
}

/// Raw columns of a batch row, decoded outside the rusqlite row closure.
struct StoredBatchRow {
    batch_id: i64,
    local_write_time_ms: i64,
    codec: i64,
    checksum: Vec<u8>,
    data: Vec<u8>,
}

const SELECT_BATCH_COLUMNS: &str =
    "SELECT batch_id, local_write_time_ms, codec, checksum, data FROM mutations";

// =============================================================================
// Store
// =============================================================================

/// Batch tree, key index and metadata for a single user.
#[derive(Debug, Clone)]
pub(crate) struct MutationBatchStore {
    user: UserId,
}

impl MutationBatchStore {
    pub fn new(user: UserId) -> Self {
        Self { user }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn read_metadata(&self, txn: &PersistenceTransaction<'_>) -> Result<Option<QueueMetadata>> {
        let row = txn
            .sql()
            .prepare_cached(
                "SELECT last_acknowledged_batch_id, highest_batch_id, last_stream_token
                 FROM mutation_queues WHERE user_id = ?",
            )?
            .query_row([self.user.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .optional()?;

        Ok(row.map(|(acked, highest, token)| QueueMetadata {
            last_acknowledged_batch_id: BatchId::from_sql(acked),
            highest_batch_id: BatchId::from_sql(highest),
            last_stream_token: StreamToken::from(token),
        }))
    }

    pub fn write_metadata(
        &self,
        txn: &PersistenceTransaction<'_>,
        metadata: &QueueMetadata,
    ) -> Result<()> {
        txn.require_read_write("write queue metadata")?;
        txn.sql()
            .prepare_cached(
                "INSERT INTO mutation_queues
                     (user_id, last_acknowledged_batch_id, highest_batch_id, last_stream_token)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                     last_acknowledged_batch_id = excluded.last_acknowledged_batch_id,
                     highest_batch_id = excluded.highest_batch_id,
                     last_stream_token = excluded.last_stream_token",
            )?
            .execute(params![
                self.user.as_str(),
                metadata.last_acknowledged_batch_id.to_sql(),
                metadata.highest_batch_id.to_sql(),
                metadata.last_stream_token.as_bytes(),
            ])?;
        Ok(())
    }

    // =========================================================================
    // Batch Writes
    // =========================================================================

    /// Writes a batch row plus one index row per affected key.
    pub fn insert_batch(&self, txn: &PersistenceTransaction<'_>, batch: &MutationBatch) -> Result<()> {
        txn.require_read_write("insert mutation batch")?;

        let encoded = encode_mutations(batch.mutations(), txn.config().compression_threshold)?;
        let sql = txn.sql();

        sql.prepare_cached(
            "INSERT INTO mutations (user_id, batch_id, local_write_time_ms, codec, checksum, data)
             VALUES (?, ?, ?, ?, ?, ?)",
        )?
        .execute(params![
            self.user.as_str(),
            batch.batch_id().to_sql(),
            batch.local_write_time().as_millis() as i64,
            encoded.codec,
            encoded.checksum,
            encoded.data,
        ])?;

        let mut index_insert = sql.prepare_cached(
            "INSERT INTO document_mutations (user_id, path, batch_id) VALUES (?, ?, ?)",
        )?;
        for key in batch.keys() {
            index_insert.execute(params![
                self.user.as_str(),
                key.path().canonical_string(),
                batch.batch_id().to_sql(),
            ])?;
        }

        debug!(
            user = %self.user,
            batch_id = %batch.batch_id(),
            keys = batch.keys().len(),
            codec = encoded.codec,
            bytes = encoded.data.len(),
            "stored mutation batch"
        );
        Ok(())
    }

    /// Deletes a batch row and its index rows. Returns false if no batch row
    /// existed.
    pub fn delete_batch(&self, txn: &PersistenceTransaction<'_>, batch: &MutationBatch) -> Result<bool> {
        txn.require_read_write("delete mutation batch")?;
        let sql = txn.sql();

        let removed = sql
            .prepare_cached("DELETE FROM mutations WHERE user_id = ? AND batch_id = ?")?
            .execute(params![self.user.as_str(), batch.batch_id().to_sql()])?;

        let mut index_delete = sql.prepare_cached(
            "DELETE FROM document_mutations WHERE user_id = ? AND path = ? AND batch_id = ?",
        )?;
        for key in batch.keys() {
            index_delete.execute(params![
                self.user.as_str(),
                key.path().canonical_string(),
                batch.batch_id().to_sql(),
            ])?;
        }

        debug!(user = %self.user, batch_id = %batch.batch_id(), "deleted mutation batch");
        Ok(removed > 0)
    }

    // =========================================================================
    // Batch Reads
    // =========================================================================

    pub fn get_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Result<Option<MutationBatch>> {
        let query = format!("{SELECT_BATCH_COLUMNS} WHERE user_id = ? AND batch_id = ?");
        let mut batches =
            self.query_batches(txn, &query, params![self.user.as_str(), batch_id.to_sql()])?;
        Ok(batches.pop())
    }

    /// First batch with an id strictly greater than `batch_id`.
    pub fn next_batch_after(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Result<Option<MutationBatch>> {
        let query = format!(
            "{SELECT_BATCH_COLUMNS} WHERE user_id = ? AND batch_id > ? ORDER BY batch_id LIMIT 1"
        );
        let mut batches =
            self.query_batches(txn, &query, params![self.user.as_str(), batch_id.to_sql()])?;
        Ok(batches.pop())
    }

    /// Every batch, ascending.
    pub fn all_batches(&self, txn: &PersistenceTransaction<'_>) -> Result<Vec<MutationBatch>> {
        let query = format!("{SELECT_BATCH_COLUMNS} WHERE user_id = ? ORDER BY batch_id");
        self.query_batches(txn, &query, params![self.user.as_str()])
    }

    /// Every batch with id `<= batch_id`, ascending.
    pub fn batches_through(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Result<Vec<MutationBatch>> {
        let query = format!(
            "{SELECT_BATCH_COLUMNS} WHERE user_id = ? AND batch_id <= ? ORDER BY batch_id"
        );
        self.query_batches(txn, &query, params![self.user.as_str(), batch_id.to_sql()])
    }

    /// Loads batches referenced by the key index, in the order given.
    ///
    /// An id without a batch row means the index drifted from the batch tree.
    pub fn batches_by_ids(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_ids: impl IntoIterator<Item = BatchId>,
    ) -> Result<Vec<MutationBatch>> {
        let mut batches = Vec::new();
        for batch_id in batch_ids {
            let batch = self.get_batch(txn, batch_id)?.ok_or_else(|| {
                Error::Consistency(format!(
                    "document index for user '{}' references missing batch {batch_id}",
                    self.user
                ))
            })?;
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Highest stored batch id strictly above `floor`, if any.
    pub fn max_batch_id_above(
        &self,
        txn: &PersistenceTransaction<'_>,
        floor: BatchId,
    ) -> Result<Option<BatchId>> {
        let max: Option<i64> = txn
            .sql()
            .prepare_cached("SELECT MAX(batch_id) FROM mutations WHERE user_id = ? AND batch_id > ?")?
            .query_row(params![self.user.as_str(), floor.to_sql()], |row| row.get(0))?;
        Ok(max.map(BatchId::from_sql))
    }

    pub fn has_batches(&self, txn: &PersistenceTransaction<'_>) -> Result<bool> {
        let found: Option<i64> = txn
            .sql()
            .prepare_cached("SELECT 1 FROM mutations WHERE user_id = ? LIMIT 1")?
            .query_row([self.user.as_str()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn query_batches(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<MutationBatch>> {
        let mut stmt = txn.sql().prepare_cached(query)?;
        let rows = stmt.query_map(params, |row| {
            Ok(StoredBatchRow {
                batch_id: row.get(0)?,
                local_write_time_ms: row.get(1)?,
                codec: row.get(2)?,
                checksum: row.get(3)?,
                data: row.get(4)?,
            })
        })?;

        let mut batches = Vec::new();
        for row in rows {
            batches.push(decode_row(&self.user, row?)?);
        }
        Ok(batches)
    }

    // =========================================================================
    // Key Index
    // =========================================================================

    /// Ids of batches touching `key`, ascending.
    pub fn batch_ids_for_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> Result<Vec<BatchId>> {
        let mut stmt = txn.sql().prepare_cached(
            "SELECT batch_id FROM document_mutations
             WHERE user_id = ? AND path = ? ORDER BY batch_id",
        )?;
        let ids = stmt
            .query_map(
                params![self.user.as_str(), key.path().canonical_string()],
                |row| row.get::<_, i64>(0),
            )?
            .map(|id| id.map(BatchId::from_sql))
            .collect::<rusqlite::Result<Vec<BatchId>>>()?;
        Ok(ids)
    }

    /// True if at least one batch touches `key`.
    pub fn key_has_batches(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Result<bool> {
        let found: Option<i64> = txn
            .sql()
            .prepare_cached(
                "SELECT 1 FROM document_mutations WHERE user_id = ? AND path = ? LIMIT 1",
            )?
            .query_row(
                params![self.user.as_str(), key.path().canonical_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Index entries for documents anywhere below `prefix` (every entry when
    /// `prefix` is the root), in key order.
    pub fn index_entries_under(
        &self,
        txn: &PersistenceTransaction<'_>,
        prefix: &ResourcePath,
    ) -> Result<Vec<(DocumentKey, BatchId)>> {
        let raw: Vec<(String, i64)> = if prefix.is_empty() {
            let mut stmt = txn.sql().prepare_cached(
                "SELECT path, batch_id FROM document_mutations
                 WHERE user_id = ? ORDER BY path, batch_id",
            )?;
            let rows = stmt.query_map([self.user.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<(String, i64)>>>()?
        } else {
            // All paths starting with "P/" sort in ["P/", "P0"): '0' follows '/'.
            let canonical = prefix.canonical_string();
            let lower = format!("{canonical}/");
            let upper = format!("{canonical}0");
            let mut stmt = txn.sql().prepare_cached(
                "SELECT path, batch_id FROM document_mutations
                 WHERE user_id = ? AND path >= ? AND path < ? ORDER BY path, batch_id",
            )?;
            let rows = stmt.query_map(params![self.user.as_str(), lower, upper], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<(String, i64)>>>()?
        };

        raw.into_iter()
            .map(|(path, batch_id)| {
                let key = DocumentKey::parse(&path).map_err(|_| {
                    Error::Consistency(format!("document index holds invalid key '{path}'"))
                })?;
                Ok((key, BatchId::from_sql(batch_id)))
            })
            .collect()
    }

    /// Index entries whose batch row is missing.
    pub fn orphaned_index_entries(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> Result<Vec<(String, BatchId)>> {
        let mut stmt = txn.sql().prepare_cached(
            "SELECT d.path, d.batch_id
             FROM document_mutations d
             LEFT JOIN mutations m ON m.user_id = d.user_id AND m.batch_id = d.batch_id
             WHERE d.user_id = ? AND m.batch_id IS NULL
             ORDER BY d.path, d.batch_id",
        )?;
        let rows = stmt.query_map([self.user.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, BatchId::from_sql(row.get(1)?)))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<(String, BatchId)>>>()?)
    }

    /// Number of index rows for this user.
    pub fn index_entry_count(&self, txn: &PersistenceTransaction<'_>) -> Result<u64> {
        let count: i64 = txn
            .sql()
            .prepare_cached("SELECT COUNT(*) FROM document_mutations WHERE user_id = ?")?
            .query_row([self.user.as_str()], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn decode_row(user: &UserId, row: StoredBatchRow) -> Result<MutationBatch> {
    let batch_id = BatchId::from_sql(row.batch_id);
    let mutations = match decode_mutations(batch_id, row.codec, &row.checksum, &row.data) {
        Ok(mutations) => mutations,
        Err(err) => {
            warn!(user = %user, batch_id = %batch_id, error = %err, "stored mutation batch is corrupted");
            return Err(err);
        }
    };
    MutationBatch::new(
        batch_id,
        Timestamp::from_millis(row.local_write_time_ms as u64),
        mutations,
    )
}

// =============================================================================
// Tests
// =============================================================================
