//! # Mutation Queue
//!
//! The ordered, durable log of a user's local writes. Batches move through
//! three states:
//!
//! ```text
//!  add_mutation_batch      acknowledge_batch         remove_mutation_batch
//! ──────────────────▶ pending ─────────────▶ acknowledged ─────────────▶ removed
//!                                (id <= last_acknowledged)   (or garbage collection)
//! ```
//!
//! ## Ordering
//!
//! Batch ids are handed out from a persisted high-water mark, so they are
//! strictly increasing and never reused, even after every batch has been
//! removed and the process restarted. Every multi-batch result is ascending
//! by id: that is the replay order.
//!
//! ## Transactions
//!
//! Every operation takes the caller's [`PersistenceTransaction`]. Writes
//! require [`TransactionMode::ReadWrite`](crate::TransactionMode); lookups
//! run in either mode. The queue caches nothing from storage, so a rolled
//! back transaction can never leave it ahead of disk.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gc::{GarbageCollector, GarbageSource};
use crate::mutation::{Mutation, MutationBatch};
use crate::persistence::PersistenceTransaction;
use crate::query::Query;
use crate::store::{MutationBatchStore, QueueMetadata};
use crate::types::{BatchId, DocumentKey, DocumentKeySet, StreamToken, Timestamp, UserId};

/// Durable queue of one user's mutation batches.
pub struct MutationQueue {
    store: MutationBatchStore,
    garbage_collector: RwLock<Option<Arc<dyn GarbageCollector>>>,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("user", self.store.user())
            .field("has_garbage_collector", &self.garbage_collector.read().is_some())
            .finish()
    }
}

impl MutationQueue {
    /// Creates a handle on `user`'s queue. Call [`start`](Self::start) in a
    /// read-write transaction before anything else.
    pub fn new(user: UserId) -> Self {
        Self {
            store: MutationBatchStore::new(user),
            garbage_collector: RwLock::new(None),
        }
    }

    /// The user this queue belongs to.
    pub fn user(&self) -> &UserId {
        self.store.user()
    }

    /// Attaches the collector notified whenever a batch is removed, or
    /// detaches it with `None`.
    pub fn set_garbage_collector(&self, gc: Option<Arc<dyn GarbageCollector>>) {
        *self.garbage_collector.write() = gc;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates the queue's metadata on first use, or validates it against
    /// the stored batches.
    ///
    /// Fails with [`Error::Consistency`] if the acknowledged id or any stored
    /// batch id lies above the id high-water mark.
    pub fn start(&self, txn: &PersistenceTransaction<'_>) -> Result<()> {
        txn.require_read_write("start mutation queue")?;

        let Some(metadata) = self.store.read_metadata(txn)? else {
            self.store.write_metadata(txn, &QueueMetadata::new())?;
            info!(user = %self.user(), "created mutation queue");
            return Ok(());
        };

        if metadata.last_acknowledged_batch_id > metadata.highest_batch_id {
            warn!(
                user = %self.user(),
                last_acknowledged = %metadata.last_acknowledged_batch_id,
                highest = %metadata.highest_batch_id,
                "acknowledged id ahead of id high-water mark"
            );
            return Err(Error::Consistency(format!(
                "queue for user '{}' acknowledged batch {} but only {} were ever created",
                self.user(),
                metadata.last_acknowledged_batch_id,
                metadata.highest_batch_id
            )));
        }

        if let Some(max_stored) = self.store.max_batch_id_above(txn, BatchId::NONE)? {
            if max_stored > metadata.highest_batch_id {
                warn!(
                    user = %self.user(),
                    max_stored = %max_stored,
                    highest = %metadata.highest_batch_id,
                    "stored batch ahead of id high-water mark"
                );
                return Err(Error::Consistency(format!(
                    "queue for user '{}' stores batch {max_stored} above high-water mark {}",
                    self.user(),
                    metadata.highest_batch_id
                )));
            }
        }

        info!(
            user = %self.user(),
            last_acknowledged = %metadata.last_acknowledged_batch_id,
            highest = %metadata.highest_batch_id,
            "started mutation queue"
        );
        Ok(())
    }

    /// True iff the queue stores no batches, pending or acknowledged.
    pub fn check_empty(&self, txn: &PersistenceTransaction<'_>) -> Result<bool> {
        self.metadata(txn)?;
        Ok(!self.store.has_batches(txn)?)
    }

    // =========================================================================
    // Acknowledgment & Stream Token
    // =========================================================================

    /// Id of the last acknowledged batch, or [`BatchId::NONE`].
    pub fn get_highest_acknowledged_batch_id(&self, txn: &PersistenceTransaction<'_>) -> Result<BatchId> {
        Ok(self.metadata(txn)?.last_acknowledged_batch_id)
    }

    /// Highest stored batch id above the acknowledged id, or
    /// [`BatchId::NONE`] if nothing is pending.
    pub fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> Result<BatchId> {
        let metadata = self.metadata(txn)?;
        Ok(self
            .store
            .max_batch_id_above(txn, metadata.last_acknowledged_batch_id)?
            .unwrap_or(BatchId::NONE))
    }

    /// Marks `batch` acknowledged and records `stream_token`, atomically.
    ///
    /// `batch` must be the first pending batch: acknowledgments arrive in
    /// order. The batch stays stored until removed.
    pub fn acknowledge_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: StreamToken,
    ) -> Result<()> {
        txn.require_read_write("acknowledge mutation batch")?;
        let mut metadata = self.metadata(txn)?;
        let batch_id = batch.batch_id();
        let last_acknowledged = metadata.last_acknowledged_batch_id;

        let next_pending = self
            .store
            .next_batch_after(txn, last_acknowledged)?
            .map(|next| next.batch_id())
            .unwrap_or(BatchId::NONE);

        if batch_id <= last_acknowledged || batch_id != next_pending {
            return Err(Error::AcknowledgeOutOfOrder {
                batch_id,
                last_acknowledged,
                next_pending,
            });
        }

        metadata.last_acknowledged_batch_id = batch_id;
        metadata.last_stream_token = stream_token;
        self.store.write_metadata(txn, &metadata)?;

        debug!(user = %self.user(), batch_id = %batch_id, "acknowledged mutation batch");
        Ok(())
    }

    /// Token recorded by the last acknowledgment or explicit set; empty
    /// until one happens.
    pub fn get_last_stream_token(&self, txn: &PersistenceTransaction<'_>) -> Result<StreamToken> {
        Ok(self.metadata(txn)?.last_stream_token)
    }

    /// Overwrites the stream token without touching acknowledgment state.
    pub fn set_last_stream_token(
        &self,
        txn: &PersistenceTransaction<'_>,
        stream_token: StreamToken,
    ) -> Result<()> {
        txn.require_read_write("set stream token")?;
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = stream_token;
        self.store.write_metadata(txn, &metadata)
    }

    // =========================================================================
    // Adding Batches
    // =========================================================================

    /// Appends a batch holding `mutations` and returns it with its new id.
    pub fn add_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> Result<MutationBatch> {
        txn.require_read_write("add mutation batch")?;
        if mutations.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let mut metadata = self.metadata(txn)?;
        let batch_id = metadata.highest_batch_id.next();
        let batch = MutationBatch::new(batch_id, local_write_time, mutations)?;

        self.store.insert_batch(txn, &batch)?;
        metadata.highest_batch_id = batch_id;
        self.store.write_metadata(txn, &metadata)?;

        debug!(
            user = %self.user(),
            batch_id = %batch_id,
            mutations = batch.mutations().len(),
            "added mutation batch"
        );
        Ok(batch)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// The batch with `batch_id`, or `None` if it was never created or has
    /// been removed.
    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Result<Option<MutationBatch>> {
        self.metadata(txn)?;
        self.store.get_batch(txn, batch_id)
    }

    /// First batch with an id strictly greater than `batch_id`.
    /// [`BatchId::NONE`] yields the first stored batch.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Result<Option<MutationBatch>> {
        self.metadata(txn)?;
        self.store.next_batch_after(txn, batch_id)
    }

    /// Every stored batch, ascending. Reads the whole queue: O(n) in stored
    /// batches.
    pub fn get_all_mutation_batches(&self, txn: &PersistenceTransaction<'_>) -> Result<Vec<MutationBatch>> {
        self.metadata(txn)?;
        self.store.all_batches(txn)
    }

    /// Every batch with id `<= batch_id`, ascending.
    pub fn get_all_mutation_batches_through_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Result<Vec<MutationBatch>> {
        self.metadata(txn)?;
        self.store.batches_through(txn, batch_id)
    }

    /// Batches whose mutations touch `key`, ascending, via the key index.
    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> Result<Vec<MutationBatch>> {
        self.metadata(txn)?;
        let batch_ids = self.store.batch_ids_for_key(txn, key)?;
        self.store.batches_by_ids(txn, batch_ids)
    }

    /// Batches affecting any of `keys`, each listed once, ascending.
    pub fn get_all_mutation_batches_affecting_document_keys<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> Result<Vec<MutationBatch>> {
        self.metadata(txn)?;
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            batch_ids.extend(self.store.batch_ids_for_key(txn, key)?);
        }
        self.store.batches_by_ids(txn, batch_ids)
    }

    /// Batches that could affect the results of `query`, ascending.
    ///
    /// Only the query's target path is considered, so the result may include
    /// batches whose documents the full query would filter out.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> Result<Vec<MutationBatch>> {
        self.metadata(txn)?;

        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let batch_ids = self.store.batch_ids_for_key(txn, &key)?;
            return self.store.batches_by_ids(txn, batch_ids);
        }

        let batch_ids: BTreeSet<BatchId> = self
            .store
            .index_entries_under(txn, query.path())?
            .into_iter()
            .filter(|(key, _)| query.matches_key(key))
            .map(|(_, batch_id)| batch_id)
            .collect();
        self.store.batches_by_ids(txn, batch_ids)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Deletes an acknowledged batch and its index entries, and reports its
    /// keys to the attached garbage collector.
    ///
    /// Fails with [`Error::BatchNotFound`] if the batch is not stored (which
    /// includes a batch already released by garbage collection) and with
    /// [`Error::RemoveUnacknowledged`] if it is still pending.
    pub fn remove_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> Result<()> {
        txn.require_read_write("remove mutation batch")?;
        let metadata = self.metadata(txn)?;
        self.remove_stored_batch(txn, &metadata, batch.batch_id())?;
        Ok(())
    }

    /// Removes each batch in order, all inside `txn`.
    pub fn remove_mutation_batches(
        &self,
        txn: &PersistenceTransaction<'_>,
        batches: &[MutationBatch],
    ) -> Result<()> {
        txn.require_read_write("remove mutation batches")?;
        let metadata = self.metadata(txn)?;
        for batch in batches {
            self.remove_stored_batch(txn, &metadata, batch.batch_id())?;
        }
        Ok(())
    }

    /// Removes the stored copy of `batch_id` and returns the keys it touched.
    fn remove_stored_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        metadata: &QueueMetadata,
        batch_id: BatchId,
    ) -> Result<DocumentKeySet> {
        let stored = self
            .store
            .get_batch(txn, batch_id)?
            .ok_or(Error::BatchNotFound { batch_id })?;

        if batch_id > metadata.last_acknowledged_batch_id {
            return Err(Error::RemoveUnacknowledged {
                batch_id,
                last_acknowledged: metadata.last_acknowledged_batch_id,
            });
        }

        if !self.store.delete_batch(txn, &stored)? {
            return Err(Error::BatchNotFound { batch_id });
        }

        if let Some(gc) = self.garbage_collector.read().as_ref() {
            for key in stored.keys() {
                gc.add_potential_garbage_key(key);
            }
        }

        debug!(user = %self.user(), batch_id = %batch_id, "removed mutation batch");
        Ok(stored.keys().clone())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Verifies that every document index entry points at a stored batch.
    /// An empty queue must have no index entries at all.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) -> Result<()> {
        self.metadata(txn)?;

        if !self.store.has_batches(txn)? {
            let dangling = self.store.index_entry_count(txn)?;
            if dangling > 0 {
                warn!(user = %self.user(), dangling, "empty queue has document index entries");
                return Err(Error::Consistency(format!(
                    "queue for user '{}' is empty but has {dangling} document index entries",
                    self.user()
                )));
            }
            return Ok(());
        }

        let orphans = self.store.orphaned_index_entries(txn)?;
        if let Some((path, batch_id)) = orphans.first() {
            warn!(user = %self.user(), orphans = orphans.len(), "document index references missing batches");
            return Err(Error::Consistency(format!(
                "queue for user '{}' has {} orphaned index entries, first: {path} -> batch {batch_id}",
                self.user(),
                orphans.len()
            )));
        }
        Ok(())
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_>) -> Result<QueueMetadata> {
        self.store
            .read_metadata(txn)?
            .ok_or_else(|| Error::QueueNotStarted {
                user: self.user().to_string(),
            })
    }
}

// =============================================================================
// Garbage Source
// =============================================================================

impl GarbageSource for MutationQueue {
    fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Result<bool> {
        self.store.key_has_batches(txn, key)
    }

    /// Removes every batch at or below the acknowledged id.
    fn release_reclaimable(&self, txn: &PersistenceTransaction<'_>) -> Result<DocumentKeySet> {
        let Some(metadata) = self.store.read_metadata(txn)? else {
            return Ok(DocumentKeySet::new());
        };

        let mut released = DocumentKeySet::new();
        let acknowledged = self
            .store
            .batches_through(txn, metadata.last_acknowledged_batch_id)?;
        for batch in &acknowledged {
            released.extend(self.remove_stored_batch(txn, &metadata, batch.batch_id())?);
        }

        if !acknowledged.is_empty() {
            debug!(
                user = %self.user(),
                batches = acknowledged.len(),
                keys = released.len(),
                "released acknowledged batches"
            );
        }
        Ok(released)
    }
}

// =============================================================================
// Tests
// =============================================================================
