//! # Autocommit Queue
//!
//! Wraps each [`MutationQueue`] operation in its own transaction. Lookups
//! open read-only transactions; anything that touches ids, acknowledgment or
//! the stream token opens a read-write one.
//!
//! Use this when a single operation is the whole unit of work. Compose
//! several operations atomically with [`Persistence::run_transaction`]
//! directly.

use std::sync::Arc;

use crate::error::Result;
use crate::gc::GarbageCollector;
use crate::mutation::{Mutation, MutationBatch};
use crate::persistence::Persistence;
use crate::persistence::TransactionMode::{ReadOnly, ReadWrite};
use crate::query::Query;
use crate::queue::MutationQueue;
use crate::types::{BatchId, DocumentKey, DocumentKeySet, StreamToken, Timestamp};

/// A [`MutationQueue`] bound to a [`Persistence`], one transaction per call.
#[derive(Debug, Clone)]
pub struct AutocommitQueue {
    persistence: Arc<Persistence>,
    queue: Arc<MutationQueue>,
}

impl AutocommitQueue {
    pub fn new(persistence: Arc<Persistence>, queue: Arc<MutationQueue>) -> Self {
        Self { persistence, queue }
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn start(&self) -> Result<()> {
        self.persistence
            .run_transaction("start", ReadWrite, |txn| self.queue.start(txn))
    }

    pub fn check_empty(&self) -> Result<bool> {
        self.persistence
            .run_transaction("check_empty", ReadOnly, |txn| self.queue.check_empty(txn))
    }

    pub fn get_highest_acknowledged_batch_id(&self) -> Result<BatchId> {
        self.persistence.run_transaction("get_highest_acknowledged_batch_id", ReadOnly, |txn| {
            self.queue.get_highest_acknowledged_batch_id(txn)
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> Result<BatchId> {
        self.persistence.run_transaction("get_highest_unacknowledged_batch_id", ReadOnly, |txn| {
            self.queue.get_highest_unacknowledged_batch_id(txn)
        })
    }

    pub fn acknowledge_batch(&self, batch: &MutationBatch, stream_token: StreamToken) -> Result<()> {
        self.persistence.run_transaction("acknowledge_batch", ReadWrite, |txn| {
            self.queue.acknowledge_batch(txn, batch, stream_token)
        })
    }

    pub fn get_last_stream_token(&self) -> Result<StreamToken> {
        self.persistence
            .run_transaction("get_last_stream_token", ReadOnly, |txn| {
                self.queue.get_last_stream_token(txn)
            })
    }

    pub fn set_last_stream_token(&self, stream_token: StreamToken) -> Result<()> {
        self.persistence.run_transaction("set_last_stream_token", ReadWrite, |txn| {
            self.queue.set_last_stream_token(txn, stream_token)
        })
    }

    /// Adds a batch stamped with the current time.
    pub fn add_mutation_batch(&self, mutations: Vec<Mutation>) -> Result<MutationBatch> {
        self.persistence.run_transaction("add_mutation_batch", ReadWrite, |txn| {
            self.queue.add_mutation_batch(txn, Timestamp::now(), mutations)
        })
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Result<Option<MutationBatch>> {
        self.persistence.run_transaction("lookup_mutation_batch", ReadOnly, |txn| {
            self.queue.lookup_mutation_batch(txn, batch_id)
        })
    }

    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        batch_id: BatchId,
    ) -> Result<Option<MutationBatch>> {
        self.persistence.run_transaction("get_next_mutation_batch_after_batch_id", ReadOnly, |txn| {
            self.queue.get_next_mutation_batch_after_batch_id(txn, batch_id)
        })
    }

    pub fn get_all_mutation_batches(&self) -> Result<Vec<MutationBatch>> {
        self.persistence.run_transaction("get_all_mutation_batches", ReadOnly, |txn| {
            self.queue.get_all_mutation_batches(txn)
        })
    }

    pub fn get_all_mutation_batches_through_batch_id(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<MutationBatch>> {
        self.persistence.run_transaction(
            "get_all_mutation_batches_through_batch_id",
            ReadOnly,
            |txn| self.queue.get_all_mutation_batches_through_batch_id(txn, batch_id),
        )
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Result<Vec<MutationBatch>> {
        self.persistence.run_transaction(
            "get_all_mutation_batches_affecting_document_key",
            ReadOnly,
            |txn| self.queue.get_all_mutation_batches_affecting_document_key(txn, key),
        )
    }

    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        keys: &DocumentKeySet,
    ) -> Result<Vec<MutationBatch>> {
        self.persistence.run_transaction(
            "get_all_mutation_batches_affecting_document_keys",
            ReadOnly,
            |txn| self.queue.get_all_mutation_batches_affecting_document_keys(txn, keys),
        )
    }

    pub fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Result<Vec<MutationBatch>> {
        self.persistence.run_transaction(
            "get_all_mutation_batches_affecting_query",
            ReadOnly,
            |txn| self.queue.get_all_mutation_batches_affecting_query(txn, query),
        )
    }

    pub fn remove_mutation_batch(&self, batch: &MutationBatch) -> Result<()> {
        self.persistence.run_transaction("remove_mutation_batch", ReadWrite, |txn| {
            self.queue.remove_mutation_batch(txn, batch)
        })
    }

    /// Removes `batches` in one read-write transaction.
    pub fn remove_mutation_batches(&self, batches: &[MutationBatch]) -> Result<()> {
        self.persistence.run_transaction("remove_mutation_batches", ReadWrite, |txn| {
            self.queue.remove_mutation_batches(txn, batches)
        })
    }

    pub fn perform_consistency_check(&self) -> Result<()> {
        self.persistence.run_transaction("perform_consistency_check", ReadOnly, |txn| {
            self.queue.perform_consistency_check(txn)
        })
    }

    /// Runs one pass of `gc` in its own read-write transaction.
    pub fn collect_garbage(&self, gc: &dyn GarbageCollector) -> Result<DocumentKeySet> {
        self.persistence
            .run_transaction("collect_garbage", ReadWrite, |txn| gc.collect_garbage(txn))
    }
}
