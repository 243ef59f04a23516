#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use mutalog::{
    AutocommitQueue, DocumentKey, Mutation, MutationQueue, Persistence, TransactionMode, UserId,
};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Persistence::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::parse(path).expect("valid document key")
}

/// A set mutation whose body records its own path.
pub fn set_mutation(path: &str) -> Mutation {
    Mutation::set(key(path), json!({ "path": path }))
}

pub fn patch_mutation(path: &str) -> Mutation {
    Mutation::patch(key(path), json!({ "a": 1 }), vec!["a".to_string()])
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

/// Opens `persistence` for `user` and starts the queue.
pub fn start_queue(persistence: &Persistence, user: &str) -> Arc<MutationQueue> {
    let queue = Arc::new(MutationQueue::new(UserId::new(user)));
    persistence
        .run_transaction("start", TransactionMode::ReadWrite, |txn| queue.start(txn))
        .expect("start queue");
    queue
}

/// In-memory persistence with a started autocommit queue for `user`.
pub fn in_memory_queue(user: &str) -> AutocommitQueue {
    let persistence = Arc::new(Persistence::open_in_memory().expect("open in-memory database"));
    let queue = start_queue(&persistence, user);
    AutocommitQueue::new(persistence, queue)
}

pub fn batch_ids(batches: &[mutalog::MutationBatch]) -> Vec<u64> {
    batches.iter().map(|b| b.batch_id().as_raw()).collect()
}
