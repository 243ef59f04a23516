mod common;

use std::sync::Arc;

use mutalog::{
    AsyncPersistence, BatchId, EagerGarbageCollector, GarbageCollector, MutationQueue, StreamToken,
    Timestamp, TransactionMode, UserId,
};

async fn started(db: &AsyncPersistence, user: &str) -> Arc<MutationQueue> {
    let queue = Arc::new(MutationQueue::new(UserId::new(user)));
    let q = Arc::clone(&queue);
    db.run_transaction("start", TransactionMode::ReadWrite, move |txn| q.start(txn))
        .await
        .unwrap();
    queue
}

#[tokio::test]
async fn async_add_acknowledge_and_collect() {
    let (_dir, path) = common::create_temp_db_file("async.db");
    let db = AsyncPersistence::open(&path).await.unwrap();
    let queue = started(&db, "alice").await;
    let gc = Arc::new(EagerGarbageCollector::new());
    gc.add_garbage_source(mutalog::garbage_source_handle(&queue));

    let q = Arc::clone(&queue);
    let batch = db
        .run_transaction("add", TransactionMode::ReadWrite, move |txn| {
            q.add_mutation_batch(txn, Timestamp::now(), vec![common::set_mutation("docs/a")])
        })
        .await
        .unwrap();
    assert_eq!(batch.batch_id(), BatchId::FIRST);

    let q = Arc::clone(&queue);
    let acked = batch.clone();
    db.run_transaction("ack", TransactionMode::ReadWrite, move |txn| {
        q.acknowledge_batch(txn, &acked, StreamToken::from("t1"))
    })
    .await
    .unwrap();

    let collector = Arc::clone(&gc);
    let garbage = db
        .run_transaction("gc", TransactionMode::ReadWrite, move |txn| collector.collect_garbage(txn))
        .await
        .unwrap();
    assert_eq!(garbage.len(), 1);

    let q = Arc::clone(&queue);
    let empty = db
        .run_transaction("check", TransactionMode::ReadOnly, move |txn| q.check_empty(txn))
        .await
        .unwrap();
    assert!(empty);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_async_transactions_are_serialized() {
    let db = AsyncPersistence::open_in_memory().unwrap();
    let queue = started(&db, "alice").await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let db = db.clone();
        let q = Arc::clone(&queue);
        tasks.push(tokio::spawn(async move {
            db.run_transaction("add", TransactionMode::ReadWrite, move |txn| {
                q.add_mutation_batch(txn, Timestamp::now(), vec![common::set_mutation(&format!("docs/{i}"))])
            })
            .await
            .unwrap()
            .batch_id()
            .as_raw()
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=16).collect::<Vec<u64>>());
}

#[tokio::test]
async fn async_errors_surface_after_rollback() {
    let db = AsyncPersistence::open_in_memory().unwrap();
    let queue = started(&db, "alice").await;

    let q = Arc::clone(&queue);
    let err = db
        .run_transaction("empty", TransactionMode::ReadWrite, move |txn| {
            q.add_mutation_batch(txn, Timestamp::now(), Vec::new())
        })
        .await
        .unwrap_err();
    assert!(err.is_precondition());
}
