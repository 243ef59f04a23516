mod common;

use std::sync::Arc;

use mutalog::{AutocommitQueue, Error, Persistence, StreamToken};

fn reopen(path: &std::path::Path, user: &str) -> AutocommitQueue {
    let persistence = Arc::new(Persistence::open(path).unwrap());
    let queue = common::start_queue(&persistence, user);
    AutocommitQueue::new(persistence, queue)
}

#[test]
fn restart_recovers_batches_acknowledgment_and_token() {
    let (_dir, path) = common::create_temp_db_file("restart.db");

    // First process.
    let first = reopen(&path, "alice");
    let b1 = first.add_mutation_batch(vec![common::set_mutation("docs/a")]).unwrap();
    let b2 = first
        .add_mutation_batch(vec![common::set_mutation("docs/b"), common::delete_mutation("docs/c")])
        .unwrap();
    first.acknowledge_batch(&b1, StreamToken::from(vec![9u8, 8, 7])).unwrap();
    drop(first);

    // Second process.
    let second = reopen(&path, "alice");
    assert_eq!(second.get_highest_acknowledged_batch_id().unwrap(), b1.batch_id());
    assert_eq!(second.get_last_stream_token().unwrap().as_bytes(), &[9u8, 8, 7]);
    assert_eq!(second.get_all_mutation_batches().unwrap(), vec![b1, b2.clone()]);
    assert_eq!(
        second
            .get_all_mutation_batches_affecting_document_key(&common::key("docs/c"))
            .unwrap(),
        vec![b2]
    );

    let b3 = second.add_mutation_batch(vec![common::set_mutation("docs/d")]).unwrap();
    assert_eq!(b3.batch_id().as_raw(), 3);
}

#[test]
fn ids_not_reused_after_removing_everything_and_restarting() {
    let (_dir, path) = common::create_temp_db_file("reuse.db");

    let first = reopen(&path, "alice");
    let mut batches = Vec::new();
    for i in 0..3 {
        let batch = first
            .add_mutation_batch(vec![common::set_mutation(&format!("docs/{i}"))])
            .unwrap();
        first.acknowledge_batch(&batch, StreamToken::empty()).unwrap();
        batches.push(batch);
    }
    first.remove_mutation_batches(&batches).unwrap();
    assert!(first.check_empty().unwrap());
    drop(first);

    let second = reopen(&path, "alice");
    assert!(second.check_empty().unwrap());
    let next = second.add_mutation_batch(vec![common::set_mutation("docs/x")]).unwrap();
    assert_eq!(next.batch_id().as_raw(), 4);
}

#[test]
fn start_rejects_acknowledged_id_beyond_high_water_mark() {
    let (_dir, path) = common::create_temp_db_file("bad-ack.db");
    {
        let queue = reopen(&path, "alice");
        queue.add_mutation_batch(vec![common::set_mutation("docs/a")]).unwrap();
    }

    let conn = common::open_read_write(&path);
    conn.execute(
        "UPDATE mutation_queues SET last_acknowledged_batch_id = 5 WHERE user_id = 'alice'",
        [],
    )
    .unwrap();
    drop(conn);

    let persistence = Persistence::open(&path).unwrap();
    let queue = mutalog::MutationQueue::new(mutalog::UserId::new("alice"));
    let err = persistence
        .run_transaction("start", mutalog::TransactionMode::ReadWrite, |txn| queue.start(txn))
        .unwrap_err();
    assert!(matches!(err, Error::Consistency(_)));
}

#[test]
fn start_rejects_stored_batch_beyond_high_water_mark() {
    let (_dir, path) = common::create_temp_db_file("bad-high.db");
    {
        let queue = reopen(&path, "alice");
        queue.add_mutation_batch(vec![common::set_mutation("docs/a")]).unwrap();
        queue.add_mutation_batch(vec![common::set_mutation("docs/b")]).unwrap();
    }

    let conn = common::open_read_write(&path);
    conn.execute(
        "UPDATE mutation_queues SET highest_batch_id = 1 WHERE user_id = 'alice'",
        [],
    )
    .unwrap();
    drop(conn);

    let persistence = Persistence::open(&path).unwrap();
    let queue = mutalog::MutationQueue::new(mutalog::UserId::new("alice"));
    let err = persistence
        .run_transaction("start", mutalog::TransactionMode::ReadWrite, |txn| queue.start(txn))
        .unwrap_err();
    assert_eq!(err.kind(), mutalog::ErrorKind::Consistency);
}

#[test]
fn data_is_readable_from_plain_connection_after_restart() {
    let (_dir, path) = common::create_temp_db_file("inspect.db");
    {
        let queue = reopen(&path, "alice");
        queue
            .add_mutation_batch(vec![common::set_mutation("docs/a"), common::set_mutation("docs/b")])
            .unwrap();
    }

    let conn = common::open_read_only(&path);
    let (batches, index_rows): (i64, i64) = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM mutations), (SELECT COUNT(*) FROM document_mutations)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(batches, 1);
    assert_eq!(index_rows, 2);
}
