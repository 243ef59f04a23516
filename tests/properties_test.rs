mod common;

use std::collections::BTreeSet;

use proptest::prelude::*;
use mutalog::{BatchId, DocumentKeySet, StreamToken};

const PATHS: [&str; 5] = ["docs/a", "docs/b", "docs/c", "rooms/a", "rooms/a/messages/1"];

/// Each batch is a non-empty set of indices into `PATHS`.
fn batches_strategy() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    prop::collection::vec(prop::collection::btree_set(0..PATHS.len(), 1..=3), 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn ids_strictly_increase_across_removals(batches in batches_strategy(), remove_every in 1usize..4) {
        let queue = common::in_memory_queue("prop");
        let mut expected = 1u64;

        for (i, paths) in batches.iter().enumerate() {
            let mutations = paths.iter().map(|&p| common::set_mutation(PATHS[p])).collect();
            let batch = queue.add_mutation_batch(mutations).unwrap();
            prop_assert_eq!(batch.batch_id().as_raw(), expected);
            expected += 1;

            if i % remove_every == 0 {
                // Acknowledgments arrive in order.
                loop {
                    let acked = queue.get_highest_acknowledged_batch_id().unwrap();
                    match queue.get_next_mutation_batch_after_batch_id(acked).unwrap() {
                        Some(next) => queue.acknowledge_batch(&next, StreamToken::empty()).unwrap(),
                        None => break,
                    }
                }
                let acked = queue.get_highest_acknowledged_batch_id().unwrap();
                prop_assert_eq!(acked, batch.batch_id());
                let removable = queue.get_all_mutation_batches_through_batch_id(acked).unwrap();
                queue.remove_mutation_batches(&removable).unwrap();
                prop_assert!(queue.check_empty().unwrap());
            }
        }
        queue.perform_consistency_check().unwrap();
    }

    #[test]
    fn through_batch_id_is_exact_prefix(batch_count in 1usize..10, n in 0u64..15) {
        let queue = common::in_memory_queue("prop");
        for i in 0..batch_count {
            queue.add_mutation_batch(vec![common::set_mutation(PATHS[i % PATHS.len()])]).unwrap();
        }

        let ids = common::batch_ids(
            &queue.get_all_mutation_batches_through_batch_id(BatchId::from_raw(n)).unwrap(),
        );
        let expected: Vec<u64> = (1..=batch_count as u64).filter(|id| *id <= n).collect();
        prop_assert_eq!(ids, expected);
    }

    #[test]
    fn key_union_is_sorted_and_deduplicated(batches in batches_strategy(), probe in prop::collection::btree_set(0..PATHS.len(), 1..=5)) {
        let queue = common::in_memory_queue("prop");
        for paths in &batches {
            let mutations = paths.iter().map(|&p| common::set_mutation(PATHS[p])).collect();
            queue.add_mutation_batch(mutations).unwrap();
        }

        let keys: DocumentKeySet = probe.iter().map(|&p| common::key(PATHS[p])).collect();
        let union = common::batch_ids(
            &queue.get_all_mutation_batches_affecting_document_keys(&keys).unwrap(),
        );

        let expected: Vec<u64> = batches
            .iter()
            .enumerate()
            .filter(|(_, paths)| paths.iter().any(|p| probe.contains(p)))
            .map(|(i, _)| i as u64 + 1)
            .collect();
        prop_assert_eq!(union, expected);
    }
}
