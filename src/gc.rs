//! # Garbage Collection
//!
//! Documents stay cached locally while anything still needs them: a pending
//! or not-yet-removed batch, or a local view pinning them. A
//! [`GarbageCollector`] tracks *potential* garbage (keys whose last known
//! reference just went away) and, when asked, reports which of those keys no
//! registered [`GarbageSource`] still holds.
//!
//! ## Collection Pass
//!
//! ```text
//! collect_garbage(txn)
//!   1. every source: release_reclaimable(txn)   queue drops acked batches
//!   2. candidates = potential keys ∪ released keys
//!   3. garbage    = candidates no source contains
//!   4. clear the candidates from the potential set, return garbage
//! ```
//!
//! Step 4 happens only after every source check succeeded, so an error
//! mid-pass keeps all candidates for the next pass. A rolled-back release
//! leaves its batches stored; the next pass releases them again.
//!
//! Sources are held as [`Weak`] references. The collector never keeps a
//! queue or reference set alive, and dropped sources are pruned on the next
//! pass. Locks are never held while calling into a source.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::persistence::PersistenceTransaction;
use crate::types::{DocumentKey, DocumentKeySet};

// =============================================================================
// Traits
// =============================================================================

/// Something that can keep documents alive.
pub trait GarbageSource: Send + Sync {
    /// True if this source still references `key`.
    fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Result<bool>;

    /// Drops state the source no longer needs and returns the keys that state
    /// referenced. The default holds nothing reclaimable.
    fn release_reclaimable(&self, _txn: &PersistenceTransaction<'_>) -> Result<DocumentKeySet> {
        Ok(DocumentKeySet::new())
    }
}

/// Decides which documents are no longer referenced by anything.
pub trait GarbageCollector: Send + Sync {
    /// True if garbage is tracked key-by-key as references disappear.
    fn is_eager(&self) -> bool;

    fn add_garbage_source(&self, source: Weak<dyn GarbageSource>);

    fn remove_garbage_source(&self, source: &Weak<dyn GarbageSource>);

    /// Records that `key` may have lost its last reference.
    fn add_potential_garbage_key(&self, key: &DocumentKey);

    /// Runs one collection pass and returns the keys that became garbage.
    ///
    /// Requires a read-write transaction. Calling it again without
    /// intervening changes returns the empty set.
    fn collect_garbage(&self, txn: &PersistenceTransaction<'_>) -> Result<DocumentKeySet>;
}

/// Weak handle to `source` suitable for [`GarbageCollector::add_garbage_source`].
pub fn garbage_source_handle<S>(source: &Arc<S>) -> Weak<dyn GarbageSource>
where
    S: GarbageSource + 'static,
{
    let source: Arc<dyn GarbageSource> = source.clone();
    Arc::downgrade(&source)
}

// =============================================================================
// Eager Collector
// =============================================================================

/// Collector that tracks potential garbage as references are dropped and
/// resolves it against all registered sources on every pass.
#[derive(Default)]
pub struct EagerGarbageCollector {
    sources: Mutex<Vec<Weak<dyn GarbageSource>>>,
    potential_garbage: Mutex<DocumentKeySet>,
}

impl EagerGarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys awaiting the next pass.
    pub fn pending_key_count(&self) -> usize {
        self.potential_garbage.lock().len()
    }

    /// Live sources, pruning any that were dropped.
    fn live_sources(&self) -> Vec<Arc<dyn GarbageSource>> {
        let mut sources = self.sources.lock();
        sources.retain(|weak| weak.strong_count() > 0);
        sources.iter().filter_map(Weak::upgrade).collect()
    }
}

impl std::fmt::Debug for EagerGarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EagerGarbageCollector")
            .field("sources", &self.sources.lock().len())
            .field("potential_garbage", &self.potential_garbage.lock().len())
            .finish()
    }
}

impl GarbageCollector for EagerGarbageCollector {
    fn is_eager(&self) -> bool {
        true
    }

    fn add_garbage_source(&self, source: Weak<dyn GarbageSource>) {
        self.sources.lock().push(source);
    }

    fn remove_garbage_source(&self, source: &Weak<dyn GarbageSource>) {
        self.sources.lock().retain(|existing| !Weak::ptr_eq(existing, source));
    }

    fn add_potential_garbage_key(&self, key: &DocumentKey) {
        self.potential_garbage.lock().insert(key.clone());
    }

    fn collect_garbage(&self, txn: &PersistenceTransaction<'_>) -> Result<DocumentKeySet> {
        txn.require_read_write("collect garbage")?;
        let sources = self.live_sources();

        let mut candidates = DocumentKeySet::new();
        for source in &sources {
            candidates.extend(source.release_reclaimable(txn)?);
        }
        candidates.extend(self.potential_garbage.lock().iter().cloned());

        let mut garbage = DocumentKeySet::new();
        for key in &candidates {
            let mut referenced = false;
            for source in &sources {
                if source.contains_key(txn, key)? {
                    referenced = true;
                    break;
                }
            }
            if !referenced {
                garbage.insert(key.clone());
            }
        }

        {
            let mut potential = self.potential_garbage.lock();
            for key in &candidates {
                potential.remove(key);
            }
        }

        if garbage.is_empty() {
            debug!(label = txn.label(), candidates = candidates.len(), "no garbage collected");
        } else {
            info!(
                label = txn.label(),
                candidates = candidates.len(),
                collected = garbage.len(),
                "collected garbage"
            );
        }
        Ok(garbage)
    }
}

// =============================================================================
// No-op Collector
// =============================================================================

/// Collector that never collects anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpGarbageCollector;

impl GarbageCollector for NoOpGarbageCollector {
    fn is_eager(&self) -> bool {
        false
    }

    fn add_garbage_source(&self, _source: Weak<dyn GarbageSource>) {}

    fn remove_garbage_source(&self, _source: &Weak<dyn GarbageSource>) {}

    fn add_potential_garbage_key(&self, _key: &DocumentKey) {}

    fn collect_garbage(&self, txn: &PersistenceTransaction<'_>) -> Result<DocumentKeySet> {
        txn.require_read_write("collect garbage")?;
        Ok(DocumentKeySet::new())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::persistence::{Persistence, TransactionMode};
    use std::collections::BTreeSet;

    /// In-memory source holding a fixed set of keys.
    struct PinnedKeys(Mutex<BTreeSet<DocumentKey>>);

    impl PinnedKeys {
        fn new(keys: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(keys.iter().map(|k| key(k)).collect())))
        }
    }

    impl GarbageSource for PinnedKeys {
        fn contains_key(&self, _txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Result<bool> {
            Ok(self.0.lock().contains(key))
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn collect(persistence: &Persistence, gc: &dyn GarbageCollector) -> DocumentKeySet {
        persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| gc.collect_garbage(txn))
            .unwrap()
    }

    #[test]
    fn test_unreferenced_keys_are_collected_once() {
        let persistence = Persistence::open_in_memory().unwrap();
        let gc = EagerGarbageCollector::new();
        let pinned = PinnedKeys::new(&["rooms/a"]);
        gc.add_garbage_source(garbage_source_handle(&pinned));

        gc.add_potential_garbage_key(&key("rooms/a"));
        gc.add_potential_garbage_key(&key("rooms/b"));

        let garbage = collect(&persistence, &gc);
        assert_eq!(garbage, BTreeSet::from([key("rooms/b")]));
        assert_eq!(gc.pending_key_count(), 0);
        assert!(collect(&persistence, &gc).is_empty());
    }

    #[test]
    fn test_dropped_source_is_pruned() {
        let persistence = Persistence::open_in_memory().unwrap();
        let gc = EagerGarbageCollector::new();
        let pinned = PinnedKeys::new(&["rooms/a"]);
        gc.add_garbage_source(garbage_source_handle(&pinned));
        drop(pinned);

        gc.add_potential_garbage_key(&key("rooms/a"));
        assert_eq!(collect(&persistence, &gc), BTreeSet::from([key("rooms/a")]));
        assert!(gc.live_sources().is_empty());
    }

    #[test]
    fn test_removed_source_no_longer_pins() {
        let persistence = Persistence::open_in_memory().unwrap();
        let gc = EagerGarbageCollector::new();
        let pinned = PinnedKeys::new(&["rooms/a"]);
        let handle = garbage_source_handle(&pinned);
        gc.add_garbage_source(handle.clone());
        gc.remove_garbage_source(&handle);

        gc.add_potential_garbage_key(&key("rooms/a"));
        assert_eq!(collect(&persistence, &gc), BTreeSet::from([key("rooms/a")]));
    }

    #[test]
    fn test_collection_requires_read_write() {
        let persistence = Persistence::open_in_memory().unwrap();
        let gc = EagerGarbageCollector::new();
        gc.add_potential_garbage_key(&key("rooms/a"));

        let err = persistence
            .run_transaction("gc", TransactionMode::ReadOnly, |txn| gc.collect_garbage(txn))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyTransaction { .. }));
        assert_eq!(gc.pending_key_count(), 1);
    }

    #[test]
    fn test_noop_collector_collects_nothing() {
        let persistence = Persistence::open_in_memory().unwrap();
        let gc = NoOpGarbageCollector;
        gc.add_potential_garbage_key(&key("rooms/a"));
        assert!(!gc.is_eager());
        assert!(collect(&persistence, &gc).is_empty());
    }
}
