//! # Reference Set
//!
//! In-memory pins of `(document, target)` pairs: which local views currently
//! hold which documents. A document stays referenced while at least one
//! target pins it; dropping its last pin reports it to the attached
//! [`GarbageCollector`] as potential garbage.
//!
//! Both directions are kept as ordered sets so that "who pins this key" and
//! "what does this target pin" are range scans:
//!
//! ```text
//! by_key:    (rooms/a, 1) (rooms/a, 2) (rooms/b, 2)
//! by_target: (1, rooms/a) (2, rooms/a) (2, rooms/b)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::gc::{GarbageCollector, GarbageSource};
use crate::persistence::PersistenceTransaction;
use crate::types::{DocumentKey, DocumentKeySet, TargetId};

#[derive(Debug, Default)]
struct References {
    by_key: BTreeSet<(DocumentKey, TargetId)>,
    by_target: BTreeSet<(TargetId, DocumentKey)>,
}

impl References {
    fn insert(&mut self, key: &DocumentKey, target: TargetId) {
        self.by_key.insert((key.clone(), target));
        self.by_target.insert((target, key.clone()));
    }

    /// Removes one pin. Returns true if it was the key's last.
    fn remove(&mut self, key: &DocumentKey, target: TargetId) -> bool {
        let existed = self.by_key.remove(&(key.clone(), target));
        self.by_target.remove(&(target, key.clone()));
        existed && !self.contains_key(key)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), TargetId::new(0))..)
            .next()
            .is_some_and(|(pinned, _)| pinned == key)
    }

    fn keys_for_target(&self, target: TargetId) -> DocumentKeySet {
        self.by_target
            .range((target, DocumentKey::range_floor())..)
            .take_while(|(t, _)| *t == target)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

/// Reference-counted document pins held by local views.
#[derive(Default)]
pub struct ReferenceSet {
    references: Mutex<References>,
    garbage_collector: RwLock<Option<Arc<dyn GarbageCollector>>>,
}

impl std::fmt::Debug for ReferenceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceSet")
            .field("references", &self.references.lock().by_key.len())
            .finish_non_exhaustive()
    }
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the collector told about keys losing their last pin.
    pub fn set_garbage_collector(&self, gc: Option<Arc<dyn GarbageCollector>>) {
        *self.garbage_collector.write() = gc;
    }

    pub fn is_empty(&self) -> bool {
        self.references.lock().by_key.is_empty()
    }

    pub fn add_reference(&self, key: &DocumentKey, target: TargetId) {
        self.references.lock().insert(key, target);
    }

    pub fn add_references<'k>(&self, keys: impl IntoIterator<Item = &'k DocumentKey>, target: TargetId) {
        let mut references = self.references.lock();
        for key in keys {
            references.insert(key, target);
        }
    }

    pub fn remove_reference(&self, key: &DocumentKey, target: TargetId) {
        let released = self.references.lock().remove(key, target);
        if released {
            self.report_garbage([key]);
        }
    }

    pub fn remove_references<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target: TargetId,
    ) {
        let released: Vec<&DocumentKey> = {
            let mut references = self.references.lock();
            keys.into_iter()
                .filter(|key| references.remove(key, target))
                .collect()
        };
        self.report_garbage(released);
    }

    /// Drops every pin held by `target` and returns the keys it pinned.
    pub fn remove_references_for_id(&self, target: TargetId) -> DocumentKeySet {
        let (pinned, released) = {
            let mut references = self.references.lock();
            let pinned = references.keys_for_target(target);
            let released: Vec<DocumentKey> = pinned
                .iter()
                .filter(|key| references.remove(key, target))
                .cloned()
                .collect();
            (pinned, released)
        };
        self.report_garbage(&released);
        pinned
    }

    /// Drops every pin of every target.
    pub fn remove_all_references(&self) {
        let released: DocumentKeySet = {
            let mut references = self.references.lock();
            let keys = references.by_key.iter().map(|(key, _)| key.clone()).collect();
            *references = References::default();
            keys
        };
        self.report_garbage(&released);
    }

    /// Keys pinned by `target`.
    pub fn references_for_id(&self, target: TargetId) -> DocumentKeySet {
        self.references.lock().keys_for_target(target)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.lock().contains_key(key)
    }

    fn report_garbage<'k>(&self, keys: impl IntoIterator<Item = &'k DocumentKey>) {
        if let Some(gc) = self.garbage_collector.read().as_ref() {
            for key in keys {
                gc.add_potential_garbage_key(key);
            }
        }
    }
}

impl GarbageSource for ReferenceSet {
    fn contains_key(&self, _txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Result<bool> {
        Ok(ReferenceSet::contains_key(self, key))
    }
}
