//! Advisory locks serializing fragment work per collection.
//!
//! A mutation holds the locks of every collection it reads fragments from or
//! writes fragments to, from the first read until commit. Sketches outside
//! any collection lock on their own id. Keys are always taken in sorted
//! order so two mutations touching the same pair cannot deadlock.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use foundation::SketchId;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Collection(SketchId),
    Sketch(SketchId),
}

impl LockKey {
    /// Key guarding a sketch's fragments: its effective collection if it has
    /// one, otherwise the sketch itself.
    pub fn for_sketch(sketch: SketchId, collection: Option<SketchId>) -> Self {
        match collection {
            Some(c) => LockKey::Collection(c),
            None => LockKey::Sketch(sketch),
        }
    }
}

#[derive(Default)]
pub struct CollectionLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Releases every held lock on drop.
pub struct CollectionGuard {
    keys: Vec<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl CollectionGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl CollectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> CollectionGuard {
        let keys: Vec<LockKey> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.locks.entry(*key).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        debug!(?keys, "collection locks held");
        CollectionGuard {
            keys,
            _guards: guards,
        }
    }

    /// Number of keys ever locked. Entries are kept for reuse.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
