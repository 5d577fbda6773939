//! Persistence for sketches, folders and fragments.
//!
//! `SketchStore` mirrors the row operations and stored procedures the
//! orchestration layer relies on. `InMemorySketchStore` implements it over
//! sorted maps; `Database` wraps any cloneable store with async access and
//! all-or-nothing transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use foundation::{Envelope, FolderId, GeographyId, SketchClassId, SketchId, UserId};
use overlay::geometry::polygon_envelope;
use overlay::{FragmentHash, GeographySettings, SketchFragment};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{CopyResult, Folder, NewSketch, Parent, Sketch, SketchClass, SketchClassKind, StoredFragment, TocItem};

pub trait SketchStore {
    fn sketch(&self, id: SketchId) -> Result<Option<Sketch>, StoreError>;
    fn insert_sketch(&mut self, sketch: NewSketch) -> Result<SketchId, StoreError>;
    fn update_sketch(&mut self, sketch: Sketch) -> Result<(), StoreError>;
    /// Removes the row and its fragment associations.
    fn delete_sketch(&mut self, id: SketchId) -> Result<bool, StoreError>;

    fn folder(&self, id: FolderId) -> Result<Option<Folder>, StoreError>;
    fn insert_folder(&mut self, name: String, user_id: UserId, parent: Parent) -> Result<FolderId, StoreError>;
    fn update_folder(&mut self, folder: Folder) -> Result<(), StoreError>;
    fn delete_folder(&mut self, id: FolderId) -> Result<bool, StoreError>;

    fn sketch_class(&self, id: SketchClassId) -> Result<Option<SketchClass>, StoreError>;
    fn upsert_sketch_class(&mut self, class: SketchClass) -> Result<(), StoreError>;
    fn geography(&self, id: GeographyId) -> Result<Option<GeographySettings>, StoreError>;
    fn upsert_geography(&mut self, geography: GeographySettings) -> Result<(), StoreError>;

    /// Nearest collection at or above `parent`, walking through folders.
    fn parent_collection_id(&self, parent: Parent) -> Result<Option<SketchId>, StoreError>;
    /// Every descendant of `item`, depth first, excluding `item` itself.
    fn child_items_recursive(&self, item: TocItem) -> Result<Vec<TocItem>, StoreError>;
    /// Non-collection sketches whose effective collection is `collection`.
    fn collection_members(&self, collection: SketchId) -> Result<Vec<SketchId>, StoreError>;
    /// Copies `item` and its descendants for `user_id`, placing the copy at
    /// `parent`. Copied sketches keep the fragments of their originals.
    fn copy_toc_item_recursive(&mut self, item: TocItem, user_id: UserId, parent: Parent) -> Result<CopyResult, StoreError>;

    fn fragments_for_sketch(&self, id: SketchId) -> Result<Vec<StoredFragment>, StoreError>;
    fn fragment_sketch_ids(&self, hash: &FragmentHash) -> Result<BTreeSet<SketchId>, StoreError>;
    /// Fragments of `sketch_ids` whose bbox touches any envelope, attributed
    /// to every sketch in `sketch_ids` they are associated with.
    fn overlapping_fragments(&self, sketch_ids: &[SketchId], envelopes: &[Envelope]) -> Result<Vec<SketchFragment>, StoreError>;
    /// Upserts `fragments` and makes them the sketch's complete set.
    fn replace_sketch_fragments(&mut self, id: SketchId, fragments: Vec<StoredFragment>) -> Result<(), StoreError>;
    /// Deletes any of `hashes` no sketch references any longer.
    fn cleanup_orphaned_fragments(&mut self, hashes: &BTreeSet<FragmentHash>) -> Result<usize, StoreError>;
}

/// Stored fragments of `id` as fragments attributed to `id` and to any of
/// `scope` sharing them.
pub fn sketch_fragments_within<S: SketchStore + ?Sized>(
    store: &S,
    id: SketchId,
    scope: &BTreeSet<SketchId>,
) -> Result<Vec<SketchFragment>, StoreError> {
    let mut out = Vec::new();
    for stored in store.fragments_for_sketch(id)? {
        let owners = store.fragment_sketch_ids(&stored.hash)?;
        let attributed = owners.into_iter().filter(|s| *s == id || scope.contains(s));
        out.push(stored.to_fragment(attributed));
    }
    Ok(out)
}

/// Rows shared between clones of a store. A write copies the map of row
/// pointers once, never the rows themselves.
type Table<K, V> = Arc<BTreeMap<K, Arc<V>>>;

fn rows_mut<K: Ord + Clone, V>(table: &mut Table<K, V>) -> &mut BTreeMap<K, Arc<V>> {
    Arc::make_mut(table)
}

/// Sorted-map store. Cloning is cheap: tables are shared until written, so a
/// snapshot or transaction copy costs one pointer per table.
#[derive(Debug, Default, Clone)]
pub struct InMemorySketchStore {
    sketches: Table<SketchId, Sketch>,
    folders: Table<FolderId, Folder>,
    classes: Table<SketchClassId, SketchClass>,
    geographies: Table<GeographyId, GeographySettings>,
    fragments: Table<FragmentHash, StoredFragment>,
    associations: Arc<BTreeMap<SketchId, BTreeSet<FragmentHash>>>,
    next_sketch_id: i64,
    next_folder_id: i64,
}

impl InMemorySketchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    fn is_collection(&self, id: SketchId) -> bool {
        self.sketches
            .get(&id)
            .and_then(|s| self.classes.get(&s.sketch_class_id))
            .is_some_and(|c| c.kind == SketchClassKind::Collection)
    }

    fn children(&self, item: TocItem) -> Vec<TocItem> {
        let parent = match item {
            TocItem::Sketch(id) => Parent::Collection(id),
            TocItem::Folder(id) => Parent::Folder(id),
        };
        let folders = self
            .folders
            .values()
            .filter(|f| f.parent == parent)
            .map(|f| TocItem::Folder(f.id));
        let sketches = self
            .sketches
            .values()
            .filter(|s| s.parent == parent)
            .map(|s| TocItem::Sketch(s.id));
        folders.chain(sketches).collect()
    }

    fn copy_item(
        &mut self,
        item: TocItem,
        user_id: UserId,
        parent: Parent,
        result: &mut CopyResult,
    ) -> Result<TocItem, StoreError> {
        let children = self.children(item);
        let copied = match item {
            TocItem::Sketch(id) => {
                let original = self
                    .sketches
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| StoreError::Missing(format!("sketch {id}")))?;
                let new_id = self.insert_sketch(NewSketch {
                    name: original.name.clone(),
                    sketch_class_id: original.sketch_class_id,
                    user_id,
                    parent,
                    user_geom: original.user_geom.clone(),
                    geom: original.geom.clone(),
                    properties: original.properties.clone(),
                })?;
                let hashes = self.associations.get(&id).cloned().unwrap_or_default();
                if !hashes.is_empty() {
                    Arc::make_mut(&mut self.associations).insert(new_id, hashes);
                }
                result.sketch_ids.push(new_id);
                result.copied_from.insert(new_id, id);
                TocItem::Sketch(new_id)
            }
            TocItem::Folder(id) => {
                let original = self
                    .folders
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| StoreError::Missing(format!("folder {id}")))?;
                let new_id = self.insert_folder(original.name.clone(), user_id, parent)?;
                result.folder_ids.push(new_id);
                TocItem::Folder(new_id)
            }
        };

        let child_parent = match copied {
            TocItem::Sketch(id) => Parent::Collection(id),
            TocItem::Folder(id) => Parent::Folder(id),
        };
        for child in children {
            self.copy_item(child, user_id, child_parent, result)?;
        }
        Ok(copied)
    }
}

impl SketchStore for InMemorySketchStore {
    fn sketch(&self, id: SketchId) -> Result<Option<Sketch>, StoreError> {
        Ok(self.sketches.get(&id).map(|s| Sketch::clone(s)))
    }

    fn insert_sketch(&mut self, sketch: NewSketch) -> Result<SketchId, StoreError> {
        if !self.classes.contains_key(&sketch.sketch_class_id) {
            return Err(StoreError::Constraint(format!(
                "unknown sketch class {}",
                sketch.sketch_class_id
            )));
        }
        self.next_sketch_id += 1;
        let id = SketchId::new(self.next_sketch_id);
        rows_mut(&mut self.sketches).insert(id, Arc::new(sketch.into_sketch(id)));
        Ok(id)
    }

    fn update_sketch(&mut self, sketch: Sketch) -> Result<(), StoreError> {
        if !self.sketches.contains_key(&sketch.id) {
            return Err(StoreError::Missing(format!("sketch {}", sketch.id)));
        }
        rows_mut(&mut self.sketches).insert(sketch.id, Arc::new(sketch));
        Ok(())
    }

    fn delete_sketch(&mut self, id: SketchId) -> Result<bool, StoreError> {
        if self.associations.contains_key(&id) {
            Arc::make_mut(&mut self.associations).remove(&id);
        }
        if !self.sketches.contains_key(&id) {
            return Ok(false);
        }
        Ok(rows_mut(&mut self.sketches).remove(&id).is_some())
    }

    fn folder(&self, id: FolderId) -> Result<Option<Folder>, StoreError> {
        Ok(self.folders.get(&id).map(|f| Folder::clone(f)))
    }

    fn insert_folder(&mut self, name: String, user_id: UserId, parent: Parent) -> Result<FolderId, StoreError> {
        self.next_folder_id += 1;
        let id = FolderId::new(self.next_folder_id);
        rows_mut(&mut self.folders).insert(
            id,
            Arc::new(Folder {
                id,
                name,
                user_id,
                parent,
            }),
        );
        Ok(id)
    }

    fn update_folder(&mut self, folder: Folder) -> Result<(), StoreError> {
        if !self.folders.contains_key(&folder.id) {
            return Err(StoreError::Missing(format!("folder {}", folder.id)));
        }
        rows_mut(&mut self.folders).insert(folder.id, Arc::new(folder));
        Ok(())
    }

    fn delete_folder(&mut self, id: FolderId) -> Result<bool, StoreError> {
        if !self.folders.contains_key(&id) {
            return Ok(false);
        }
        Ok(rows_mut(&mut self.folders).remove(&id).is_some())
    }

    fn sketch_class(&self, id: SketchClassId) -> Result<Option<SketchClass>, StoreError> {
        Ok(self.classes.get(&id).map(|c| SketchClass::clone(c)))
    }

    fn upsert_sketch_class(&mut self, class: SketchClass) -> Result<(), StoreError> {
        rows_mut(&mut self.classes).insert(class.id, Arc::new(class));
        Ok(())
    }

    fn geography(&self, id: GeographyId) -> Result<Option<GeographySettings>, StoreError> {
        Ok(self.geographies.get(&id).map(|g| GeographySettings::clone(g)))
    }

    fn upsert_geography(&mut self, geography: GeographySettings) -> Result<(), StoreError> {
        rows_mut(&mut self.geographies).insert(geography.id, Arc::new(geography));
        Ok(())
    }

    fn parent_collection_id(&self, parent: Parent) -> Result<Option<SketchId>, StoreError> {
        let mut current = parent;
        // folder cycles are rejected on move, the bound is a backstop
        for _ in 0..=self.folders.len() {
            match current {
                Parent::Root => return Ok(None),
                Parent::Collection(id) => {
                    if !self.sketches.contains_key(&id) {
                        return Err(StoreError::Missing(format!("collection {id}")));
                    }
                    return Ok(Some(id));
                }
                Parent::Folder(id) => {
                    let folder = self
                        .folders
                        .get(&id)
                        .ok_or_else(|| StoreError::Missing(format!("folder {id}")))?;
                    current = folder.parent;
                }
            }
        }
        Err(StoreError::Constraint("folder hierarchy contains a cycle".to_string()))
    }

    fn child_items_recursive(&self, item: TocItem) -> Result<Vec<TocItem>, StoreError> {
        let mut out = Vec::new();
        let mut stack = self.children(item);
        stack.reverse();
        while let Some(next) = stack.pop() {
            if out.contains(&next) {
                return Err(StoreError::Constraint("folder hierarchy contains a cycle".to_string()));
            }
            out.push(next);
            let mut nested = self.children(next);
            nested.reverse();
            stack.extend(nested);
        }
        Ok(out)
    }

    fn collection_members(&self, collection: SketchId) -> Result<Vec<SketchId>, StoreError> {
        let mut out = Vec::new();
        for item in self.child_items_recursive(TocItem::Sketch(collection))? {
            if let TocItem::Sketch(id) = item {
                if self.is_collection(id) {
                    continue;
                }
                let Some(sketch) = self.sketches.get(&id) else {
                    continue;
                };
                if self.parent_collection_id(sketch.parent)? == Some(collection) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    fn copy_toc_item_recursive(&mut self, item: TocItem, user_id: UserId, parent: Parent) -> Result<CopyResult, StoreError> {
        let parent_collection_id = self.parent_collection_id(parent)?;
        let mut result = CopyResult {
            root: item,
            sketch_ids: Vec::new(),
            folder_ids: Vec::new(),
            parent_collection_id,
            copied_from: BTreeMap::new(),
        };
        result.root = self.copy_item(item, user_id, parent, &mut result)?;
        Ok(result)
    }

    fn fragments_for_sketch(&self, id: SketchId) -> Result<Vec<StoredFragment>, StoreError> {
        let Some(hashes) = self.associations.get(&id) else {
            return Ok(Vec::new());
        };
        hashes
            .iter()
            .map(|h| {
                self.fragments
                    .get(h)
                    .map(|f| StoredFragment::clone(f))
                    .ok_or_else(|| StoreError::Constraint(format!("association to missing fragment {h}")))
            })
            .collect()
    }

    fn fragment_sketch_ids(&self, hash: &FragmentHash) -> Result<BTreeSet<SketchId>, StoreError> {
        Ok(self
            .associations
            .iter()
            .filter(|(_, hashes)| hashes.contains(hash))
            .map(|(id, _)| *id)
            .collect())
    }

    fn overlapping_fragments(&self, sketch_ids: &[SketchId], envelopes: &[Envelope]) -> Result<Vec<SketchFragment>, StoreError> {
        let scope: BTreeSet<SketchId> = sketch_ids.iter().copied().collect();
        let mut owners: BTreeMap<&FragmentHash, BTreeSet<SketchId>> = BTreeMap::new();
        for id in &scope {
            for hash in self.associations.get(id).into_iter().flatten() {
                owners.entry(hash).or_default().insert(*id);
            }
        }

        let mut out = Vec::new();
        for (hash, ids) in owners {
            let stored = self
                .fragments
                .get(hash)
                .ok_or_else(|| StoreError::Constraint(format!("association to missing fragment {hash}")))?;
            let touches = polygon_envelope(&stored.geometry).is_some_and(|b| b.intersects_any(envelopes));
            if touches {
                out.push(stored.to_fragment(ids));
            }
        }
        Ok(out)
    }

    fn replace_sketch_fragments(&mut self, id: SketchId, fragments: Vec<StoredFragment>) -> Result<(), StoreError> {
        if !self.sketches.contains_key(&id) {
            return Err(StoreError::Missing(format!("sketch {id}")));
        }
        let mut hashes = BTreeSet::new();
        for fragment in fragments {
            hashes.insert(fragment.hash.clone());
            if !self.fragments.contains_key(&fragment.hash) {
                rows_mut(&mut self.fragments).insert(fragment.hash.clone(), Arc::new(fragment));
            }
        }
        let associations = Arc::make_mut(&mut self.associations);
        if hashes.is_empty() {
            associations.remove(&id);
        } else {
            associations.insert(id, hashes);
        }
        Ok(())
    }

    fn cleanup_orphaned_fragments(&mut self, hashes: &BTreeSet<FragmentHash>) -> Result<usize, StoreError> {
        let referenced: BTreeSet<&FragmentHash> = self.associations.values().flatten().collect();
        let orphans: Vec<FragmentHash> = hashes
            .iter()
            .filter(|h| !referenced.contains(h) && self.fragments.contains_key(*h))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            let fragments = rows_mut(&mut self.fragments);
            for h in &orphans {
                fragments.remove(h);
            }
        }
        Ok(orphans.len())
    }
}

/// Async handle over a shared store.
///
/// `transaction` runs its closure against a copy of the current state and
/// swaps the copy in only if the closure succeeds, so a failure at any step
/// leaves the store as it was. The lock is held for the whole closure;
/// callers plan against `snapshot` and only apply writes here.
pub struct Database<S> {
    state: Arc<Mutex<S>>,
}

impl<S> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<S: SketchStore + Clone + Send> Database<S> {
    pub fn new(store: S) -> Self {
        Self {
            state: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        let guard = self.state.lock().await;
        f(&guard)
    }

    pub async fn transaction<T, E>(&self, f: impl FnOnce(&mut S) -> Result<T, E>) -> Result<T, E> {
        let mut guard = self.state.lock().await;
        let mut working = guard.clone();
        let out = f(&mut working)?;
        *guard = working;
        Ok(out)
    }

    pub async fn snapshot(&self) -> S {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{Database, InMemorySketchStore, SketchStore};
    use crate::error::StoreError;
    use crate::model::{NewSketch, Parent, SketchClass, SketchClassKind, StoredFragment, TocItem};
    use foundation::{Envelope, SketchClassId, SketchId, UserId};
    use geo::polygon;
    use overlay::SketchFragment;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const POLY: SketchClassId = SketchClassId::new(1);
    const COLLECTION: SketchClassId = SketchClassId::new(2);
    const USER: UserId = UserId::new(1);

    fn store() -> InMemorySketchStore {
        let mut s = InMemorySketchStore::new();
        for (id, kind) in [(POLY, SketchClassKind::Polygon), (COLLECTION, SketchClassKind::Collection)] {
            s.upsert_sketch_class(SketchClass {
                id,
                name: format!("{kind:?}"),
                kind,
                clipping_geographies: Vec::new(),
            })
            .unwrap();
        }
        s
    }

    fn new_sketch(class: SketchClassId, parent: Parent) -> NewSketch {
        NewSketch {
            name: "s".into(),
            sketch_class_id: class,
            user_id: USER,
            parent,
            user_geom: None,
            geom: None,
            properties: Default::default(),
        }
    }

    fn stored(x: f64) -> StoredFragment {
        StoredFragment::from_fragment(&SketchFragment::new(
            polygon![(x: x, y: 0.0), (x: x + 1.0, y: 0.0), (x: x + 1.0, y: 1.0), (x: x, y: 1.0), (x: x, y: 0.0)],
            [],
            [],
        ))
    }

    #[test]
    fn effective_collection_walks_through_folders() {
        let mut s = store();
        let c = s.insert_sketch(new_sketch(COLLECTION, Parent::Root)).unwrap();
        let f1 = s.insert_folder("f1".into(), USER, Parent::Collection(c)).unwrap();
        let f2 = s.insert_folder("f2".into(), USER, Parent::Folder(f1)).unwrap();
        let a = s.insert_sketch(new_sketch(POLY, Parent::Folder(f2))).unwrap();
        let b = s.insert_sketch(new_sketch(POLY, Parent::Collection(c))).unwrap();
        let loose = s.insert_sketch(new_sketch(POLY, Parent::Root)).unwrap();

        assert_eq!(s.parent_collection_id(Parent::Folder(f2)).unwrap(), Some(c));
        assert_eq!(s.parent_collection_id(Parent::Root).unwrap(), None);
        assert_eq!(s.collection_members(c).unwrap(), vec![a, b]);
        assert!(!s.collection_members(c).unwrap().contains(&loose));
        assert_eq!(
            s.child_items_recursive(TocItem::Sketch(c)).unwrap(),
            vec![TocItem::Folder(f1), TocItem::Folder(f2), TocItem::Sketch(a), TocItem::Sketch(b)]
        );
    }

    #[test]
    fn fragments_are_shared_and_orphans_swept() {
        let mut s = store();
        let a = s.insert_sketch(new_sketch(POLY, Parent::Root)).unwrap();
        let b = s.insert_sketch(new_sketch(POLY, Parent::Root)).unwrap();
        let (f0, f1) = (stored(0.0), stored(5.0));

        s.replace_sketch_fragments(a, vec![f0.clone(), f1.clone()]).unwrap();
        s.replace_sketch_fragments(b, vec![f0.clone()]).unwrap();
        assert_eq!(s.fragment_sketch_ids(&f0.hash).unwrap(), [a, b].into_iter().collect());

        let near = s
            .overlapping_fragments(&[a, b], &[Envelope::new(0.5, 0.5, 0.6, 0.6)])
            .unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].sketch_ids.len(), 2);

        s.delete_sketch(a).unwrap();
        let all: BTreeSet<_> = [f0.hash.clone(), f1.hash.clone()].into_iter().collect();
        assert_eq!(s.cleanup_orphaned_fragments(&all).unwrap(), 1);
        assert_eq!(s.fragment_count(), 1);
    }

    #[test]
    fn copies_keep_fragment_associations() {
        let mut s = store();
        let c = s.insert_sketch(new_sketch(COLLECTION, Parent::Root)).unwrap();
        let a = s.insert_sketch(new_sketch(POLY, Parent::Collection(c))).unwrap();
        s.replace_sketch_fragments(a, vec![stored(0.0)]).unwrap();

        let copy = s.copy_toc_item_recursive(TocItem::Sketch(c), USER, Parent::Root).unwrap();
        assert_eq!(copy.sketch_ids.len(), 2);
        assert_eq!(copy.parent_collection_id, None);
        let TocItem::Sketch(new_c) = copy.root else { panic!("expected sketch root") };
        let members = s.collection_members(new_c).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(copy.copied_from[&members[0]], a);
        assert_eq!(s.fragments_for_sketch(members[0]).unwrap(), s.fragments_for_sketch(a).unwrap());
    }

    #[test]
    fn clones_share_rows_until_written() {
        let mut s = store();
        let a = s.insert_sketch(new_sketch(POLY, Parent::Root)).unwrap();
        s.replace_sketch_fragments(a, vec![stored(0.0), stored(5.0)]).unwrap();

        let mut copy = s.clone();
        assert!(Arc::ptr_eq(&s.fragments, &copy.fragments));
        assert!(Arc::ptr_eq(&s.sketches, &copy.sketches));

        let b = copy.insert_sketch(new_sketch(POLY, Parent::Root)).unwrap();
        copy.replace_sketch_fragments(b, vec![stored(0.0)]).unwrap();
        // the fragment already existed, so only the sketch table was copied
        assert!(Arc::ptr_eq(&s.fragments, &copy.fragments));
        assert!(!Arc::ptr_eq(&s.sketches, &copy.sketches));
        let (before, after) = (&s.sketches[&a], &copy.sketches[&a]);
        assert!(Arc::ptr_eq(before, after));
        assert_eq!(s.sketch(b).unwrap(), None);
        assert_eq!(s.fragment_sketch_ids(&stored(0.0).hash).unwrap(), [a].into_iter().collect());
    }

    #[tokio::test]
    async fn failed_transactions_leave_no_trace() {
        let db = Database::new(store());
        let result: Result<SketchId, StoreError> = db
            .transaction(|tx| {
                tx.insert_sketch(new_sketch(POLY, Parent::Root))?;
                Err(StoreError::Constraint("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(db.read(|s| s.sketch(SketchId::new(1)).unwrap()).await, None);

        let id = db
            .transaction(|tx| tx.insert_sketch(new_sketch(POLY, Parent::Root)))
            .await
            .unwrap();
        assert!(db.read(|s| s.sketch(id).unwrap()).await.is_some());
    }
}
