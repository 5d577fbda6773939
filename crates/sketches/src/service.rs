//! Sketch and collection mutations.
//!
//! Every mutation that touches fragments follows the same shape: read and
//! authorize, take the collection locks and confirm the read still holds,
//! then plan against a snapshot off the store lock (clipping, partitioning,
//! completeness checks). Only the planned writes run in the transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use formats::Feature;
use foundation::{FolderId, SketchClassId, SketchId, UserId};
use geo::{Geometry, MultiPolygon};
use overlay::{
    ClipExecutor, ClipOutput, FragmentHash, FragmentOptions, GeographySettings, SketchRef, clip_to_geographies,
    prepare_sketch,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::SketchError;
use crate::locks::{CollectionGuard, CollectionLocks, LockKey};
use crate::metrics::{MetricsTrigger, spawn_sketch_updated};
use crate::model::{
    CollectionChange, CopyResult, DeletedItems, NewSketch, Parent, Sketch, SketchClass, SketchClassKind,
    StoredFragment, TocItem,
};
use crate::reconcile::{
    CheckedPlan, ReconcilePlan, apply_plan, check_plan, considered_fragments, existing_without, heal_collection,
    rebase_sketch,
};
use crate::store::{Database, SketchStore};

#[derive(Debug, Clone, PartialEq)]
pub struct SketchParams {
    /// `None` creates a new sketch.
    pub id: Option<SketchId>,
    pub name: String,
    pub sketch_class_id: SketchClassId,
    /// Only used on creation. Existing sketches move with
    /// `update_sketch_toc_item_parent`.
    pub parent: Parent,
    pub user_geom: Option<Feature>,
    pub properties: Map<String, Value>,
}

pub struct SketchService<S> {
    db: Database<S>,
    executor: Arc<dyn ClipExecutor>,
    locks: CollectionLocks,
    metrics: Arc<dyn MetricsTrigger>,
    config: EngineConfig,
}

impl<S: SketchStore + Clone + Send + 'static> SketchService<S> {
    pub fn new(
        store: S,
        executor: Arc<dyn ClipExecutor>,
        metrics: Arc<dyn MetricsTrigger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db: Database::new(store),
            executor,
            locks: CollectionLocks::new(),
            metrics,
            config,
        }
    }

    pub fn database(&self) -> &Database<S> {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn register_sketch_class(&self, class: SketchClass) -> Result<(), SketchError> {
        self.db
            .transaction(|tx| tx.upsert_sketch_class(class))
            .await
            .map_err(SketchError::from)
    }

    pub async fn register_geography(&self, geography: GeographySettings) -> Result<(), SketchError> {
        self.db
            .transaction(|tx| tx.upsert_geography(geography))
            .await
            .map_err(SketchError::from)
    }

    pub async fn create_folder(&self, user: UserId, name: &str, parent: Parent) -> Result<FolderId, SketchError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SketchError::Validation("Folder name is required".to_string()));
        }
        self.db
            .transaction(|tx| {
                check_parent(tx, user, parent)?;
                Ok(tx.insert_folder(name.to_string(), user, parent)?)
            })
            .await
    }

    pub async fn sketch(&self, user: UserId, id: SketchId) -> Result<Sketch, SketchError> {
        self.db
            .read(|s| s.sketch(id))
            .await?
            .filter(|sketch| sketch.user_id == user)
            .ok_or(SketchError::NotFound)
    }

    pub async fn fragments_for_sketch(&self, id: SketchId) -> Result<Vec<StoredFragment>, SketchError> {
        Ok(self.db.read(|s| s.fragments_for_sketch(id)).await?)
    }

    pub async fn create_or_update_sketch(&self, user: UserId, params: SketchParams) -> Result<Sketch, SketchError> {
        let name = params.name.trim().to_string();
        if name.is_empty() {
            return Err(SketchError::Validation("Sketch name is required".to_string()));
        }

        let (existing_id, class) = self
            .db
            .read(|s| -> Result<_, SketchError> {
                let existing = match params.id {
                    Some(id) => Some(
                        s.sketch(id)?
                            .filter(|sketch| sketch.user_id == user)
                            .ok_or(SketchError::NotFound)?,
                    ),
                    None => None,
                };
                let class_id = existing
                    .as_ref()
                    .map_or(params.sketch_class_id, |e| e.sketch_class_id);
                let class = s
                    .sketch_class(class_id)?
                    .ok_or_else(|| SketchError::Validation(format!("unknown sketch class {class_id}")))?;
                if existing.is_none() {
                    check_parent(s, user, params.parent)?;
                }
                let existing_id = existing.map(|e| e.id);
                let collection = effective_collection(s, existing_id, params.parent)?;
                if class.kind == SketchClassKind::Collection && collection.is_some() {
                    return Err(SketchError::Validation(
                        "collections cannot be placed inside collections".to_string(),
                    ));
                }
                Ok((existing_id, class))
            })
            .await?;

        if class.kind == SketchClassKind::Collection {
            let row = SketchRow {
                name,
                class_id: class.id,
                user,
                parent: params.parent,
                user_geom: None,
                geom: None,
                properties: params.properties,
            };
            let saved = self.db.transaction(|tx| save_row(tx, existing_id, row)).await?;
            info!(sketch = %saved.id, "collection saved");
            return Ok(saved);
        }

        let feature = params
            .user_geom
            .as_ref()
            .ok_or_else(|| SketchError::Validation("Sketch geometry is required".to_string()))?;
        let prepared = prepare_sketch(feature)?;
        let drawn = drawn_geometry(feature);

        let parent = params.parent;
        let (_guard, collection) = self
            .lock_planned(
                |s| effective_collection(s, existing_id, parent),
                |collection| sketch_lock_key(existing_id, *collection).into_iter().collect(),
            )
            .await?;
        let snapshot = self.db.snapshot().await;

        let members: Vec<SketchId> = match collection {
            Some(c) => snapshot
                .collection_members(c)?
                .into_iter()
                .filter(|m| Some(*m) != existing_id)
                .collect(),
            None => Vec::new(),
        };
        let considered = considered_fragments(&snapshot, existing_id, &members, &prepared.envelopes)?;
        let mut geographies = Vec::new();
        for id in &class.clipping_geographies {
            geographies.extend(snapshot.geography(*id)?);
        }

        let existing_input = existing_without(&considered, existing_id);
        let sketch_ref = existing_id.map_or(SketchRef::Pending, SketchRef::Known);
        let ClipOutput { clipped, fragments } = clip_to_geographies(
            &prepared,
            &geographies,
            &class.clipping_geographies,
            existing_input,
            sketch_ref,
            self.executor.as_ref(),
            &self.config.fragment_options(),
        )
        .await?;
        debug!(fragments = fragments.len(), considered = considered.len(), "sketch clipped");

        let row = SketchRow {
            name,
            class_id: class.id,
            user,
            parent,
            user_geom: Some(drawn),
            geom: Some(clipped),
            properties: params.properties,
        };
        let planned_row = row.clone();
        let (provisional, checked) = tokio::task::spawn_blocking(move || -> Result<_, SketchError> {
            let mut working = snapshot;
            let sketch = save_row(&mut working, existing_id, planned_row)?;
            let plan = ReconcilePlan::build(sketch.id, &members, fragments, &considered);
            Ok((sketch.id, check_plan(&working, &plan)?))
        })
        .await??;

        let saved = self
            .db
            .transaction(|tx| -> Result<Sketch, SketchError> {
                if effective_collection(tx, existing_id, parent)? != collection {
                    return Err(SketchError::Conflict("sketch changed collection during save".to_string()));
                }
                let sketch = save_row(tx, existing_id, row)?;
                let mut checked = checked;
                checked.retarget(&BTreeMap::from([(provisional, sketch.id)]));
                apply_plan(tx, &checked)?;
                Ok(sketch)
            })
            .await?;

        info!(sketch = %saved.id, created = existing_id.is_none(), "sketch saved");
        spawn_sketch_updated(self.metrics.clone(), saved.id);
        Ok(saved)
    }

    pub async fn update_sketch_toc_item_parent(
        &self,
        user: UserId,
        items: &[TocItem],
        new_parent: Parent,
    ) -> Result<Vec<CollectionChange>, SketchError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let (_guard, (affected, new_collection)) = self
            .lock_planned(
                |s| -> Result<_, SketchError> {
                    check_parent(s, user, new_parent)?;
                    let target = parent_item(new_parent);
                    let mut affected: BTreeMap<SketchId, Option<SketchId>> = BTreeMap::new();
                    for item in items {
                        check_item(s, user, *item)?;
                        let descendants = s.child_items_recursive(*item)?;
                        if target == Some(*item) || target.is_some_and(|t| descendants.contains(&t)) {
                            return Err(SketchError::Validation(
                                "an item cannot be moved inside itself".to_string(),
                            ));
                        }
                        if let TocItem::Sketch(id) = item {
                            if is_collection(s, *id)? && matches!(new_parent, Parent::Collection(_)) {
                                return Err(SketchError::Validation(
                                    "collections cannot be placed inside collections".to_string(),
                                ));
                            }
                        }
                        for it in std::iter::once(*item).chain(descendants) {
                            if let TocItem::Sketch(id) = it {
                                if is_collection(s, id)? {
                                    continue;
                                }
                                let sketch = s.sketch(id)?.ok_or(SketchError::NotFound)?;
                                affected.insert(id, s.parent_collection_id(sketch.parent)?);
                            }
                        }
                    }
                    Ok((affected, s.parent_collection_id(new_parent)?))
                },
                |(affected, new_collection)| {
                    affected
                        .iter()
                        .flat_map(|(id, old)| {
                            [
                                LockKey::for_sketch(*id, *old),
                                LockKey::for_sketch(*id, *new_collection),
                            ]
                        })
                        .collect()
                },
            )
            .await?;
        debug!(affected = affected.len(), ?new_collection, "planning move");

        let snapshot = self.db.snapshot().await;
        let options = self.config.fragment_options();
        let moved = items.to_vec();
        let (changes, staged) = tokio::task::spawn_blocking(move || -> Result<_, SketchError> {
            let mut working = snapshot;
            set_parents(&mut working, &moved, new_parent)?;

            let mut changes = Vec::new();
            for (id, removed_from) in &affected {
                let sketch = working.sketch(*id)?.ok_or(SketchError::NotFound)?;
                let added_to = working.parent_collection_id(sketch.parent)?;
                if added_to != *removed_from {
                    changes.push(CollectionChange {
                        sketch_id: *id,
                        removed_from: *removed_from,
                        added_to,
                    });
                }
            }

            let mut staged = Vec::new();
            for change in &changes {
                let members = match change.added_to {
                    Some(c) => working.collection_members(c)?,
                    None => Vec::new(),
                };
                staged.extend(rebase_sketch(&mut working, change.sketch_id, &members, &options)?);
            }
            let left: BTreeSet<SketchId> = changes.iter().filter_map(|c| c.removed_from).collect();
            for collection in left {
                let members = working.collection_members(collection)?;
                staged.extend(heal_collection(&mut working, &members)?);
            }
            Ok((changes, staged))
        })
        .await??;

        self.db
            .transaction(|tx| -> Result<(), SketchError> {
                set_parents(tx, items, new_parent)?;
                for plan in &staged {
                    apply_plan(tx, plan)?;
                }
                Ok(())
            })
            .await?;

        info!(items = items.len(), changed = changes.len(), "toc items moved");
        for change in &changes {
            spawn_sketch_updated(self.metrics.clone(), change.sketch_id);
        }
        Ok(changes)
    }

    pub async fn delete_sketch_toc_items(&self, user: UserId, items: &[TocItem]) -> Result<DeletedItems, SketchError> {
        let (_guard, doomed) = self
            .lock_planned(
                |s| -> Result<Doomed, SketchError> {
                    let mut all: BTreeSet<TocItem> = BTreeSet::new();
                    for item in items {
                        check_item(s, user, *item)?;
                        all.insert(*item);
                        all.extend(s.child_items_recursive(*item)?);
                    }

                    let mut doomed = Doomed::default();
                    for item in &all {
                        match item {
                            TocItem::Sketch(id) => doomed.sketch_ids.push(*id),
                            TocItem::Folder(id) => doomed.folder_ids.push(*id),
                        }
                    }
                    for id in &doomed.sketch_ids {
                        doomed
                            .captured
                            .extend(s.fragments_for_sketch(*id)?.into_iter().map(|f| f.hash));
                        let Some(sketch) = s.sketch(*id)? else { continue };
                        let collection = s.parent_collection_id(sketch.parent)?;
                        doomed.keys.insert(LockKey::for_sketch(*id, collection));
                        if let Some(c) = collection.filter(|c| !doomed.sketch_ids.contains(c)) {
                            doomed.survivors_of.insert(c);
                        }
                    }
                    Ok(doomed)
                },
                |doomed| doomed.keys.iter().copied().collect(),
            )
            .await?;

        let snapshot = self.db.snapshot().await;
        let planned = doomed.clone();
        let staged = tokio::task::spawn_blocking(move || -> Result<_, SketchError> {
            let mut working = snapshot;
            delete_rows(&mut working, &planned)?;
            let mut staged = Vec::new();
            for collection in &planned.survivors_of {
                let members = working.collection_members(*collection)?;
                staged.extend(heal_collection(&mut working, &members)?);
            }
            Ok(staged)
        })
        .await??;

        self.db
            .transaction(|tx| -> Result<(), SketchError> {
                delete_rows(tx, &doomed)?;
                for plan in &staged {
                    apply_plan(tx, plan)?;
                }
                let removed = tx.cleanup_orphaned_fragments(&doomed.captured)?;
                debug!(orphans = removed, "fragments of deleted sketches swept");
                Ok(())
            })
            .await?;

        let Doomed {
            sketch_ids,
            folder_ids,
            survivors_of,
            ..
        } = doomed;
        info!(sketches = sketch_ids.len(), folders = folder_ids.len(), "toc items deleted");
        for collection in &survivors_of {
            spawn_sketch_updated(self.metrics.clone(), *collection);
        }
        Ok(DeletedItems { sketch_ids, folder_ids })
    }

    /// Copies an item and everything under it. Forum copies may be made of
    /// other users' items and land at the root of the copier's sketches;
    /// other copies sit next to the original.
    pub async fn copy_sketch_toc_item(&self, user: UserId, item: TocItem, for_forum: bool) -> Result<CopyResult, SketchError> {
        let (_guard, (parent, _)) = self
            .lock_planned(
                |s| -> Result<_, SketchError> {
                    let (owner, parent) = match item {
                        TocItem::Sketch(id) => {
                            let sketch = s.sketch(id)?.ok_or(SketchError::NotFound)?;
                            (sketch.user_id, sketch.parent)
                        }
                        TocItem::Folder(id) => {
                            let folder = s.folder(id)?.ok_or(SketchError::NotFound)?;
                            (folder.user_id, folder.parent)
                        }
                    };
                    if !for_forum && owner != user {
                        return Err(SketchError::PermissionDenied);
                    }
                    let parent = if for_forum { Parent::Root } else { parent };
                    // the copies' new collection and the originals' fragments
                    let mut keys: BTreeSet<LockKey> = s
                        .parent_collection_id(parent)?
                        .map(LockKey::Collection)
                        .into_iter()
                        .collect();
                    for it in std::iter::once(item).chain(s.child_items_recursive(item)?) {
                        if let TocItem::Sketch(id) = it {
                            let sketch = s.sketch(id)?.ok_or(SketchError::NotFound)?;
                            keys.insert(LockKey::for_sketch(id, s.parent_collection_id(sketch.parent)?));
                        }
                    }
                    Ok((parent, keys))
                },
                |(_, keys)| keys.iter().copied().collect(),
            )
            .await?;

        let snapshot = self.db.snapshot().await;
        let options = self.config.fragment_options();
        let (planned, staged) = tokio::task::spawn_blocking(move || -> Result<_, SketchError> {
            let mut working = snapshot;
            let planned = working.copy_toc_item_recursive(item, user, parent)?;
            let staged = rebase_copies(&mut working, &planned, &options)?;
            Ok((planned, staged))
        })
        .await??;

        let result = self
            .db
            .transaction(|tx| -> Result<CopyResult, SketchError> {
                let result = tx.copy_toc_item_recursive(item, user, parent)?;
                // new rows may get other ids than they did while planning
                let copy_of: BTreeMap<SketchId, SketchId> =
                    result.copied_from.iter().map(|(copy, original)| (*original, *copy)).collect();
                let ids: BTreeMap<SketchId, SketchId> = planned
                    .copied_from
                    .iter()
                    .filter_map(|(copy, original)| copy_of.get(original).map(|now| (*copy, *now)))
                    .collect();
                for mut plan in staged {
                    plan.retarget(&ids);
                    apply_plan(tx, &plan)?;
                }
                Ok(result)
            })
            .await?;

        info!(copies = result.sketch_ids.len(), for_forum, "toc item copied");
        for id in &result.sketch_ids {
            spawn_sketch_updated(self.metrics.clone(), *id);
        }
        Ok(result)
    }

    /// Reads what a mutation touches, takes the locks for it, and reads again
    /// under the locks. Rows can move while a lock is awaited, which would
    /// leave the wrong keys held, so a changed read starts another round.
    async fn lock_planned<T, R, K>(&self, read: R, keys: K) -> Result<(CollectionGuard, T), SketchError>
    where
        T: PartialEq,
        R: Fn(&S) -> Result<T, SketchError>,
        K: Fn(&T) -> Vec<LockKey>,
    {
        let mut planned = self.db.read(&read).await?;
        for attempt in 0..LOCK_ATTEMPTS {
            let guard = self.locks.acquire(keys(&planned)).await;
            let current = self.db.read(&read).await?;
            if current == planned {
                return Ok((guard, current));
            }
            debug!(attempt, "locked rows changed while waiting, locking again");
            planned = current;
        }
        Err(SketchError::Conflict("rows kept changing while waiting for locks".to_string()))
    }
}

const LOCK_ATTEMPTS: usize = 5;

/// Column values written by a save.
#[derive(Debug, Clone)]
struct SketchRow {
    name: String,
    class_id: SketchClassId,
    user: UserId,
    parent: Parent,
    user_geom: Option<MultiPolygon<f64>>,
    geom: Option<MultiPolygon<f64>>,
    properties: Map<String, Value>,
}

/// Everything a delete removes, and the locks it needs.
#[derive(Debug, Clone, Default, PartialEq)]
struct Doomed {
    sketch_ids: Vec<SketchId>,
    folder_ids: Vec<FolderId>,
    captured: BTreeSet<FragmentHash>,
    survivors_of: BTreeSet<SketchId>,
    keys: BTreeSet<LockKey>,
}

/// Existing rows are read again from `tx`: the copy read before locking may
/// be out of date.
fn save_row<S: SketchStore>(tx: &mut S, existing: Option<SketchId>, row: SketchRow) -> Result<Sketch, SketchError> {
    match existing {
        Some(id) => {
            let mut sketch = tx.sketch(id)?.ok_or(SketchError::NotFound)?;
            sketch.name = row.name;
            sketch.user_geom = row.user_geom;
            sketch.geom = row.geom;
            sketch.properties = row.properties;
            tx.update_sketch(sketch.clone())?;
            Ok(sketch)
        }
        None => {
            let new = NewSketch {
                name: row.name,
                sketch_class_id: row.class_id,
                user_id: row.user,
                parent: row.parent,
                user_geom: row.user_geom,
                geom: row.geom,
                properties: row.properties,
            };
            let id = tx.insert_sketch(new.clone())?;
            Ok(new.into_sketch(id))
        }
    }
}

/// Collection guarding a sketch's fragments: the current parent's for an
/// existing row, `parent`'s for a new one.
fn effective_collection<S: SketchStore>(
    s: &S,
    existing: Option<SketchId>,
    parent: Parent,
) -> Result<Option<SketchId>, SketchError> {
    let parent = match existing {
        Some(id) => s.sketch(id)?.ok_or(SketchError::NotFound)?.parent,
        None => parent,
    };
    Ok(s.parent_collection_id(parent)?)
}

fn sketch_lock_key(existing: Option<SketchId>, collection: Option<SketchId>) -> Option<LockKey> {
    match (collection, existing) {
        (Some(c), _) => Some(LockKey::Collection(c)),
        (None, Some(id)) => Some(LockKey::Sketch(id)),
        (None, None) => None,
    }
}

fn set_parents<S: SketchStore>(tx: &mut S, items: &[TocItem], parent: Parent) -> Result<(), SketchError> {
    for item in items {
        match item {
            TocItem::Sketch(id) => {
                let mut sketch = tx.sketch(*id)?.ok_or(SketchError::NotFound)?;
                sketch.parent = parent;
                tx.update_sketch(sketch)?;
            }
            TocItem::Folder(id) => {
                let mut folder = tx.folder(*id)?.ok_or(SketchError::NotFound)?;
                folder.parent = parent;
                tx.update_folder(folder)?;
            }
        }
    }
    Ok(())
}

fn delete_rows<S: SketchStore>(tx: &mut S, doomed: &Doomed) -> Result<(), SketchError> {
    for id in &doomed.sketch_ids {
        tx.delete_sketch(*id)?;
    }
    for id in &doomed.folder_ids {
        tx.delete_folder(*id)?;
    }
    Ok(())
}

/// Re-partitions copies that left their original's collection, unless that
/// collection was copied along with them.
fn rebase_copies<S: SketchStore>(
    working: &mut S,
    result: &CopyResult,
    options: &FragmentOptions,
) -> Result<Vec<CheckedPlan>, SketchError> {
    let originals: BTreeSet<SketchId> = result.copied_from.values().copied().collect();
    let mut staged = Vec::new();
    for (copy, original) in &result.copied_from {
        let (Some(copy_row), Some(original_row)) = (working.sketch(*copy)?, working.sketch(*original)?) else {
            continue;
        };
        let new_collection = working.parent_collection_id(copy_row.parent)?;
        let old_collection = working.parent_collection_id(original_row.parent)?;
        let copied_with_siblings = old_collection.is_some_and(|c| originals.contains(&c));
        if new_collection != old_collection && !copied_with_siblings {
            let members = match new_collection {
                Some(c) => working.collection_members(c)?,
                None => Vec::new(),
            };
            staged.extend(rebase_sketch(working, *copy, &members, options)?);
        }
    }
    Ok(staged)
}

/// The geometry as the user drew it, before preparation.
fn drawn_geometry(feature: &Feature) -> MultiPolygon<f64> {
    match &feature.geometry {
        Some(Geometry::Polygon(p)) => MultiPolygon::new(vec![p.clone()]),
        Some(Geometry::MultiPolygon(mp)) => mp.clone(),
        _ => MultiPolygon::new(Vec::new()),
    }
}

fn parent_item(parent: Parent) -> Option<TocItem> {
    match parent {
        Parent::Root => None,
        Parent::Folder(id) => Some(TocItem::Folder(id)),
        Parent::Collection(id) => Some(TocItem::Sketch(id)),
    }
}

fn is_collection<S: SketchStore>(s: &S, id: SketchId) -> Result<bool, SketchError> {
    let sketch = s.sketch(id)?.ok_or(SketchError::NotFound)?;
    let class = s
        .sketch_class(sketch.sketch_class_id)?
        .ok_or(SketchError::NotFound)?;
    Ok(class.kind == SketchClassKind::Collection)
}

fn check_item<S: SketchStore>(s: &S, user: UserId, item: TocItem) -> Result<(), SketchError> {
    let owner = match item {
        TocItem::Sketch(id) => s.sketch(id)?.ok_or(SketchError::NotFound)?.user_id,
        TocItem::Folder(id) => s.folder(id)?.ok_or(SketchError::NotFound)?.user_id,
    };
    if owner != user {
        return Err(SketchError::PermissionDenied);
    }
    Ok(())
}

fn check_parent<S: SketchStore>(s: &S, user: UserId, parent: Parent) -> Result<(), SketchError> {
    match parent {
        Parent::Root => Ok(()),
        Parent::Folder(id) => check_item(s, user, TocItem::Folder(id)),
        Parent::Collection(id) => {
            check_item(s, user, TocItem::Sketch(id))?;
            if !is_collection(s, id)? {
                return Err(SketchError::Validation("parent sketch is not a collection".to_string()));
            }
            Ok(())
        }
    }
}
