//! Writing a fragment merge back to the store.
//!
//! A merge consumes some stored fragments (the ones it was handed as
//! "existing") and produces their replacement. The deletion scope is exactly
//! the consumed set; every affected sketch keeps its stored fragments outside
//! the scope and gains the replacements attributed to it.
//!
//! Checking a plan is geometry work and runs against a snapshot. Applying a
//! checked plan is a handful of row writes and is what runs under the store
//! lock.

use std::collections::{BTreeMap, BTreeSet};

use foundation::{Envelope, SketchId};
use overlay::{FragmentHash, FragmentOptions, SketchFragment, SketchRef, eliminate_overlap, normalize_fragments};
use tracing::debug;

use crate::error::ReconcileError;
use crate::model::StoredFragment;
use crate::store::{SketchStore, sketch_fragments_within};

/// Hash of every stored fragment that fed a merge.
pub fn deletion_scope(considered: &[SketchFragment]) -> BTreeSet<FragmentHash> {
    considered.iter().map(SketchFragment::hash).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub sketch_id: SketchId,
    /// Replacement fragments per sketch, for the sketch and every sibling.
    pub replacements: BTreeMap<SketchId, Vec<StoredFragment>>,
    pub deletion_scope: BTreeSet<FragmentHash>,
}

impl ReconcilePlan {
    /// Groups merged `fragments` by owning sketch, resolving `Pending` to
    /// `sketch_id`. Sketches outside `sibling_ids ∪ {sketch_id}` are ignored.
    pub fn build(
        sketch_id: SketchId,
        sibling_ids: &[SketchId],
        fragments: Vec<SketchFragment>,
        considered: &[SketchFragment],
    ) -> Self {
        let mut replacements: BTreeMap<SketchId, Vec<StoredFragment>> = BTreeMap::new();
        replacements.insert(sketch_id, Vec::new());
        for id in sibling_ids {
            replacements.insert(*id, Vec::new());
        }

        for fragment in fragments {
            let fragment = fragment.resolve_pending(sketch_id);
            let stored = StoredFragment::from_fragment(&fragment);
            for owner in &fragment.sketch_ids {
                let owner = owner.resolve(sketch_id);
                if let Some(list) = replacements.get_mut(&owner) {
                    list.push(stored.clone());
                }
            }
        }

        ReconcilePlan {
            sketch_id,
            replacements,
            deletion_scope: deletion_scope(considered),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub updated_sketches: Vec<SketchId>,
    pub orphans_removed: usize,
}

/// A plan that passed the completeness check against some state: the full
/// fragment set each affected sketch ends up with, and the set it had when
/// checked. Applying it elsewhere requires those sets to be unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckedPlan {
    pub sketch_id: SketchId,
    pub writes: Vec<SketchWrite>,
    pub deletion_scope: BTreeSet<FragmentHash>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SketchWrite {
    pub sketch_id: SketchId,
    pub expected: BTreeSet<FragmentHash>,
    pub fragments: Vec<StoredFragment>,
}

impl CheckedPlan {
    /// Renames sketch ids that were assigned again when the plan was
    /// replayed. Every id is mapped once, so chains like 5 to 6 and 6 to 7
    /// stay apart.
    pub fn retarget(&mut self, ids: &BTreeMap<SketchId, SketchId>) {
        let map = |id: SketchId| ids.get(&id).copied().unwrap_or(id);
        self.sketch_id = map(self.sketch_id);
        for write in &mut self.writes {
            write.sketch_id = map(write.sketch_id);
        }
    }
}

/// Rejects `plan` when a fragment kept outside the deletion scope overlaps a
/// replacement for the same sketch. Reads only.
pub fn check_plan<S: SketchStore + ?Sized>(store: &S, plan: &ReconcilePlan) -> Result<CheckedPlan, ReconcileError> {
    let mut writes = Vec::new();

    for (sketch_id, additions) in &plan.replacements {
        let stored = store.fragments_for_sketch(*sketch_id)?;
        let expected: BTreeSet<FragmentHash> = stored.iter().map(|f| f.hash.clone()).collect();
        let (dropped, retained): (Vec<StoredFragment>, Vec<StoredFragment>) = stored
            .into_iter()
            .partition(|f| plan.deletion_scope.contains(&f.hash));
        if dropped.is_empty() && additions.is_empty() {
            continue;
        }

        let mut conflicts: Vec<FragmentHash> = Vec::new();
        for kept in &retained {
            let kept_fragment = kept.to_fragment([*sketch_id]);
            let overlaps = additions
                .iter()
                .any(|added| added.hash != kept.hash && kept_fragment.overlaps(&added.to_fragment([*sketch_id])));
            if overlaps {
                conflicts.push(kept.hash.clone());
            }
        }
        if !conflicts.is_empty() {
            return Err(ReconcileError::IncompleteDeletionScope {
                sketch_id: *sketch_id,
                hashes: conflicts,
            });
        }

        let mut next = retained;
        let mut seen: BTreeSet<FragmentHash> = next.iter().map(|f| f.hash.clone()).collect();
        for added in additions {
            if seen.insert(added.hash.clone()) {
                next.push(added.clone());
            }
        }
        writes.push(SketchWrite {
            sketch_id: *sketch_id,
            expected,
            fragments: next,
        });
    }

    Ok(CheckedPlan {
        sketch_id: plan.sketch_id,
        writes,
        deletion_scope: plan.deletion_scope.clone(),
    })
}

/// Writes a checked plan. No geometry work happens here; a sketch whose
/// fragments changed since the check fails the whole plan.
pub fn apply_plan<S: SketchStore + ?Sized>(tx: &mut S, plan: &CheckedPlan) -> Result<ReconcileSummary, ReconcileError> {
    for write in &plan.writes {
        let current: BTreeSet<FragmentHash> = tx
            .fragments_for_sketch(write.sketch_id)?
            .into_iter()
            .map(|f| f.hash)
            .collect();
        if current != write.expected {
            return Err(ReconcileError::StalePlan {
                sketch_id: write.sketch_id,
            });
        }
    }

    let mut summary = ReconcileSummary::default();
    for write in &plan.writes {
        tx.replace_sketch_fragments(write.sketch_id, write.fragments.clone())?;
        summary.updated_sketches.push(write.sketch_id);
    }
    summary.orphans_removed = tx.cleanup_orphaned_fragments(&plan.deletion_scope)?;
    debug!(
        sketch = %plan.sketch_id,
        updated = summary.updated_sketches.len(),
        scope = plan.deletion_scope.len(),
        orphans = summary.orphans_removed,
        "fragments reconciled"
    );
    Ok(summary)
}

/// Checks and applies `plan` in one go. Nothing is written when the check
/// fails.
pub fn reconcile_fragments<S: SketchStore + ?Sized>(
    tx: &mut S,
    plan: &ReconcilePlan,
) -> Result<ReconcileSummary, ReconcileError> {
    let checked = check_plan(tx, plan)?;
    apply_plan(tx, &checked)
}

/// The stored fragments a merge for `sketch_id` must consume: everything of
/// the sketch itself plus sibling fragments near `envelopes`.
pub fn considered_fragments<S: SketchStore + ?Sized>(
    tx: &S,
    sketch_id: Option<SketchId>,
    sibling_ids: &[SketchId],
    envelopes: &[Envelope],
) -> Result<Vec<SketchFragment>, ReconcileError> {
    let scope: BTreeSet<SketchId> = sibling_ids.iter().copied().collect();
    let mut by_hash: BTreeMap<FragmentHash, SketchFragment> = BTreeMap::new();
    if let Some(id) = sketch_id {
        let mut own_envelopes = Vec::new();
        for f in sketch_fragments_within(tx, id, &scope)? {
            own_envelopes.extend(f.envelope());
            by_hash.insert(f.hash(), f);
        }
        // siblings sharing the old footprint are consumed too
        for f in tx.overlapping_fragments(sibling_ids, &own_envelopes)? {
            by_hash.entry(f.hash()).or_insert(f);
        }
    }
    for f in tx.overlapping_fragments(sibling_ids, envelopes)? {
        by_hash.entry(f.hash()).or_insert(f);
    }
    Ok(by_hash.into_values().collect())
}

/// Sibling fragments as the merge input: `sketch_id` stripped from the
/// attribution, pieces nobody else owns dropped, and neighbours with equal
/// attribution re-joined.
pub fn existing_without(considered: &[SketchFragment], sketch_id: Option<SketchId>) -> Vec<SketchFragment> {
    let remaining: Vec<SketchFragment> = considered
        .iter()
        .cloned()
        .filter_map(|mut f| {
            if let Some(id) = sketch_id {
                f.sketch_ids.remove(&SketchRef::Known(id));
            }
            f.sketch_ids.remove(&SketchRef::Pending);
            (!f.sketch_ids.is_empty()).then_some(f)
        })
        .collect();
    normalize_fragments(remaining)
}

/// Re-partitions a sketch that already has fragments against the members of
/// the collection it now belongs to (none for a loose sketch). The result is
/// applied to `working` and returned for replay.
pub fn rebase_sketch<S: SketchStore + ?Sized>(
    working: &mut S,
    sketch_id: SketchId,
    members: &[SketchId],
    options: &FragmentOptions,
) -> Result<Option<CheckedPlan>, ReconcileError> {
    let siblings: Vec<SketchId> = members.iter().copied().filter(|m| *m != sketch_id).collect();
    let own = sketch_fragments_within(working, sketch_id, &BTreeSet::new())?;
    if own.is_empty() {
        return Ok(None);
    }
    let envelopes: Vec<Envelope> = own.iter().filter_map(SketchFragment::envelope).collect();
    let standalone = normalize_fragments(own);

    let considered = considered_fragments(working, Some(sketch_id), &siblings, &envelopes)?;
    let existing = existing_without(&considered, Some(sketch_id));
    let merged = eliminate_overlap(standalone, existing, options)?;
    let plan = ReconcilePlan::build(sketch_id, &siblings, merged, &considered);
    let checked = check_plan(working, &plan)?;
    apply_plan(working, &checked)?;
    Ok(Some(checked))
}

/// Re-joins fragments of the remaining members after sketches left a
/// collection, so pieces split only because of the departed sketches merge
/// back together. Applied to `working` and returned for replay.
pub fn heal_collection<S: SketchStore + ?Sized>(
    working: &mut S,
    members: &[SketchId],
) -> Result<Option<CheckedPlan>, ReconcileError> {
    let scope: BTreeSet<SketchId> = members.iter().copied().collect();
    let mut by_hash: BTreeMap<FragmentHash, SketchFragment> = BTreeMap::new();
    for id in members {
        for f in sketch_fragments_within(working, *id, &scope)? {
            by_hash.entry(f.hash()).or_insert(f);
        }
    }
    let considered: Vec<SketchFragment> = by_hash.into_values().collect();
    let healed = normalize_fragments(considered.clone());
    if healed.len() == considered.len() {
        return Ok(None);
    }

    let Some((first, rest)) = members.split_first() else {
        return Ok(None);
    };
    let plan = ReconcilePlan::build(*first, rest, healed, &considered);
    let checked = check_plan(working, &plan)?;
    apply_plan(working, &checked)?;
    Ok(Some(checked))
}

#[cfg(test)]
mod tests {
    use super::{
        ReconcilePlan, apply_plan, check_plan, deletion_scope, heal_collection, rebase_sketch, reconcile_fragments,
    };
    use crate::error::ReconcileError;
    use crate::model::{NewSketch, Parent, SketchClass, SketchClassKind, StoredFragment};
    use crate::store::{InMemorySketchStore, SketchStore};
    use foundation::{GeographyId, SketchClassId, SketchId, UserId};
    use geo::{Area, Polygon, polygon};
    use overlay::{FragmentOptions, SketchFragment, SketchRef};
    use pretty_assertions::assert_eq;

    fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Polygon<f64> {
        polygon![
            (x: min_x, y: min_y),
            (x: max_x, y: min_y),
            (x: max_x, y: max_y),
            (x: min_x, y: max_y),
            (x: min_x, y: min_y),
        ]
    }

    fn frag(p: Polygon<f64>, sketches: &[SketchRef]) -> SketchFragment {
        SketchFragment::new(p, [GeographyId::new(1)], sketches.iter().copied())
    }

    fn store_with(n: usize) -> (InMemorySketchStore, Vec<SketchId>) {
        let mut s = InMemorySketchStore::new();
        s.upsert_sketch_class(SketchClass {
            id: SketchClassId::new(1),
            name: "poly".into(),
            kind: SketchClassKind::Polygon,
            clipping_geographies: vec![GeographyId::new(1)],
        })
        .unwrap();
        let ids = (0..n)
            .map(|_| {
                s.insert_sketch(NewSketch {
                    name: "s".into(),
                    sketch_class_id: SketchClassId::new(1),
                    user_id: UserId::new(1),
                    parent: Parent::Root,
                    user_geom: None,
                    geom: None,
                    properties: Default::default(),
                })
                .unwrap()
            })
            .collect();
        (s, ids)
    }

    fn area(store: &InMemorySketchStore, id: SketchId) -> f64 {
        store
            .fragments_for_sketch(id)
            .unwrap()
            .iter()
            .map(|f| f.geometry.unsigned_area())
            .sum()
    }

    #[test]
    fn plan_groups_by_resolved_owner() {
        let a = SketchId::new(1);
        let b = SketchId::new(2);
        let fragments = vec![
            frag(rect(0.0, 0.0, 1.0, 1.0), &[SketchRef::Pending]),
            frag(rect(1.0, 0.0, 2.0, 1.0), &[SketchRef::Pending, SketchRef::Known(b)]),
            frag(rect(2.0, 0.0, 3.0, 1.0), &[SketchRef::Known(b)]),
        ];
        let considered = vec![frag(rect(1.0, 0.0, 3.0, 1.0), &[SketchRef::Known(b)])];
        let plan = ReconcilePlan::build(a, &[b], fragments, &considered);

        assert_eq!(plan.replacements[&a].len(), 2);
        assert_eq!(plan.replacements[&b].len(), 2);
        assert_eq!(plan.deletion_scope, deletion_scope(&considered));
        assert_eq!(plan.deletion_scope.len(), 1);
    }

    #[test]
    fn reconcile_replaces_consumed_fragments() {
        let (mut store, ids) = store_with(2);
        let (a, b) = (ids[0], ids[1]);
        let old_b = frag(rect(0.0, 0.0, 0.02, 0.01), &[SketchRef::Known(b)]);
        store
            .replace_sketch_fragments(b, vec![StoredFragment::from_fragment(&old_b)])
            .unwrap();

        let merged = overlay::eliminate_overlap(
            vec![frag(rect(0.01, 0.0, 0.03, 0.01), &[SketchRef::Pending])],
            vec![old_b.clone()],
            &FragmentOptions::default(),
        )
        .unwrap();
        let plan = ReconcilePlan::build(a, &[b], merged, &[old_b]);
        let summary = reconcile_fragments(&mut store, &plan).unwrap();

        assert_eq!(summary.updated_sketches, vec![a, b]);
        assert_eq!(summary.orphans_removed, 1);
        assert_eq!(store.fragments_for_sketch(a).unwrap().len(), 2);
        assert_eq!(store.fragments_for_sketch(b).unwrap().len(), 2);
        assert!((area(&store, a) - 0.0002).abs() < 1e-12);
        assert!((area(&store, b) - 0.0002).abs() < 1e-12);
        assert_eq!(store.fragment_count(), 3);
    }

    #[test]
    fn incomplete_deletion_scope_is_rejected() {
        let (mut store, ids) = store_with(2);
        let (a, b) = (ids[0], ids[1]);
        let old_b = frag(rect(0.0, 0.0, 0.02, 0.01), &[SketchRef::Known(b)]);
        store
            .replace_sketch_fragments(b, vec![StoredFragment::from_fragment(&old_b)])
            .unwrap();
        let before = store.clone();

        let merged = overlay::eliminate_overlap(
            vec![frag(rect(0.01, 0.0, 0.03, 0.01), &[SketchRef::Pending])],
            vec![old_b.clone()],
            &FragmentOptions::default(),
        )
        .unwrap();
        // old_b fed the merge but is missing from the scope
        let plan = ReconcilePlan::build(a, &[b], merged, &[]);
        let err = reconcile_fragments(&mut store, &plan).unwrap_err();

        match err {
            ReconcileError::IncompleteDeletionScope { sketch_id, hashes } => {
                assert_eq!(sketch_id, b);
                assert_eq!(hashes, vec![old_b.hash()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.fragments_for_sketch(b).unwrap(), before.fragments_for_sketch(b).unwrap());
        assert!(store.fragments_for_sketch(a).unwrap().is_empty());
    }

    #[test]
    fn plans_checked_on_a_snapshot_replay_or_go_stale() {
        let (mut store, ids) = store_with(2);
        let (a, b) = (ids[0], ids[1]);
        let old_b = frag(rect(0.0, 0.0, 0.02, 0.01), &[SketchRef::Known(b)]);
        store
            .replace_sketch_fragments(b, vec![StoredFragment::from_fragment(&old_b)])
            .unwrap();

        let merged = overlay::eliminate_overlap(
            vec![frag(rect(0.01, 0.0, 0.03, 0.01), &[SketchRef::Pending])],
            vec![old_b.clone()],
            &FragmentOptions::default(),
        )
        .unwrap();
        let plan = ReconcilePlan::build(a, &[b], merged, &[old_b]);
        let snapshot = store.clone();
        let checked = check_plan(&snapshot, &plan).unwrap();

        // unchanged state: the checked plan replays as is
        let mut replay = store.clone();
        apply_plan(&mut replay, &checked).unwrap();
        assert_eq!(replay.fragments_for_sketch(b).unwrap().len(), 2);

        let mut shifted = checked.clone();
        shifted.retarget(&[(a, b), (b, a)].into_iter().collect());
        assert_eq!(shifted.sketch_id, b);
        assert_eq!(
            shifted.writes.iter().map(|w| w.sketch_id).collect::<Vec<_>>(),
            vec![b, a]
        );

        // b was rewritten in between: nothing is applied
        store
            .replace_sketch_fragments(b, vec![StoredFragment::from_fragment(&frag(rect(5.0, 0.0, 6.0, 1.0), &[]))])
            .unwrap();
        let before = store.clone();
        let err = apply_plan(&mut store, &checked).unwrap_err();
        assert_eq!(err, ReconcileError::StalePlan { sketch_id: b });
        assert_eq!(store.fragments_for_sketch(a).unwrap(), before.fragments_for_sketch(a).unwrap());
        assert_eq!(store.fragments_for_sketch(b).unwrap(), before.fragments_for_sketch(b).unwrap());
    }

    #[test]
    fn rebase_and_heal_round_trip() {
        let (mut store, ids) = store_with(2);
        let (a, b) = (ids[0], ids[1]);
        let options = FragmentOptions::default();
        store
            .replace_sketch_fragments(a, vec![StoredFragment::from_fragment(&frag(rect(0.0, 0.0, 0.02, 0.01), &[]))])
            .unwrap();
        store
            .replace_sketch_fragments(b, vec![StoredFragment::from_fragment(&frag(rect(0.01, 0.0, 0.03, 0.01), &[]))])
            .unwrap();

        // b joins a's collection
        rebase_sketch(&mut store, b, &[a, b], &options).unwrap();
        assert_eq!(store.fragments_for_sketch(a).unwrap().len(), 2);
        assert_eq!(store.fragments_for_sketch(b).unwrap().len(), 2);
        assert!((area(&store, a) - 0.0002).abs() < 1e-12);

        // b leaves again: b is re-saved alone, a is healed
        rebase_sketch(&mut store, b, &[], &options).unwrap();
        heal_collection(&mut store, &[a]).unwrap();
        assert_eq!(store.fragments_for_sketch(a).unwrap().len(), 1);
        assert_eq!(store.fragments_for_sketch(b).unwrap().len(), 1);
        assert!((area(&store, a) - 0.0002).abs() < 1e-12);
        assert!((area(&store, b) - 0.0002).abs() < 1e-12);
        assert_eq!(store.fragment_count(), 2);
    }
}
