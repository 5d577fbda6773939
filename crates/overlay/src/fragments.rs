//! Fragments partition sketches so that no two pieces of a collection
//! overlap. Overlapping inputs are repeatedly split into their intersection
//! and both differences until a full pass finds nothing to split, then pieces
//! with identical footprints are folded together. Every producer ends with
//! `normalize_fragments`, so equal partitions hash equally whichever path
//! built them.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use foundation::{Envelope, GeographyId, SketchId};
use geo::{Area, BooleanOps, Intersects, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FragmentError;
use crate::geometry::{AREA_EPSILON, drop_slivers, geodesic_area_m2, polygon_envelope, single, union_all};
use crate::hash::{FragmentHash, canonical_polygon, fragment_hash};

/// Which sketch a fragment belongs to. `Pending` stands for the sketch being
/// saved, whose id may not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SketchRef {
    Known(SketchId),
    Pending,
}

impl SketchRef {
    pub fn resolve(self, pending: SketchId) -> SketchId {
        match self {
            SketchRef::Known(id) => id,
            SketchRef::Pending => pending,
        }
    }
}

impl From<SketchId> for SketchRef {
    fn from(id: SketchId) -> Self {
        SketchRef::Known(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SketchFragment {
    pub geometry: Polygon<f64>,
    pub geography_ids: BTreeSet<GeographyId>,
    pub sketch_ids: BTreeSet<SketchRef>,
}

impl SketchFragment {
    pub fn new(
        geometry: Polygon<f64>,
        geography_ids: impl IntoIterator<Item = GeographyId>,
        sketch_ids: impl IntoIterator<Item = SketchRef>,
    ) -> Self {
        SketchFragment {
            geometry,
            geography_ids: geography_ids.into_iter().collect(),
            sketch_ids: sketch_ids.into_iter().collect(),
        }
    }

    pub fn hash(&self) -> FragmentHash {
        fragment_hash(&self.geometry, &self.geography_ids)
    }

    pub fn envelope(&self) -> Option<Envelope> {
        polygon_envelope(&self.geometry)
    }

    pub fn area_m2(&self) -> f64 {
        geodesic_area_m2(&self.geometry)
    }

    /// Replaces `Pending` with a concrete id.
    pub fn resolve_pending(mut self, id: SketchId) -> Self {
        if self.sketch_ids.remove(&SketchRef::Pending) {
            self.sketch_ids.insert(SketchRef::Known(id));
        }
        self
    }

    pub fn overlaps(&self, other: &SketchFragment) -> bool {
        match (self.envelope(), other.envelope()) {
            (Some(a), Some(b)) if a.intersects(&b) => {}
            _ => return false,
        }
        let shared = single(self.geometry.clone()).intersection(&single(other.geometry.clone()));
        shared.unsigned_area() > AREA_EPSILON
    }
}

/// Attribution sets that are unioned when pieces combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionKey {
    Geographies,
    Sketches,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentOptions {
    /// Pieces with geodesic area at or below this are discarded.
    pub min_area_m2: f64,
    pub max_decompose_iterations: usize,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        FragmentOptions {
            min_area_m2: 1.0,
            max_decompose_iterations: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct Piece {
    id: u64,
    bbox: Envelope,
    fragment: SketchFragment,
}

#[derive(Default)]
struct PieceIds(u64);

impl PieceIds {
    fn next(&mut self) -> u64 {
        let id = self.0;
        self.0 += 1;
        id
    }

    fn piece(&mut self, fragment: SketchFragment) -> Option<Piece> {
        let bbox = fragment.envelope()?;
        Some(Piece {
            id: self.next(),
            bbox,
            fragment,
        })
    }
}

/// Turns per-geography clip results into non-overlapping fragments carrying
/// every geography they fall in. Multi-part results are exploded first.
pub fn create_fragments(
    per_geography: Vec<(GeographyId, MultiPolygon<f64>)>,
    options: &FragmentOptions,
) -> Result<Vec<SketchFragment>, FragmentError> {
    let mut ids = PieceIds::default();
    let pieces: Vec<Piece> = per_geography
        .into_iter()
        .flat_map(|(geography, mp)| {
            mp.0
                .into_iter()
                .map(move |p| SketchFragment::new(p, [geography], []))
        })
        .filter_map(|f| ids.piece(f))
        .collect();

    let keys = [AttributionKey::Geographies];
    let pieces = decompose(pieces, &keys, options.max_decompose_iterations, &mut ids)?;
    let merged = merge_matching(pieces, &keys);
    Ok(keep_significant(normalize_pieces(merged), options))
}

/// Combines a sketch's new fragments with fragments already in its
/// collection so that the result has no overlap. Either input may be a
/// subset of the collection as long as it covers every overlap.
pub fn eliminate_overlap(
    new_fragments: Vec<SketchFragment>,
    existing: Vec<SketchFragment>,
    options: &FragmentOptions,
) -> Result<Vec<SketchFragment>, FragmentError> {
    let mut ids = PieceIds::default();
    let pieces: Vec<Piece> = new_fragments
        .into_iter()
        .chain(existing)
        .filter_map(|f| ids.piece(f))
        .collect();
    let before = pieces.len();

    let keys = [AttributionKey::Sketches, AttributionKey::Geographies];
    let pieces = decompose(pieces, &keys, options.max_decompose_iterations, &mut ids)?;
    let merged = merge_matching(pieces, &keys);
    let out = keep_significant(normalize_pieces(merged), options);
    debug!(input = before, output = out.len(), "eliminated fragment overlap");
    Ok(out)
}

/// Unions fragments that share identical attribution on `keys` and touch or
/// overlap. Attribution not named in `keys` is unioned as well.
pub fn merge_touching_fragments(
    fragments: Vec<SketchFragment>,
    keys: &[AttributionKey],
) -> Vec<SketchFragment> {
    type GroupKey = (Option<BTreeSet<GeographyId>>, Option<BTreeSet<SketchRef>>);
    let mut groups: BTreeMap<GroupKey, Vec<SketchFragment>> = BTreeMap::new();
    for fragment in fragments {
        let key = (
            keys.contains(&AttributionKey::Geographies)
                .then(|| fragment.geography_ids.clone()),
            keys.contains(&AttributionKey::Sketches)
                .then(|| fragment.sketch_ids.clone()),
        );
        groups.entry(key).or_default().push(fragment);
    }

    let mut out = Vec::new();
    for (_, group) in groups {
        if group.len() == 1 {
            out.extend(group);
            continue;
        }
        let mut geography_ids = BTreeSet::new();
        let mut sketch_ids = BTreeSet::new();
        for f in &group {
            geography_ids.extend(f.geography_ids.iter().copied());
            sketch_ids.extend(f.sketch_ids.iter().copied());
        }
        let unioned = union_all(group.into_iter().map(|f| single(f.geometry)));
        out.extend(unioned.0.into_iter().map(|p| SketchFragment {
            geometry: p,
            geography_ids: geography_ids.clone(),
            sketch_ids: sketch_ids.clone(),
        }));
    }
    out
}

/// Canonical form of a partition: touching pieces with identical sketch and
/// geography attribution are one fragment.
pub fn normalize_fragments(fragments: Vec<SketchFragment>) -> Vec<SketchFragment> {
    merge_touching_fragments(fragments, &[AttributionKey::Sketches, AttributionKey::Geographies])
}

fn normalize_pieces(pieces: Vec<Piece>) -> Vec<SketchFragment> {
    normalize_fragments(pieces.into_iter().map(|p| p.fragment).collect())
}

fn keep_significant(fragments: Vec<SketchFragment>, options: &FragmentOptions) -> Vec<SketchFragment> {
    fragments
        .into_iter()
        .filter(|f| f.area_m2() > options.min_area_m2)
        .collect()
}

fn merge_attribution(into: &mut SketchFragment, from: &SketchFragment, keys: &[AttributionKey]) {
    for key in keys {
        match key {
            AttributionKey::Geographies => into.geography_ids.extend(from.geography_ids.iter().copied()),
            AttributionKey::Sketches => into.sketch_ids.extend(from.sketch_ids.iter().copied()),
        }
    }
}

fn decompose(
    mut pieces: Vec<Piece>,
    keys: &[AttributionKey],
    max_iterations: usize,
    ids: &mut PieceIds,
) -> Result<Vec<Piece>, FragmentError> {
    for pass in 0..=max_iterations {
        let (next, split_any) = decompose_pass(&pieces, keys, ids);
        pieces = next;
        if !split_any {
            if pass > 0 {
                debug!(passes = pass, pieces = pieces.len(), "fragments decomposed");
            }
            return Ok(pieces);
        }
    }
    Err(FragmentError::DecomposeLimitExceeded {
        iterations: max_iterations,
    })
}

/// Splits each piece against the first later-unprocessed piece it overlaps.
fn decompose_pass(pieces: &[Piece], keys: &[AttributionKey], ids: &mut PieceIds) -> (Vec<Piece>, bool) {
    let mut processed: HashSet<u64> = HashSet::with_capacity(pieces.len());
    let mut out = Vec::with_capacity(pieces.len());
    let mut split_any = false;

    for piece in pieces {
        if processed.contains(&piece.id) {
            continue;
        }
        let mut split_found = false;
        for other in pieces {
            if other.id == piece.id || processed.contains(&other.id) {
                continue;
            }
            if !piece.bbox.intersects(&other.bbox) || !piece.fragment.geometry.intersects(&other.fragment.geometry) {
                continue;
            }
            if let Some(parts) = split(piece, other, keys, ids) {
                processed.insert(piece.id);
                processed.insert(other.id);
                out.extend(parts);
                split_found = true;
                split_any = true;
                break;
            }
        }
        if !split_found {
            processed.insert(piece.id);
            out.push(piece.clone());
        }
    }
    (out, split_any)
}

/// Intersection (with merged attribution) plus both differences, or `None`
/// when the two only touch.
fn split(a: &Piece, b: &Piece, keys: &[AttributionKey], ids: &mut PieceIds) -> Option<Vec<Piece>> {
    let ga = single(a.fragment.geometry.clone());
    let gb = single(b.fragment.geometry.clone());
    let shared = drop_slivers(ga.intersection(&gb));
    if shared.unsigned_area() <= AREA_EPSILON {
        return None;
    }
    let only_a = drop_slivers(ga.difference(&gb));
    let only_b = drop_slivers(gb.difference(&ga));

    let mut merged = a.fragment.clone();
    merge_attribution(&mut merged, &b.fragment, keys);

    let mut out = Vec::new();
    let mut emit = |mp: MultiPolygon<f64>, template: &SketchFragment| {
        for polygon in mp.0 {
            let fragment = SketchFragment {
                geometry: polygon,
                geography_ids: template.geography_ids.clone(),
                sketch_ids: template.sketch_ids.clone(),
            };
            if let Some(piece) = ids.piece(fragment) {
                out.push(piece);
            }
        }
    };
    emit(shared, &merged);
    emit(only_a, &a.fragment);
    emit(only_b, &b.fragment);
    Some(out)
}

fn same_footprint(a: &Piece, b: &Piece) -> bool {
    const BBOX_TOLERANCE: f64 = 1e-9;
    let close = |x: f64, y: f64| (x - y).abs() <= BBOX_TOLERANCE;
    if !(close(a.bbox.min_x, b.bbox.min_x)
        && close(a.bbox.min_y, b.bbox.min_y)
        && close(a.bbox.max_x, b.bbox.max_x)
        && close(a.bbox.max_y, b.bbox.max_y))
    {
        return false;
    }
    if canonical_polygon(&a.fragment.geometry) == canonical_polygon(&b.fragment.geometry) {
        return true;
    }
    let ga = single(a.fragment.geometry.clone());
    let gb = single(b.fragment.geometry.clone());
    ga.xor(&gb).unsigned_area() <= AREA_EPSILON
}

fn merge_matching(pieces: Vec<Piece>, keys: &[AttributionKey]) -> Vec<Piece> {
    let mut removed = vec![false; pieces.len()];
    let mut out = Vec::with_capacity(pieces.len());
    for i in 0..pieces.len() {
        if removed[i] {
            continue;
        }
        removed[i] = true;
        let mut piece = pieces[i].clone();
        for j in (i + 1)..pieces.len() {
            if removed[j] || !same_footprint(&piece, &pieces[j]) {
                continue;
            }
            merge_attribution(&mut piece.fragment, &pieces[j].fragment, keys);
            removed[j] = true;
        }
        out.push(piece);
    }
    out
}
