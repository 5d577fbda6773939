//! Clipping sketches against geographies.
//!
//! A geography is an ordered list of clipping layers. Each layer names a
//! source of polygons, an operation, and an optional CQL2 filter on the
//! source's feature properties. Layers apply one after another to a working
//! geometry; geographies are clipped concurrently.

use std::collections::BTreeSet;

use formats::Feature;
use foundation::GeographyId;
use futures_util::future::try_join_all;
use geo::{Area, BooleanOps, Geometry, MultiPolygon};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cql2::{consolidate_queries, evaluate};
use crate::error::ClipError;
use crate::executor::{ClipExecutor, ClipRequest};
use crate::fragments::{FragmentOptions, SketchFragment, SketchRef, create_fragments, eliminate_overlap};
use crate::geometry::{AREA_EPSILON, drop_slivers, is_empty, single, union_all};
use crate::prepare::PreparedSketch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClippingOperation {
    Intersect,
    Difference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClippingLayer {
    pub op: ClippingOperation,
    /// Object key or URL of the polygon source.
    pub source: String,
    /// Absent means every feature in the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cql2_query: Option<Value>,
}

impl ClippingLayer {
    pub fn new(op: ClippingOperation, source: impl Into<String>) -> Self {
        ClippingLayer {
            op,
            source: source.into(),
            cql2_query: None,
        }
    }

    pub fn with_query(mut self, query: Value) -> Self {
        self.cql2_query = Some(query);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeographySettings {
    pub id: GeographyId,
    pub clipping_layers: Vec<ClippingLayer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolygonClipResult {
    pub changed: bool,
    pub op: ClippingOperation,
    /// `None` when nothing of the sketch survives the operation.
    pub output: Option<MultiPolygon<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClipOutput {
    pub clipped: MultiPolygon<f64>,
    pub fragments: Vec<SketchFragment>,
}

/// Applies one operation between `sketch` and every polygon in `features`
/// that passes `query`.
pub fn clip_sketch_to_polygons(
    sketch: &MultiPolygon<f64>,
    op: ClippingOperation,
    query: Option<&Value>,
    features: &[Feature],
) -> Result<PolygonClipResult, ClipError> {
    let mut candidates = Vec::new();
    for feature in features {
        if let Some(q) = query {
            if !evaluate(q, &feature.properties)? {
                continue;
            }
        }
        match &feature.geometry {
            Some(Geometry::Polygon(p)) => candidates.push(single(p.clone())),
            Some(Geometry::MultiPolygon(mp)) => candidates.push(mp.clone()),
            _ => {}
        }
    }

    if candidates.is_empty() {
        return Ok(match op {
            ClippingOperation::Intersect => PolygonClipResult {
                changed: true,
                op,
                output: None,
            },
            ClippingOperation::Difference => PolygonClipResult {
                changed: false,
                op,
                output: Some(sketch.clone()),
            },
        });
    }

    let mask = union_all(candidates);
    let result = drop_slivers(match op {
        ClippingOperation::Intersect => sketch.intersection(&mask),
        ClippingOperation::Difference => sketch.difference(&mask),
    });
    if is_empty(&result) {
        return Ok(PolygonClipResult {
            changed: true,
            op,
            output: None,
        });
    }

    let changed = (result.unsigned_area() - sketch.unsigned_area()).abs() > AREA_EPSILON;
    Ok(PolygonClipResult {
        changed,
        op,
        output: Some(if changed { result } else { sketch.clone() }),
    })
}

/// Merges layers that share a source and operation, OR-ing their filters.
/// The first occurrence keeps its position.
pub fn consolidate_clipping_layers(layers: &[ClippingLayer]) -> Vec<ClippingLayer> {
    let mut out: Vec<ClippingLayer> = Vec::with_capacity(layers.len());
    // layers with no filter make the merged layer unfiltered
    let mut unfiltered: Vec<bool> = Vec::with_capacity(layers.len());
    for layer in layers {
        let existing = out
            .iter()
            .position(|l| l.source == layer.source && l.op == layer.op);
        match existing {
            Some(i) => {
                if unfiltered[i] || layer.cql2_query.is_none() {
                    unfiltered[i] = true;
                    out[i].cql2_query = None;
                } else {
                    out[i].cql2_query =
                        consolidate_queries(out[i].cql2_query.take(), layer.cql2_query.clone());
                }
            }
            None => {
                unfiltered.push(layer.cql2_query.is_none());
                out.push(layer.clone());
            }
        }
    }
    out
}

/// Clips a prepared sketch to a single geography. `Ok(None)` means the sketch
/// lies entirely outside it.
pub async fn clip_to_geography(
    prepared: &PreparedSketch,
    layers: &[ClippingLayer],
    executor: &dyn ClipExecutor,
) -> Result<Option<MultiPolygon<f64>>, ClipError> {
    let layers = consolidate_clipping_layers(layers);
    if !layers.iter().any(|l| l.op == ClippingOperation::Intersect) {
        return Err(ClipError::MissingIntersectLayer);
    }

    let mut working = prepared.geometry.clone();
    for layer in layers {
        let source = layer.source.clone();
        let result = executor
            .clip(ClipRequest {
                sketch: working.clone(),
                envelopes: prepared.envelopes.clone(),
                layer,
            })
            .await?;
        match result.output {
            None => {
                debug!(%source, op = ?result.op, "sketch eliminated by clipping layer");
                return Ok(None);
            }
            Some(output) if result.changed => working = output,
            Some(_) => {}
        }
    }
    Ok(Some(working))
}

/// Clips a prepared sketch to every active geography and partitions the
/// result into fragments, merged with `existing_overlapping` so that no two
/// output fragments overlap.
///
/// With no active geographies the sketch is returned unclipped, gets no
/// fragments of its own, and `existing_overlapping` comes back as is. An
/// active id without settings is an error. Fragment partitioning runs on the
/// blocking pool.
pub async fn clip_to_geographies(
    prepared: &PreparedSketch,
    geographies: &[GeographySettings],
    active_ids: &[GeographyId],
    existing_overlapping: Vec<SketchFragment>,
    sketch_ref: SketchRef,
    executor: &dyn ClipExecutor,
    options: &FragmentOptions,
) -> Result<ClipOutput, ClipError> {
    let mut seen = BTreeSet::new();
    for id in active_ids {
        if !seen.insert(*id) {
            return Err(ClipError::DuplicateGeography(*id));
        }
    }

    let active: Vec<&GeographySettings> = active_ids
        .iter()
        .map(|id| {
            geographies
                .iter()
                .find(|g| g.id == *id)
                .ok_or(ClipError::UnknownGeography(*id))
        })
        .collect::<Result<_, _>>()?;

    if active.is_empty() {
        return Ok(ClipOutput {
            clipped: prepared.geometry.clone(),
            fragments: existing_overlapping,
        });
    }

    let results = try_join_all(active.iter().map(|geography| async move {
        let clipped = clip_to_geography(prepared, &geography.clipping_layers, executor).await?;
        Ok::<_, ClipError>((geography.id, clipped))
    }))
    .await?;

    let per_geography: Vec<(GeographyId, MultiPolygon<f64>)> = results
        .into_iter()
        .filter_map(|(id, clipped)| clipped.map(|mp| (id, mp)))
        .collect();

    let clipped = union_all(per_geography.iter().map(|(_, mp)| mp.clone()));
    if is_empty(&clipped) {
        return Err(ClipError::ClippingFailed);
    }

    let options = *options;
    let (created, fragments) = tokio::task::spawn_blocking(move || {
        let fragments: Vec<SketchFragment> = create_fragments(per_geography, &options)?
            .into_iter()
            .map(|mut f| {
                f.sketch_ids.insert(sketch_ref);
                f
            })
            .collect();
        let created = fragments.len();
        Ok::<_, ClipError>((created, eliminate_overlap(fragments, existing_overlapping, &options)?))
    })
    .await
    .map_err(|e| ClipError::WorkerFailed(e.to_string()))??;
    debug!(
        geographies = active.len(),
        created,
        total = fragments.len(),
        "sketch clipped to geographies"
    );

    Ok(ClipOutput { clipped, fragments })
}

#[cfg(test)]
mod tests {
    use super::{
        ClippingLayer, ClippingOperation, GeographySettings, clip_sketch_to_polygons, clip_to_geographies,
        clip_to_geography, consolidate_clipping_layers,
    };
    use crate::error::ClipError;
    use crate::executor::InlineClipExecutor;
    use crate::executor::test_sources::source_cache;
    use crate::fragments::{FragmentOptions, SketchFragment, SketchRef};
    use crate::geometry::test_shapes::{rect, rect_mp};
    use crate::prepare::{prepare_geometry, prepare_sketch};
    use formats::Feature;
    use foundation::{GeographyId, SketchId};
    use geo::{Area, MultiPolygon, polygon};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn eez() -> Vec<Feature> {
        vec![
            Feature::new(rect(-10.0, -10.0, 0.0, 10.0)).with_property("name", "West"),
            Feature::new(rect(0.0, -10.0, 10.0, 10.0)).with_property("name", "East"),
        ]
    }

    fn territorial() -> Vec<Feature> {
        vec![Feature::new(rect(-1.0, -10.0, 1.0, 10.0)).with_property("name", "Strait")]
    }

    fn intersect(source: &str) -> ClippingLayer {
        ClippingLayer::new(ClippingOperation::Intersect, source)
    }

    fn difference(source: &str) -> ClippingLayer {
        ClippingLayer::new(ClippingOperation::Difference, source)
    }

    #[test]
    fn layers_deserialize_from_camel_case_json() {
        let layer: ClippingLayer = serde_json::from_value(json!({
            "op": "INTERSECT",
            "source": "eez.sksf",
            "cql2Query": {"op": "=", "args": [{"property": "name"}, "US"]}
        }))
        .unwrap();
        assert_eq!(layer.op, ClippingOperation::Intersect);
        assert!(layer.cql2_query.is_some());

        let geography: GeographySettings = serde_json::from_value(json!({
            "id": 4,
            "clippingLayers": [{"op": "DIFFERENCE", "source": "land.sksf"}]
        }))
        .unwrap();
        assert_eq!(geography.id, GeographyId::new(4));
        assert_eq!(geography.clipping_layers[0].cql2_query, None);
    }

    #[test]
    fn intersect_and_difference_primitives() {
        let sketch = rect_mp(-2.0, 0.0, 2.0, 1.0);
        let west_only = json!({"op": "=", "args": [{"property": "name"}, "West"]});

        let r = clip_sketch_to_polygons(&sketch, ClippingOperation::Intersect, Some(&west_only), &eez()).unwrap();
        assert!(r.changed);
        assert!((r.output.unwrap().unsigned_area() - 2.0).abs() < 1e-9);

        let r = clip_sketch_to_polygons(&sketch, ClippingOperation::Intersect, None, &eez()).unwrap();
        assert!(!r.changed);
        assert_eq!(r.output, Some(sketch.clone()));

        let nothing = json!({"op": "=", "args": [{"property": "name"}, "Nowhere"]});
        let r = clip_sketch_to_polygons(&sketch, ClippingOperation::Intersect, Some(&nothing), &eez()).unwrap();
        assert!(r.changed);
        assert_eq!(r.output, None);

        let r = clip_sketch_to_polygons(&sketch, ClippingOperation::Difference, Some(&nothing), &eez()).unwrap();
        assert!(!r.changed);
        assert_eq!(r.output, Some(sketch.clone()));

        let r = clip_sketch_to_polygons(&sketch, ClippingOperation::Difference, None, &eez()).unwrap();
        assert!(r.changed);
        assert_eq!(r.output, None);
    }

    #[test]
    fn bad_filters_surface_as_query_errors() {
        let sketch = rect_mp(-2.0, 0.0, 2.0, 1.0);
        let err = clip_sketch_to_polygons(
            &sketch,
            ClippingOperation::Intersect,
            Some(&json!({"op": "~~", "args": [1, 2]})),
            &eez(),
        )
        .unwrap_err();
        assert!(matches!(err, ClipError::Query(_)));
    }

    #[test]
    fn consolidation_merges_same_source_and_op() {
        let us = json!({"op": "=", "args": [{"property": "name"}, "US"]});
        let mx = json!({"op": "=", "args": [{"property": "name"}, "Mexico"]});
        let layers = vec![
            intersect("eez").with_query(us.clone()),
            difference("land"),
            intersect("eez").with_query(mx.clone()),
        ];
        let out = consolidate_clipping_layers(&layers);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].cql2_query, Some(json!({"op": "or", "args": [us.clone(), mx]})));
        assert_eq!(out[1].source, "land");

        let with_unfiltered = vec![intersect("eez").with_query(us.clone()), intersect("eez"), intersect("eez").with_query(us)];
        assert_eq!(consolidate_clipping_layers(&with_unfiltered)[0].cql2_query, None);
    }

    #[tokio::test]
    async fn geography_needs_an_intersect_layer() {
        let executor = InlineClipExecutor::new(source_cache(&[("land", territorial())]));
        let prepared = prepare_geometry(&rect_mp(0.0, 0.0, 1.0, 1.0)).unwrap();
        let err = clip_to_geography(&prepared, &[difference("land")], &executor).await.unwrap_err();
        assert!(matches!(err, ClipError::MissingIntersectLayer));
    }

    #[tokio::test]
    async fn layers_apply_in_order() {
        let executor = InlineClipExecutor::new(source_cache(&[("eez", eez()), ("land", territorial())]));
        let prepared = prepare_geometry(&rect_mp(-3.0, 0.0, 3.0, 1.0)).unwrap();

        let out = clip_to_geography(&prepared, &[intersect("eez"), difference("land")], &executor)
            .await
            .unwrap()
            .unwrap();
        // 6 wide minus the 2 wide strait
        assert!((out.unsigned_area() - 4.0).abs() < 1e-9);
        assert_eq!(out.0.len(), 2);

        let outside = prepare_geometry(&rect_mp(20.0, 0.0, 21.0, 1.0)).unwrap();
        let none = clip_to_geography(&outside, &[intersect("eez")], &executor).await.unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn missing_sources_propagate() {
        let executor = InlineClipExecutor::new(source_cache(&[]));
        let prepared = prepare_geometry(&rect_mp(0.0, 0.0, 1.0, 1.0)).unwrap();
        let err = clip_to_geography(&prepared, &[intersect("missing.sksf")], &executor)
            .await
            .unwrap_err();
        assert!(matches!(err, ClipError::Source(_)));
    }

    fn geographies() -> Vec<GeographySettings> {
        vec![
            GeographySettings {
                id: GeographyId::new(1),
                clipping_layers: vec![intersect("eez")],
            },
            GeographySettings {
                id: GeographyId::new(2),
                clipping_layers: vec![intersect("eez").with_query(json!({"op": "=", "args": [{"property": "name"}, "East"]}))],
            },
        ]
    }

    #[tokio::test]
    async fn overlapping_geographies_become_disjoint_fragments() {
        let executor = InlineClipExecutor::new(source_cache(&[("eez", eez())]));
        let prepared = prepare_geometry(&rect_mp(-0.01, 0.0, 0.01, 0.01)).unwrap();
        let ids = [GeographyId::new(1), GeographyId::new(2)];

        let out = clip_to_geographies(
            &prepared,
            &geographies(),
            &ids,
            Vec::new(),
            SketchRef::Pending,
            &executor,
            &FragmentOptions::default(),
        )
        .await
        .unwrap();

        assert!((out.clipped.unsigned_area() - 0.0002).abs() < 1e-12);
        assert_eq!(out.fragments.len(), 2);
        let mut tags: Vec<Vec<i64>> = out
            .fragments
            .iter()
            .map(|f| f.geography_ids.iter().map(|g| g.get()).collect())
            .collect();
        tags.sort();
        assert_eq!(tags, vec![vec![1], vec![1, 2]]);
        assert!(out.fragments.iter().all(|f| f.sketch_ids.contains(&SketchRef::Pending)));
    }

    #[tokio::test]
    async fn duplicate_and_empty_geography_lists() {
        let executor = InlineClipExecutor::new(source_cache(&[("eez", eez())]));
        let prepared = prepare_geometry(&rect_mp(-0.01, 0.0, 0.01, 0.01)).unwrap();
        let options = FragmentOptions::default();

        let dup = [GeographyId::new(1), GeographyId::new(1)];
        let err = clip_to_geographies(&prepared, &geographies(), &dup, Vec::new(), SketchRef::Pending, &executor, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClipError::DuplicateGeography(id) if id == GeographyId::new(1)));

        let out = clip_to_geographies(&prepared, &geographies(), &[], Vec::new(), SketchRef::Pending, &executor, &options)
            .await
            .unwrap();
        assert_eq!(out.clipped, prepared.geometry);
        assert!(out.fragments.is_empty());
    }

    #[tokio::test]
    async fn unknown_geography_is_an_error() {
        let executor = InlineClipExecutor::new(source_cache(&[("eez", eez())]));
        let prepared = prepare_geometry(&rect_mp(-0.01, 0.0, 0.01, 0.01)).unwrap();
        let ids = [GeographyId::new(1), GeographyId::new(99)];

        let err = clip_to_geographies(
            &prepared,
            &geographies(),
            &ids,
            Vec::new(),
            SketchRef::Pending,
            &executor,
            &FragmentOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClipError::UnknownGeography(id) if id == GeographyId::new(99)));
        assert_eq!(err.to_string(), "geography 99 has no clipping settings");
    }

    #[tokio::test]
    async fn sketch_outside_every_geography_fails() {
        let executor = InlineClipExecutor::new(source_cache(&[("eez", eez())]));
        let prepared = prepare_geometry(&rect_mp(50.0, 0.0, 51.0, 1.0)).unwrap();
        let err = clip_to_geographies(
            &prepared,
            &geographies(),
            &[GeographyId::new(1)],
            Vec::new(),
            SketchRef::Pending,
            &executor,
            &FragmentOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClipError::ClippingFailed));
    }

    #[tokio::test]
    async fn new_fragments_merge_with_existing_ones() {
        let executor = InlineClipExecutor::new(source_cache(&[("eez", eez())]));
        let prepared = prepare_geometry(&rect_mp(0.01, 0.0, 0.03, 0.01)).unwrap();
        let existing = vec![SketchFragment::new(
            rect(0.0, 0.0, 0.02, 0.01),
            [GeographyId::new(1)],
            [SketchRef::Known(SketchId::new(7))],
        )];

        let out = clip_to_geographies(
            &prepared,
            &geographies()[..1],
            &[GeographyId::new(1)],
            existing,
            SketchRef::Pending,
            &executor,
            &FragmentOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(out.fragments.len(), 3);
        let shared = out.fragments.iter().filter(|f| f.sketch_ids.len() == 2).count();
        assert_eq!(shared, 1);
    }

    #[tokio::test]
    async fn antimeridian_parts_clip_like_independent_sketches() {
        let ocean = vec![Feature::new(rect(-180.0, -30.0, 180.0, 0.0))];
        let land = vec![
            Feature::new(rect(179.5, -19.0, 180.0, -18.0)),
            Feature::new(rect(-180.0, -19.0, -179.5, -18.0)),
        ];
        let executor = InlineClipExecutor::new(source_cache(&[("ocean", ocean), ("land", land)]));
        let layers = [intersect("ocean"), difference("land")];

        let sketch = Feature::new(polygon![
            (x: 179.0, y: -20.0),
            (x: 181.0, y: -20.0),
            (x: 181.0, y: -17.0),
            (x: 179.0, y: -17.0),
            (x: 179.0, y: -20.0),
        ]);
        let prepared = prepare_sketch(&sketch).unwrap();
        assert!(prepared.envelopes.len() >= 2);
        let whole = clip_to_geography(&prepared, &layers, &executor).await.unwrap().unwrap();

        let mut parts_area = 0.0;
        for part in &prepared.geometry.0 {
            let alone = prepare_geometry(&MultiPolygon::new(vec![part.clone()])).unwrap();
            let clipped = clip_to_geography(&alone, &layers, &executor).await.unwrap().unwrap();
            parts_area += clipped.unsigned_area();
        }
        assert!((whole.unsigned_area() - parts_area).abs() < 1e-9);
        // 2x3 box minus two 0.5x1 islands
        assert!((whole.unsigned_area() - 5.0).abs() < 1e-9);
    }
}
