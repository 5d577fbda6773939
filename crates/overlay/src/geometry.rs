use foundation::Envelope;
use geo::{Area, BooleanOps, BoundingRect, ChamberlainDuquetteArea, MultiPolygon, Polygon, Rect};

/// Planar areas (deg²) at or below this are treated as empty.
pub const AREA_EPSILON: f64 = 1e-14;

pub fn rect_envelope(r: Rect<f64>) -> Envelope {
    Envelope::new(r.min().x, r.min().y, r.max().x, r.max().y)
}

pub fn polygon_envelope(p: &Polygon<f64>) -> Option<Envelope> {
    p.bounding_rect().map(rect_envelope)
}

pub fn multipolygon_envelope(mp: &MultiPolygon<f64>) -> Option<Envelope> {
    mp.bounding_rect().map(rect_envelope)
}

/// Geodesic area in square metres.
pub fn geodesic_area_m2(p: &Polygon<f64>) -> f64 {
    p.chamberlain_duquette_unsigned_area()
}

pub fn multipolygon_area_m2(mp: &MultiPolygon<f64>) -> f64 {
    mp.chamberlain_duquette_unsigned_area()
}

pub fn is_empty(mp: &MultiPolygon<f64>) -> bool {
    mp.0.is_empty() || mp.unsigned_area() <= AREA_EPSILON
}

/// Removes polygons whose planar area is float noise.
pub fn drop_slivers(mp: MultiPolygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(
        mp.0
            .into_iter()
            .filter(|p| p.unsigned_area() > AREA_EPSILON)
            .collect(),
    )
}

pub fn single(p: Polygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![p])
}

/// Union of every input, folding pairwise. Inputs may overlap.
pub fn union_all(parts: impl IntoIterator<Item = MultiPolygon<f64>>) -> MultiPolygon<f64> {
    let mut acc: Option<MultiPolygon<f64>> = None;
    for part in parts {
        if part.0.is_empty() {
            continue;
        }
        acc = Some(match acc {
            None => part,
            Some(a) => a.union(&part),
        });
    }
    acc.map(drop_slivers)
        .unwrap_or_else(|| MultiPolygon::new(Vec::new()))
}

#[cfg(test)]
pub(crate) mod test_shapes {
    use geo::{MultiPolygon, Polygon, polygon};

    pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Polygon<f64> {
        polygon![
            (x: min_x, y: min_y),
            (x: max_x, y: min_y),
            (x: max_x, y: max_y),
            (x: min_x, y: max_y),
            (x: min_x, y: min_y),
        ]
    }

    pub fn rect_mp(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![rect(min_x, min_y, max_x, max_y)])
    }
}

#[cfg(test)]
mod tests {
    use super::test_shapes::{rect, rect_mp};
    use super::{geodesic_area_m2, is_empty, union_all};
    use geo::Area;

    #[test]
    fn union_merges_overlapping_inputs() {
        let u = union_all([rect_mp(0.0, 0.0, 2.0, 2.0), rect_mp(1.0, 0.0, 3.0, 2.0)]);
        assert_eq!(u.0.len(), 1);
        assert!((u.unsigned_area() - 6.0).abs() < 1e-9);
        assert!(is_empty(&union_all(Vec::new())));
    }

    #[test]
    fn geodesic_area_of_small_equatorial_square() {
        // 0.01° is roughly 1.11km at the equator
        let a = geodesic_area_m2(&rect(0.0, 0.0, 0.01, 0.01));
        assert!(a > 1.1e6 && a < 1.3e6, "area {a}");
    }
}
