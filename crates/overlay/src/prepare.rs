//! Normalizes user-drawn polygons before clipping.
//!
//! Longitudes are taken as drawn: a ring that continues past ±180° (as map
//! drawing tools emit when a shape crosses the antimeridian) is cut at each
//! ±180° + k·360° meridian and every piece is shifted back into [-180, 180].
//! Each side of the antimeridian gets its own envelope so source lookups
//! stay narrow.

use formats::Feature;
use foundation::Envelope;
use geo::{BooleanOps, BoundingRect, Coord, Geometry, LineString, MapCoordsInPlace, MultiPolygon, Polygon, Rect, Translate};
use serde_json::{Map, Value};

use crate::error::InvalidGeometryError;
use crate::geometry::{drop_slivers, polygon_envelope, rect_envelope, single};

/// Rings may run one full turn past the antimeridian in either direction,
/// which bounds the antimeridian split to three world bands.
pub const MAX_ABS_LONGITUDE: f64 = 540.0;

/// A sketch ready for clipping: always a MultiPolygon with coordinates inside
/// [-180, 180] x [-90, 90], plus one or more lookup envelopes.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSketch {
    pub geometry: MultiPolygon<f64>,
    pub properties: Map<String, Value>,
    pub envelopes: Vec<Envelope>,
}

impl PreparedSketch {
    pub fn to_feature(&self) -> Feature {
        Feature::new(self.geometry.clone()).with_properties(self.properties.clone())
    }
}

pub fn prepare_sketch(feature: &Feature) -> Result<PreparedSketch, InvalidGeometryError> {
    let geometry = match &feature.geometry {
        None => return Err(InvalidGeometryError::new("feature has no geometry")),
        Some(Geometry::Polygon(p)) => single(p.clone()),
        Some(Geometry::MultiPolygon(mp)) => mp.clone(),
        Some(_) => {
            return Err(InvalidGeometryError::new(
                "feature geometry is not a polygon or multipolygon",
            ));
        }
    };
    let mut prepared = prepare_geometry(&geometry)?;
    prepared.properties = feature.properties.clone();
    Ok(prepared)
}

pub fn prepare_geometry(geometry: &MultiPolygon<f64>) -> Result<PreparedSketch, InvalidGeometryError> {
    if geometry.0.is_empty() {
        return Err(InvalidGeometryError::new("geometry has no polygons"));
    }

    let mut parts: Vec<Polygon<f64>> = Vec::new();
    for polygon in geometry {
        let cleaned = clean_polygon(polygon)?;
        parts.extend(split_at_antimeridian(cleaned));
    }
    if parts.is_empty() {
        return Err(InvalidGeometryError::new("geometry has no area"));
    }

    let envelopes = side_envelopes(&parts);
    Ok(PreparedSketch {
        geometry: MultiPolygon::new(parts),
        properties: Map::new(),
        envelopes,
    })
}

fn clean_ring(ring: &LineString<f64>) -> Result<Option<LineString<f64>>, InvalidGeometryError> {
    let mut out: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for c in ring.coords() {
        if !c.x.is_finite() || !c.y.is_finite() {
            return Err(InvalidGeometryError::new("coordinate is not a finite number"));
        }
        if c.x.abs() > MAX_ABS_LONGITUDE {
            return Err(InvalidGeometryError::new(format!(
                "longitude {} is outside [-{MAX_ABS_LONGITUDE}, {MAX_ABS_LONGITUDE}]",
                c.x
            )));
        }
        let c = Coord {
            x: c.x,
            y: c.y.clamp(-90.0, 90.0),
        };
        if out.last() != Some(&c) {
            out.push(c);
        }
    }
    let distinct = if out.len() > 1 && out.first() == out.last() {
        out.len() - 1
    } else {
        out.len()
    };
    if distinct < 3 {
        return Ok(None);
    }
    Ok(Some(LineString::new(out)))
}

fn clean_polygon(polygon: &Polygon<f64>) -> Result<Polygon<f64>, InvalidGeometryError> {
    let exterior = clean_ring(polygon.exterior())?.ok_or_else(|| {
        InvalidGeometryError::new("polygon ring has fewer than 3 distinct positions")
    })?;
    let mut interiors = Vec::with_capacity(polygon.interiors().len());
    for hole in polygon.interiors() {
        // degenerate holes carry no area
        if let Some(h) = clean_ring(hole)? {
            interiors.push(h);
        }
    }
    Ok(Polygon::new(exterior, interiors))
}

fn world_band(k: i64) -> Rect<f64> {
    let offset = 360.0 * k as f64;
    Rect::new(
        Coord {
            x: -180.0 + offset,
            y: -90.0,
        },
        Coord {
            x: 180.0 + offset,
            y: 90.0,
        },
    )
}

fn split_at_antimeridian(polygon: Polygon<f64>) -> Vec<Polygon<f64>> {
    let Some(bbox) = polygon.bounding_rect() else {
        return Vec::new();
    };
    let k_min = ((bbox.min().x + 180.0) / 360.0).floor() as i64;
    let k_max = (((bbox.max().x + 180.0) / 360.0).ceil() as i64 - 1).max(k_min);

    if k_min == k_max {
        let mut p = polygon;
        if k_min != 0 {
            p.translate_mut(-360.0 * k_min as f64, 0.0);
        }
        return vec![p];
    }

    let shape = single(polygon);
    let mut out = Vec::new();
    for k in k_min..=k_max {
        let band = single(world_band(k).to_polygon());
        let mut piece = drop_slivers(shape.intersection(&band));
        piece.translate_mut(-360.0 * k as f64, 0.0);
        piece.map_coords_in_place(|c| Coord {
            x: c.x.clamp(-180.0, 180.0),
            y: c.y,
        });
        out.extend(piece.0);
    }
    out
}

/// One envelope per side of the antimeridian when the parts straddle it,
/// otherwise a single envelope.
fn side_envelopes(parts: &[Polygon<f64>]) -> Vec<Envelope> {
    let boxes: Vec<Envelope> = parts.iter().filter_map(polygon_envelope).collect();
    let Some(all) = boxes.iter().copied().reduce(|a, b| a.union(&b)) else {
        return vec![rect_envelope(world_band(0))];
    };
    if all.width() <= 180.0 {
        return vec![all];
    }

    let west = boxes
        .iter()
        .filter(|b| b.center_x() < 0.0)
        .copied()
        .reduce(|a, b| a.union(&b));
    let east = boxes
        .iter()
        .filter(|b| b.center_x() >= 0.0)
        .copied()
        .reduce(|a, b| a.union(&b));
    west.into_iter().chain(east).collect()
}

#[cfg(test)]
mod tests {
    use super::{prepare_geometry, prepare_sketch};
    use crate::geometry::test_shapes::rect;
    use formats::Feature;
    use geo::{Area, Geometry, LineString, MultiPolygon, Polygon, polygon};
    use pretty_assertions::assert_eq;

    fn fiji() -> Feature {
        Feature::new(polygon![
            (x: -179.80398136940497, y: -18.239142587280796),
            (x: -180.9365457122359, y: -18.500028902661512),
            (x: -180.9365457122359, y: -19.79323973503641),
            (x: -179.26518862378637, y: -19.66386044955297),
            (x: -178.6384297156178, y: -18.67720520157191),
            (x: -179.80398136940497, y: -18.239142587280796),
        ])
    }

    #[test]
    fn polygon_becomes_multipolygon_with_one_envelope() {
        let poly = polygon![
            (x: -119.58587240373465, y: 34.04280353222843),
            (x: -119.52338779103391, y: 34.04280353222843),
            (x: -119.52338779103391, y: 34.130980885369),
            (x: -119.58587240373465, y: 34.130980885369),
            (x: -119.58587240373465, y: 34.04280353222843),
        ];
        let feature = Feature::new(poly.clone()).with_property("name", "Scorpion Anchorage");
        let prepared = prepare_sketch(&feature).unwrap();

        assert_eq!(prepared.geometry, MultiPolygon::new(vec![poly]));
        assert_eq!(prepared.properties, feature.properties);
        assert_eq!(prepared.envelopes.len(), 1);
        assert_eq!(prepared.envelopes[0].min_x, -119.58587240373465);
    }

    #[test]
    fn antimeridian_crossing_is_split_into_two_sides() {
        let feature = fiji();
        let prepared = prepare_sketch(&feature).unwrap();

        assert!(prepared.envelopes.len() > 1);
        assert!(prepared.geometry.0.len() >= 2);
        for c in prepared.geometry.0.iter().flat_map(|p| p.exterior().coords()) {
            assert!((-180.0..=180.0).contains(&c.x), "x {}", c.x);
            assert!((-90.0..=90.0).contains(&c.y));
        }

        let original = match &feature.geometry {
            Some(Geometry::Polygon(p)) => p.unsigned_area(),
            _ => unreachable!(),
        };
        assert!((prepared.geometry.unsigned_area() - original).abs() < 1e-9);
    }

    #[test]
    fn shapes_drawn_one_world_over_are_shifted_back() {
        let prepared = prepare_geometry(&MultiPolygon::new(vec![rect(190.0, 0.0, 200.0, 10.0)])).unwrap();
        assert_eq!(prepared.envelopes.len(), 1);
        assert_eq!(prepared.envelopes[0].min_x, -170.0);
        assert_eq!(prepared.envelopes[0].max_x, -160.0);
    }

    #[test]
    fn duplicate_vertices_are_removed_and_open_rings_closed() {
        let ring = LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        let prepared = prepare_geometry(&MultiPolygon::new(vec![Polygon::new(ring, vec![])])).unwrap();
        let ext = prepared.geometry.0[0].exterior();
        assert_eq!(ext.0.len(), 5);
        assert_eq!(ext.0.first(), ext.0.last());
    }

    #[test]
    fn non_polygons_and_empty_features_are_rejected() {
        let no_geom = Feature {
            id: None,
            properties: Default::default(),
            geometry: None,
        };
        assert_eq!(
            prepare_sketch(&no_geom).unwrap_err().to_string(),
            "invalid geometry: feature has no geometry"
        );

        let point = Feature::new(geo::Point::new(0.0, 0.0));
        assert_eq!(
            prepare_sketch(&point).unwrap_err().to_string(),
            "invalid geometry: feature geometry is not a polygon or multipolygon"
        );

        let sliver = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)];
        assert!(prepare_geometry(&MultiPolygon::new(vec![sliver])).is_err());
    }

    #[test]
    fn far_out_longitudes_are_rejected() {
        let err = prepare_geometry(&MultiPolygon::new(vec![rect(0.0, 0.0, 1e12, 10.0)])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid geometry: longitude 1000000000000 is outside [-540, 540]"
        );

        // a full extra turn each way is still split
        let wide = prepare_geometry(&MultiPolygon::new(vec![rect(-540.0, 0.0, 540.0, 10.0)])).unwrap();
        assert!(wide.geometry.0.iter().all(|p| p
            .exterior()
            .coords()
            .all(|c| (-180.0..=180.0).contains(&c.x))));
    }
}
