//! Content addressing for fragments.
//!
//! Two fragments with the same footprint and the same geographies hash the
//! same no matter how their rings were wound, where each ring starts, in
//! which order holes were listed, or how the geography ids were ordered.

use std::collections::BTreeSet;
use std::fmt;

use foundation::GeographyId;
use geo::orient::{Direction, Orient};
use geo::{LineString, Polygon};
use serde::{Deserialize, Serialize};

/// Coordinates are compared at 1e-7 degrees (about 1cm).
const QUANTIZE: f64 = 1e7;
const DOMAIN_TAG: &[u8] = b"sketchfrag:fragment:v1";

/// blake3 digest, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentHash(String);

impl FragmentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FragmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Ring = Vec<(i64, i64)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPolygon {
    pub exterior: Ring,
    pub interiors: Vec<Ring>,
}

pub fn canonical_polygon(polygon: &Polygon<f64>) -> CanonicalPolygon {
    let oriented = polygon.orient(Direction::Default);
    let mut interiors: Vec<Ring> = oriented
        .interiors()
        .iter()
        .map(canonical_ring)
        .filter(|r| !r.is_empty())
        .collect();
    interiors.sort();
    CanonicalPolygon {
        exterior: canonical_ring(oriented.exterior()),
        interiors,
    }
}

fn canonical_ring(ring: &LineString<f64>) -> Ring {
    let mut out: Ring = Vec::with_capacity(ring.0.len());
    for c in ring.coords() {
        let q = (
            (c.x * QUANTIZE).round() as i64,
            (c.y * QUANTIZE).round() as i64,
        );
        if out.last() != Some(&q) {
            out.push(q);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    if let Some(start) = out
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| **c)
        .map(|(i, _)| i)
    {
        out.rotate_left(start);
    }
    out
}

pub fn fragment_hash(polygon: &Polygon<f64>, geography_ids: &BTreeSet<GeographyId>) -> FragmentHash {
    let canonical = canonical_polygon(polygon);
    let mut hasher = blake3::Hasher::new();
    hasher.update(DOMAIN_TAG);

    let rings = std::iter::once(&canonical.exterior).chain(canonical.interiors.iter());
    hasher.update(&(1 + canonical.interiors.len() as u32).to_le_bytes());
    for ring in rings {
        hasher.update(&(ring.len() as u32).to_le_bytes());
        for (x, y) in ring {
            hasher.update(&x.to_le_bytes());
            hasher.update(&y.to_le_bytes());
        }
    }

    hasher.update(&(geography_ids.len() as u32).to_le_bytes());
    for id in geography_ids {
        hasher.update(&id.get().to_le_bytes());
    }
    FragmentHash(hasher.finalize().to_hex().to_string())
}
