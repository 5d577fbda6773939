use std::collections::{BTreeMap, BTreeSet};

use foundation::{FolderId, GeographyId, SketchClassId, SketchId, UserId};
use geo::{MultiPolygon, Polygon};
use overlay::{FragmentHash, SketchFragment, SketchRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a table-of-contents item lives. Folders nest inside folders and
/// collections; collections nest inside folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum Parent {
    Root,
    Folder(FolderId),
    Collection(SketchId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum TocItem {
    Sketch(SketchId),
    Folder(FolderId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SketchClassKind {
    Polygon,
    Collection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchClass {
    pub id: SketchClassId,
    pub name: String,
    pub kind: SketchClassKind,
    /// Geographies sketches of this class are clipped to and fragmented by.
    #[serde(default)]
    pub clipping_geographies: Vec<GeographyId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sketch {
    pub id: SketchId,
    pub name: String,
    pub sketch_class_id: SketchClassId,
    pub user_id: UserId,
    pub parent: Parent,
    /// Geometry as drawn. `None` for collections.
    pub user_geom: Option<MultiPolygon<f64>>,
    /// `user_geom` clipped to the class geographies.
    pub geom: Option<MultiPolygon<f64>>,
    pub properties: Map<String, Value>,
}

impl Sketch {
    /// Direct parent collection, if any. The effective collection may be
    /// further up, through folders.
    pub fn collection_id(&self) -> Option<SketchId> {
        match self.parent {
            Parent::Collection(id) => Some(id),
            _ => None,
        }
    }

    pub fn folder_id(&self) -> Option<FolderId> {
        match self.parent {
            Parent::Folder(id) => Some(id),
            _ => None,
        }
    }
}

/// Row values for a sketch that has no id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSketch {
    pub name: String,
    pub sketch_class_id: SketchClassId,
    pub user_id: UserId,
    pub parent: Parent,
    pub user_geom: Option<MultiPolygon<f64>>,
    pub geom: Option<MultiPolygon<f64>>,
    pub properties: Map<String, Value>,
}

impl NewSketch {
    pub fn into_sketch(self, id: SketchId) -> Sketch {
        Sketch {
            id,
            name: self.name,
            sketch_class_id: self.sketch_class_id,
            user_id: self.user_id,
            parent: self.parent,
            user_geom: self.user_geom,
            geom: self.geom,
            properties: self.properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub user_id: UserId,
    pub parent: Parent,
}

/// A persisted fragment. Which sketches it belongs to lives in the store's
/// association table, not on the record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFragment {
    pub hash: FragmentHash,
    pub geometry: Polygon<f64>,
    pub geography_ids: BTreeSet<GeographyId>,
}

impl StoredFragment {
    pub fn from_fragment(fragment: &SketchFragment) -> Self {
        StoredFragment {
            hash: fragment.hash(),
            geometry: fragment.geometry.clone(),
            geography_ids: fragment.geography_ids.clone(),
        }
    }

    pub fn to_fragment(&self, sketch_ids: impl IntoIterator<Item = SketchId>) -> SketchFragment {
        SketchFragment::new(
            self.geometry.clone(),
            self.geography_ids.iter().copied(),
            sketch_ids.into_iter().map(SketchRef::Known),
        )
    }
}

/// Outcome of the recursive copy procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub root: TocItem,
    pub sketch_ids: Vec<SketchId>,
    pub folder_ids: Vec<FolderId>,
    /// Effective collection of the new root item.
    pub parent_collection_id: Option<SketchId>,
    /// New sketch id to the sketch it was copied from.
    pub copied_from: BTreeMap<SketchId, SketchId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedItems {
    pub sketch_ids: Vec<SketchId>,
    pub folder_ids: Vec<FolderId>,
}

/// A sketch whose effective collection changed during a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionChange {
    pub sketch_id: SketchId,
    pub removed_from: Option<SketchId>,
    pub added_to: Option<SketchId>,
}
