use geo::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde_json::{Map, Value};

/// A GeoJSON feature with its geometry lifted into `geo` types.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: Option<String>,
    pub properties: Map<String, Value>,
    /// `None` when the document carries `"geometry": null`.
    pub geometry: Option<Geometry<f64>>,
}

#[derive(Debug, thiserror::Error)]
pub enum GeoJsonError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected GeoJSON Feature or FeatureCollection")]
    NotAFeature,
    #[error("invalid feature at index {index}: {reason}")]
    InvalidFeature { index: usize, reason: String },
}

impl Feature {
    pub fn new(geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            id: None,
            properties: Map::new(),
            geometry: Some(geometry.into()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn from_geojson_str(payload: &str) -> Result<Self, GeoJsonError> {
        let value: Value = serde_json::from_str(payload)?;
        Self::from_geojson_value(&value)
    }

    pub fn from_geojson_value(value: &Value) -> Result<Self, GeoJsonError> {
        parse_feature(0, value)
    }

    pub fn to_geojson_value(&self) -> Value {
        let mut fobj = Map::new();
        fobj.insert("type".to_string(), Value::String("Feature".to_string()));
        if let Some(id) = &self.id {
            fobj.insert("id".to_string(), Value::String(id.clone()));
        }
        fobj.insert(
            "properties".to_string(),
            Value::Object(self.properties.clone()),
        );
        fobj.insert(
            "geometry".to_string(),
            self.geometry
                .as_ref()
                .map(geometry_to_geojson_value)
                .unwrap_or(Value::Null),
        );
        Value::Object(fobj)
    }
}

/// Parses either a FeatureCollection or a single Feature.
pub fn features_from_geojson_str(payload: &str) -> Result<Vec<Feature>, GeoJsonError> {
    let value: Value = serde_json::from_str(payload)?;
    features_from_geojson_value(&value)
}

pub fn features_from_geojson_value(value: &Value) -> Result<Vec<Feature>, GeoJsonError> {
    let obj = value.as_object().ok_or(GeoJsonError::NotAFeature)?;
    match obj.get("type").and_then(|v| v.as_str()) {
        Some("FeatureCollection") => {
            let features_val = obj
                .get("features")
                .and_then(|v| v.as_array())
                .ok_or(GeoJsonError::NotAFeature)?;
            features_val
                .iter()
                .enumerate()
                .map(|(index, f)| parse_feature(index, f))
                .collect()
        }
        Some("Feature") => Ok(vec![parse_feature(0, value)?]),
        _ => Err(GeoJsonError::NotAFeature),
    }
}

pub fn features_to_geojson_value(features: &[Feature]) -> Value {
    let mut root = Map::new();
    root.insert(
        "type".to_string(),
        Value::String("FeatureCollection".to_string()),
    );
    root.insert(
        "features".to_string(),
        Value::Array(features.iter().map(Feature::to_geojson_value).collect()),
    );
    Value::Object(root)
}

fn parse_feature(index: usize, value: &Value) -> Result<Feature, GeoJsonError> {
    let invalid = |reason: String| GeoJsonError::InvalidFeature { index, reason };

    let feat_obj = value
        .as_object()
        .ok_or_else(|| invalid("feature must be an object".to_string()))?;

    let feat_type = feat_obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid("feature missing type".to_string()))?;
    if feat_type != "Feature" {
        return Err(invalid(format!("unexpected feature type: {feat_type}")));
    }

    let id = match feat_obj.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    let properties = feat_obj
        .get("properties")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let geometry = match feat_obj.get("geometry") {
        None | Some(Value::Null) => None,
        Some(g) => Some(parse_geometry(g).map_err(invalid)?),
    };

    Ok(Feature {
        id,
        properties,
        geometry,
    })
}

pub fn parse_geometry(value: &Value) -> Result<Geometry<f64>, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "geometry must be an object".to_string())?;
    let ty = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "geometry missing type".to_string())?;

    if ty == "GeometryCollection" {
        let members = obj
            .get("geometries")
            .and_then(|v| v.as_array())
            .ok_or_else(|| "GeometryCollection missing geometries".to_string())?;
        let parsed: Result<Vec<Geometry<f64>>, String> =
            members.iter().map(parse_geometry).collect();
        return Ok(Geometry::GeometryCollection(GeometryCollection::new_from(
            parsed?,
        )));
    }

    let coords = obj
        .get("coordinates")
        .ok_or_else(|| format!("{ty} missing coordinates"))?;

    match ty {
        "Point" => Ok(Geometry::Point(Point::from(parse_position(coords)?))),
        "MultiPoint" => Ok(Geometry::MultiPoint(MultiPoint::new(
            parse_positions(coords)?
                .into_iter()
                .map(Point::from)
                .collect(),
        ))),
        "LineString" => Ok(Geometry::LineString(LineString::new(parse_positions(
            coords,
        )?))),
        "MultiLineString" => {
            let lines = as_array(coords)?
                .iter()
                .map(|l| parse_positions(l).map(LineString::new))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::MultiLineString(MultiLineString::new(lines)))
        }
        "Polygon" => Ok(Geometry::Polygon(parse_polygon(coords)?)),
        "MultiPolygon" => {
            let polys = as_array(coords)?
                .iter()
                .map(parse_polygon)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::MultiPolygon(MultiPolygon::new(polys)))
        }
        other => Err(format!("unsupported geometry type: {other}")),
    }
}

fn as_array(value: &Value) -> Result<&Vec<Value>, String> {
    value
        .as_array()
        .ok_or_else(|| "coordinates must be an array".to_string())
}

fn parse_position(value: &Value) -> Result<Coord<f64>, String> {
    let arr = value
        .as_array()
        .ok_or_else(|| "position must be an array".to_string())?;
    if arr.len() < 2 {
        return Err("position must have at least two elements".to_string());
    }
    let x = arr[0]
        .as_f64()
        .ok_or_else(|| "position x must be a number".to_string())?;
    let y = arr[1]
        .as_f64()
        .ok_or_else(|| "position y must be a number".to_string())?;
    Ok(Coord { x, y })
}

fn parse_positions(value: &Value) -> Result<Vec<Coord<f64>>, String> {
    as_array(value)?.iter().map(parse_position).collect()
}

fn parse_polygon(value: &Value) -> Result<Polygon<f64>, String> {
    let mut rings = as_array(value)?
        .iter()
        .map(|r| parse_positions(r).map(LineString::new));
    let exterior = match rings.next() {
        Some(r) => r?,
        None => LineString::new(Vec::new()),
    };
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

pub fn geometry_to_geojson_value(geom: &Geometry<f64>) -> Value {
    fn position(c: &Coord<f64>) -> Value {
        Value::Array(vec![Value::from(c.x), Value::from(c.y)])
    }
    fn line(ls: &LineString<f64>) -> Value {
        Value::Array(ls.coords().map(position).collect())
    }
    fn polygon(p: &Polygon<f64>) -> Value {
        let mut rings = vec![line(p.exterior())];
        rings.extend(p.interiors().iter().map(line));
        Value::Array(rings)
    }
    fn typed(ty: &str, key: &str, value: Value) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String(ty.to_string()));
        obj.insert(key.to_string(), value);
        Value::Object(obj)
    }

    match geom {
        Geometry::Point(p) => typed("Point", "coordinates", position(&p.0)),
        Geometry::Line(l) => typed(
            "LineString",
            "coordinates",
            Value::Array(vec![position(&l.start), position(&l.end)]),
        ),
        Geometry::LineString(ls) => typed("LineString", "coordinates", line(ls)),
        Geometry::Polygon(p) => typed("Polygon", "coordinates", polygon(p)),
        Geometry::MultiPoint(mp) => typed(
            "MultiPoint",
            "coordinates",
            Value::Array(mp.iter().map(|p| position(&p.0)).collect()),
        ),
        Geometry::MultiLineString(ml) => typed(
            "MultiLineString",
            "coordinates",
            Value::Array(ml.iter().map(line).collect()),
        ),
        Geometry::MultiPolygon(mp) => typed(
            "MultiPolygon",
            "coordinates",
            Value::Array(mp.iter().map(polygon).collect()),
        ),
        Geometry::GeometryCollection(gc) => typed(
            "GeometryCollection",
            "geometries",
            Value::Array(gc.iter().map(geometry_to_geojson_value).collect()),
        ),
        Geometry::Rect(r) => typed("Polygon", "coordinates", polygon(&r.to_polygon())),
        Geometry::Triangle(t) => typed("Polygon", "coordinates", polygon(&t.to_polygon())),
    }
}
