//! Indexed polygon source files used as clipping layers.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header   magic "SKSF" | version u16 | flags u16 | feature_count u32 | bounds 4 x f64
//! index    feature_count x (bbox 4 x f64 | offset u64 | length u32)
//! records  feature_count x (id | properties JSON | geometry tag u8 | geometry)
//! ```
//!
//! The header and index are fixed-size so a reader can fetch them with two
//! byte-range requests and then pull only the records whose bbox it needs.
//! Offsets in the index are absolute file offsets.

use std::io::Write;

use foundation::Envelope;
use geo::{BoundingRect, Coord, Geometry, LineString, MultiPolygon, Polygon};
use serde_json::{Map, Value};

use crate::geojson::Feature;

const MAGIC: [u8; 4] = *b"SKSF";
const VERSION_V1: u16 = 1;

pub const HEADER_LEN: u64 = 4 + 2 + 2 + 4 + 32;
pub const INDEX_ENTRY_LEN: u64 = 32 + 8 + 4;

// Quantization scale: 1e7 => ~1.1cm at equator.
const DEG_Q: f64 = 10_000_000.0;

// Smallest encodings, used to bound counts read from untrusted bytes.
const COORD_LEN: usize = 8;
const MIN_RING_LEN: usize = 1;
const MIN_POLYGON_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceFormatError {
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("invalid source file magic")]
    InvalidMagic,
    #[error("unsupported source file version: {found}")]
    UnsupportedVersion { found: u16 },
    #[error("invalid varint")]
    InvalidVarint,
    #[error("invalid utf-8")]
    InvalidUtf8,
    #[error("invalid JSON")]
    InvalidJson,
    #[error("invalid geometry: {reason}")]
    InvalidGeometry { reason: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum GeomTag {
    Polygon = 1,
    MultiPolygon = 2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceHeader {
    pub version: u16,
    pub feature_count: u32,
    pub bounds: Envelope,
}

impl SourceHeader {
    pub fn index_len(&self) -> u64 {
        self.feature_count as u64 * INDEX_ENTRY_LEN
    }

    /// First byte after the index.
    pub fn records_offset(&self) -> u64 {
        HEADER_LEN + self.index_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    pub bbox: Envelope,
    pub offset: u64,
    pub length: u32,
}

impl IndexEntry {
    /// Exclusive end offset of the record. Saturates on corrupt offsets.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length as u64)
    }
}

pub fn encode_source(features: &[Feature]) -> Result<Vec<u8>, SourceFormatError> {
    let mut out: Vec<u8> = Vec::new();
    encode_source_to_writer(features, &mut out)?;
    Ok(out)
}

pub fn encode_source_to_writer<W: Write>(
    features: &[Feature],
    w: &mut W,
) -> Result<(), SourceFormatError> {
    let mut records: Vec<Vec<u8>> = Vec::with_capacity(features.len());
    let mut bboxes: Vec<Envelope> = Vec::with_capacity(features.len());
    for (i, feat) in features.iter().enumerate() {
        let polygons = polygonal(feat).ok_or_else(|| SourceFormatError::InvalidGeometry {
            reason: format!("feature {i} is not a polygon or multipolygon"),
        })?;
        let bbox = polygons
            .bounding_rect()
            .map(|r| Envelope::new(r.min().x, r.min().y, r.max().x, r.max().y))
            .ok_or_else(|| SourceFormatError::InvalidGeometry {
                reason: format!("feature {i} has an empty geometry"),
            })?;
        bboxes.push(bbox);
        records.push(encode_record(feat, &polygons)?);
    }

    let bounds = bboxes
        .iter()
        .copied()
        .reduce(|a, b| a.union(&b))
        .unwrap_or(Envelope::new(0.0, 0.0, 0.0, 0.0));

    w.write_all(&MAGIC).map_err(io_err)?;
    write_u16_le(w, VERSION_V1)?;
    // flags (reserved)
    write_u16_le(w, 0)?;
    write_u32_le(w, features.len() as u32)?;
    write_envelope(w, &bounds)?;

    let mut offset = HEADER_LEN + features.len() as u64 * INDEX_ENTRY_LEN;
    for (bbox, record) in bboxes.iter().zip(records.iter()) {
        write_envelope(w, bbox)?;
        write_u64_le(w, offset)?;
        write_u32_le(w, record.len() as u32)?;
        offset += record.len() as u64;
    }

    for record in &records {
        w.write_all(record).map_err(io_err)?;
    }
    Ok(())
}

pub fn decode_header(bytes: &[u8]) -> Result<SourceHeader, SourceFormatError> {
    let mut r = Reader::new(bytes);
    let magic = r.read_exact(4)?;
    if magic != MAGIC.as_slice() {
        return Err(SourceFormatError::InvalidMagic);
    }
    let version = r.read_u16()?;
    if version != VERSION_V1 {
        return Err(SourceFormatError::UnsupportedVersion { found: version });
    }
    let _flags = r.read_u16()?;
    let feature_count = r.read_u32()?;
    let bounds = r.read_envelope()?;
    Ok(SourceHeader {
        version,
        feature_count,
        bounds,
    })
}

pub fn decode_index(bytes: &[u8], feature_count: u32) -> Result<Vec<IndexEntry>, SourceFormatError> {
    let mut r = Reader::new(bytes);
    let fits = bytes.len() / INDEX_ENTRY_LEN as usize;
    let mut out = Vec::with_capacity((feature_count as usize).min(fits));
    for _ in 0..feature_count {
        let bbox = r.read_envelope()?;
        let offset = r.read_u64()?;
        let length = r.read_u32()?;
        out.push(IndexEntry {
            bbox,
            offset,
            length,
        });
    }
    Ok(out)
}

/// Decodes a whole file in memory. Range readers use the pieces instead.
pub fn decode_source(bytes: &[u8]) -> Result<Vec<Feature>, SourceFormatError> {
    let header = decode_header(bytes)?;
    let index_bytes = slice(bytes, HEADER_LEN, header.records_offset())?;
    let index = decode_index(index_bytes, header.feature_count)?;
    index
        .iter()
        .map(|e| decode_feature(slice(bytes, e.offset, e.end())?))
        .collect()
}

pub fn decode_feature(bytes: &[u8]) -> Result<Feature, SourceFormatError> {
    let mut r = Reader::new(bytes);

    let id_len = r.read_len(1)?;
    let id = if id_len == 0 {
        None
    } else {
        let b = r.read_exact(id_len)?;
        let s = std::str::from_utf8(b).map_err(|_| SourceFormatError::InvalidUtf8)?;
        Some(s.to_string())
    };

    let props_len = r.read_len(1)?;
    let props_bytes = r.read_exact(props_len)?;
    let props_val: Value =
        serde_json::from_slice(props_bytes).map_err(|_| SourceFormatError::InvalidJson)?;
    let properties = match props_val {
        Value::Object(m) => m,
        _ => Map::new(),
    };

    let tag = r.read_u8()?;
    let geometry = match tag {
        x if x == GeomTag::Polygon as u8 => Geometry::Polygon(read_polygon(&mut r)?),
        x if x == GeomTag::MultiPolygon as u8 => {
            let n = r.read_len(MIN_POLYGON_LEN)?;
            let mut polys = Vec::with_capacity(n);
            for _ in 0..n {
                polys.push(read_polygon(&mut r)?);
            }
            Geometry::MultiPolygon(MultiPolygon::new(polys))
        }
        _ => {
            return Err(SourceFormatError::InvalidGeometry {
                reason: format!("unknown geometry tag: {tag}"),
            });
        }
    };

    Ok(Feature {
        id,
        properties,
        geometry: Some(geometry),
    })
}

fn polygonal(feat: &Feature) -> Option<MultiPolygon<f64>> {
    match feat.geometry.as_ref()? {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        _ => None,
    }
}

fn encode_record(feat: &Feature, polygons: &MultiPolygon<f64>) -> Result<Vec<u8>, SourceFormatError> {
    let mut out: Vec<u8> = Vec::new();

    match &feat.id {
        Some(s) => {
            write_var_u64(&mut out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        None => write_var_u64(&mut out, 0),
    }

    let props_val = canonicalize_json_value(&Value::Object(feat.properties.clone()));
    let props_bytes = serde_json::to_vec(&props_val).map_err(|_| SourceFormatError::InvalidJson)?;
    write_var_u64(&mut out, props_bytes.len() as u64);
    out.extend_from_slice(&props_bytes);

    match feat.geometry {
        Some(Geometry::Polygon(ref p)) => {
            out.push(GeomTag::Polygon as u8);
            write_polygon(&mut out, p);
        }
        _ => {
            out.push(GeomTag::MultiPolygon as u8);
            write_var_u64(&mut out, polygons.0.len() as u64);
            for p in polygons {
                write_polygon(&mut out, p);
            }
        }
    }
    Ok(out)
}

fn write_polygon(out: &mut Vec<u8>, p: &Polygon<f64>) {
    write_var_u64(out, 1 + p.interiors().len() as u64);
    write_ring(out, p.exterior());
    for ring in p.interiors() {
        write_ring(out, ring);
    }
}

fn write_ring(out: &mut Vec<u8>, ring: &LineString<f64>) {
    write_var_u64(out, ring.0.len() as u64);
    for c in ring.coords() {
        out.extend_from_slice(&quantize_deg(c.x).to_le_bytes());
        out.extend_from_slice(&quantize_deg(c.y).to_le_bytes());
    }
}

fn read_polygon(r: &mut Reader<'_>) -> Result<Polygon<f64>, SourceFormatError> {
    let nrings = r.read_len(MIN_RING_LEN)?;
    if nrings == 0 {
        return Err(SourceFormatError::InvalidGeometry {
            reason: "polygon without rings".to_string(),
        });
    }
    let mut rings: Vec<LineString<f64>> = Vec::with_capacity(nrings);
    for _ in 0..nrings {
        let n = r.read_len(COORD_LEN)?;
        let mut ring = Vec::with_capacity(n);
        for _ in 0..n {
            let x = dequantize_deg(r.read_i32()?);
            let y = dequantize_deg(r.read_i32()?);
            ring.push(Coord { x, y });
        }
        rings.push(LineString::new(ring));
    }
    let exterior = rings.remove(0);
    Ok(Polygon::new(exterior, rings))
}

fn canonicalize_json_value(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                if let Some(v) = obj.get(k) {
                    out.insert(k.clone(), canonicalize_json_value(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json_value).collect()),
        other => other.clone(),
    }
}

/// `bytes[start..end]` for offsets read from the file.
fn slice(bytes: &[u8], start: u64, end: u64) -> Result<&[u8], SourceFormatError> {
    let start = usize::try_from(start).map_err(|_| SourceFormatError::UnexpectedEof)?;
    let end = usize::try_from(end).map_err(|_| SourceFormatError::UnexpectedEof)?;
    bytes.get(start..end).ok_or(SourceFormatError::UnexpectedEof)
}

fn io_err(e: std::io::Error) -> SourceFormatError {
    SourceFormatError::Io(e.to_string())
}

fn write_u16_le(w: &mut impl Write, v: u16) -> Result<(), SourceFormatError> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_u32_le(w: &mut impl Write, v: u32) -> Result<(), SourceFormatError> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_u64_le(w: &mut impl Write, v: u64) -> Result<(), SourceFormatError> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_envelope(w: &mut impl Write, e: &Envelope) -> Result<(), SourceFormatError> {
    for v in [e.min_x, e.min_y, e.max_x, e.max_y] {
        w.write_all(&v.to_le_bytes()).map_err(io_err)?;
    }
    Ok(())
}

fn quantize_deg(v: f64) -> i32 {
    let q = (v * DEG_Q).round();
    q.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

fn dequantize_deg(q: i32) -> f64 {
    (q as f64) / DEG_Q
}

fn write_var_u64(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push(((v as u8) & 0x7F) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], SourceFormatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(SourceFormatError::UnexpectedEof)?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// A count of items at least `min_item_len` bytes each. Counts the rest
    /// of the buffer cannot hold are rejected before anything is allocated.
    fn read_len(&mut self, min_item_len: usize) -> Result<usize, SourceFormatError> {
        let n = self.read_var_u64()?;
        let n = usize::try_from(n).map_err(|_| SourceFormatError::UnexpectedEof)?;
        if n > self.remaining() / min_item_len.max(1) {
            return Err(SourceFormatError::UnexpectedEof);
        }
        Ok(n)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], SourceFormatError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_exact(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8, SourceFormatError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16, SourceFormatError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, SourceFormatError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_i32(&mut self) -> Result<i32, SourceFormatError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, SourceFormatError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_f64(&mut self) -> Result<f64, SourceFormatError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    fn read_envelope(&mut self) -> Result<Envelope, SourceFormatError> {
        let min_x = self.read_f64()?;
        let min_y = self.read_f64()?;
        let max_x = self.read_f64()?;
        let max_y = self.read_f64()?;
        Ok(Envelope::new(min_x, min_y, max_x, max_y))
    }

    fn read_var_u64(&mut self) -> Result<u64, SourceFormatError> {
        let mut out: u64 = 0;
        let mut shift = 0;
        for _ in 0..10 {
            let b = self.read_u8()?;
            out |= ((b & 0x7F) as u64) << shift;
            if (b & 0x80) == 0 {
                return Ok(out);
            }
            shift += 7;
        }
        Err(SourceFormatError::InvalidVarint)
    }
}
