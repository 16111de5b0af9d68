//! GeoJSON vector collaborator: polygon and point features with their
//! attribute maps.

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::geo::{Bounds, CoordTransformer, Crs, EPSG_WGS84};

/// Polygon with one exterior ring and optional holes. Rings are closed or
/// open; the closing edge is implied.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<[f64; 2]>,
    pub holes: Vec<Vec<[f64; 2]>>,
}

impl Polygon {
    pub fn new(exterior: Vec<[f64; 2]>) -> Self {
        Self { exterior, holes: Vec::new() }
    }

    /// Axis-aligned rectangle, handy for AOIs and tests.
    pub fn rect(b: &Bounds) -> Self {
        Self::new(vec![
            [b.min_x, b.min_y],
            [b.max_x, b.min_y],
            [b.max_x, b.max_y],
            [b.min_x, b.max_y],
        ])
    }

    pub fn rings(&self) -> impl Iterator<Item = &Vec<[f64; 2]>> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(self.exterior.iter().map(|p| (p[0], p[1])))
    }

    /// Even-odd point-in-polygon over all rings.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let mut inside = false;
        for ring in self.rings() {
            let n = ring.len();
            for i in 0..n {
                let [xi, yi] = ring[i];
                let [xj, yj] = ring[(i + n - 1) % n];
                if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// One or more polygons (a Polygon is a MultiPolygon of one).
    Polygons(Vec<Polygon>),
    Point([f64; 2]),
}

impl Geometry {
    pub fn bounds(&self) -> Option<Bounds> {
        match self {
            Geometry::Polygons(polys) => polys
                .iter()
                .filter_map(Polygon::bounds)
                .reduce(|a, b| a.union(&b)),
            Geometry::Point([x, y]) => Some(Bounds::new(*x, *y, *x, *y)),
        }
    }

    fn map_coords(&self, f: &mut impl FnMut([f64; 2]) -> Result<[f64; 2]>) -> Result<Geometry> {
        let mut ring = |r: &Vec<[f64; 2]>| r.iter().map(|&p| f(p)).collect::<Result<Vec<_>>>();
        Ok(match self {
            Geometry::Polygons(polys) => {
                let mut out = Vec::with_capacity(polys.len());
                for p in polys {
                    let exterior = ring(&p.exterior)?;
                    let holes = p.holes.iter().map(&mut ring).collect::<Result<Vec<_>>>()?;
                    out.push(Polygon { exterior, holes });
                }
                Geometry::Polygons(out)
            }
            Geometry::Point(p) => Geometry::Point(f(*p)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
}

/// Ordered feature collection in one CRS. Order matters: later features
/// win when rasterized.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub features: Vec<Feature>,
    pub crs: Crs,
}

impl FeatureSet {
    pub fn bounds(&self) -> Option<Bounds> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.bounds())
            .reduce(|a, b| a.union(&b))
    }

    /// Keep features whose envelope meets `b`, in input order.
    pub fn clip_to_bounds(&self, b: &Bounds) -> FeatureSet {
        let features = self
            .features
            .iter()
            .filter(|f| f.geometry.bounds().is_some_and(|fb| fb.touches(b)))
            .cloned()
            .collect();
        FeatureSet { features, crs: self.crs }
    }

    pub fn reprojected(&self, crs: Crs) -> Result<FeatureSet> {
        let t = CoordTransformer::new(self.crs, crs)?;
        if t.is_identity() {
            return Ok(FeatureSet { features: self.features.clone(), crs });
        }
        let mut project = |p: [f64; 2]| t.transform(p[0], p[1]).map(|(x, y)| [x, y]);
        let features = self
            .features
            .iter()
            .map(|f| {
                Ok(Feature {
                    geometry: f.geometry.map_coords(&mut project)?,
                    properties: f.properties.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FeatureSet { features, crs })
    }
}

// ── GeoJSON parsing ──────────────────────────────────────────────────────────

pub fn read_features(path: &Path) -> Result<FeatureSet> {
    let text = fs::read_to_string(path)?;
    parse_feature_collection(&text)
}

/// Parse a GeoJSON FeatureCollection. CRS comes from the legacy `crs`
/// member and defaults to EPSG:4326. Unsupported geometry types are skipped.
pub fn parse_feature_collection(text: &str) -> Result<FeatureSet> {
    let root: Value = serde_json::from_str(text)?;
    let crs = match root.pointer("/crs/properties/name").and_then(Value::as_str) {
        Some(name) => name.parse()?,
        None => Crs::Epsg(EPSG_WGS84),
    };
    let items = root
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Vector("expected a FeatureCollection".into()))?;

    let mut features = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(geom) = item.get("geometry").filter(|g| !g.is_null()) else {
            debug!(feature = i, "skipping feature without geometry");
            continue;
        };
        let Some(geometry) = parse_geometry(geom)? else {
            debug!(feature = i, "skipping unsupported geometry type");
            continue;
        };
        let properties = item
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        features.push(Feature { geometry, properties });
    }
    Ok(FeatureSet { features, crs })
}

fn parse_geometry(g: &Value) -> Result<Option<Geometry>> {
    let kind = g.get("type").and_then(Value::as_str).unwrap_or_default();
    let coords = g.get("coordinates");
    let geometry = match (kind, coords) {
        ("Point", Some(c)) => Geometry::Point(parse_position(c)?),
        ("Polygon", Some(c)) => Geometry::Polygons(vec![parse_polygon(c)?]),
        ("MultiPolygon", Some(Value::Array(parts))) => {
            Geometry::Polygons(parts.iter().map(parse_polygon).collect::<Result<_>>()?)
        }
        _ => return Ok(None),
    };
    Ok(Some(geometry))
}

fn parse_polygon(v: &Value) -> Result<Polygon> {
    let rings = v
        .as_array()
        .ok_or_else(|| Error::Vector("polygon coordinates must be an array of rings".into()))?;
    let mut parsed = rings.iter().map(parse_ring);
    let exterior = parsed
        .next()
        .ok_or_else(|| Error::Vector("polygon without exterior ring".into()))??;
    let holes = parsed.collect::<Result<Vec<_>>>()?;
    Ok(Polygon { exterior, holes })
}

fn parse_ring(v: &Value) -> Result<Vec<[f64; 2]>> {
    v.as_array()
        .ok_or_else(|| Error::Vector("ring must be an array of positions".into()))?
        .iter()
        .map(parse_position)
        .collect()
}

fn parse_position(v: &Value) -> Result<[f64; 2]> {
    match v.as_array().map(Vec::as_slice) {
        Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok([x, y]),
            _ => Err(Error::Vector(format!("non-numeric position {v}"))),
        },
        _ => Err(Error::Vector(format!("bad position {v}"))),
    }
}
