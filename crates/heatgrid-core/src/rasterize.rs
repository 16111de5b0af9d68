//! Vector-to-raster burning of a numeric feature attribute.
//!
//! Coverage rule: a cell takes a polygon's value when the polygon touches
//! the cell's interior at all (its centre is inside, or a ring edge crosses
//! it). Features are painted in input order, so on overlap the last feature
//! wins. With an AOI the output extent is the AOI envelope and features are
//! cropped to it before anything is burned.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::DEFAULT_RESOLUTION;
use crate::error::{Error, Result};
use crate::geo::{Bounds, CoordTransformer, Crs, GeoTransform};
use crate::grid::Grid;
use crate::io::vector::{Feature, FeatureSet, Geometry, Polygon};

/// Recognised height attribute names, matched case-insensitively in this order.
pub const HEIGHT_ATTRIBUTES: [&str; 6] = ["height", "building_height", "bldg_height", "height_m", "hgt", "hoogte"];

/// Uncovered ground has zero building height.
pub const DEFAULT_BURN_NODATA: f32 = 0.0;

/// Shrinks cell rectangles so edges lying exactly on a cell boundary do not
/// touch the neighbouring cell.
const EDGE_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterizeParams {
    pub resolution: f64,
    pub nodata: f32,
    /// Candidate attribute names; the first one present is burned.
    pub attributes: Vec<String>,
}

impl Default for RasterizeParams {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            nodata: DEFAULT_BURN_NODATA,
            attributes: HEIGHT_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Area of interest: restricts extent, never changes the CRS of the data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aoi {
    pub bounds: Bounds,
    pub crs: Crs,
}

impl Aoi {
    pub fn new(bounds: Bounds, crs: Crs) -> Self {
        Self { bounds, crs }
    }

    /// Envelope of an AOI feature set (polygon or bounding box).
    pub fn from_features(fs: &FeatureSet) -> Result<Self> {
        let bounds = fs.bounds().ok_or_else(|| Error::Vector("AOI has no geometry".into()))?;
        Ok(Self { bounds, crs: fs.crs })
    }
}

/// First candidate present on any feature, returned with the feature's own
/// spelling.
pub fn resolve_attribute(fs: &FeatureSet, candidates: &[String]) -> Result<String> {
    for want in candidates {
        for f in &fs.features {
            if let Some(key) = f.properties.keys().find(|k| k.eq_ignore_ascii_case(want)) {
                return Ok(key.clone());
            }
        }
    }
    Err(Error::MissingAttribute { candidates: candidates.to_vec() })
}

fn feature_value(f: &Feature, key: &str) -> Option<f32> {
    let v = match f.properties.get(key)? {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    };
    v.filter(|v| v.is_finite())
}

/// Burn the resolved height attribute of `features` onto a new grid.
pub fn rasterize(features: &FeatureSet, aoi: Option<&Aoi>, params: &RasterizeParams) -> Result<Grid> {
    if !(params.resolution > 0.0) {
        return Err(Error::InvalidParameter(format!("resolution must be > 0, got {}", params.resolution)));
    }
    let key = resolve_attribute(features, &params.attributes)?;

    let (features, extent) = match aoi {
        Some(aoi) => {
            let projected = features.reprojected(aoi.crs)?;
            let cropped = projected.clip_to_bounds(&aoi.bounds);
            debug!(kept = cropped.features.len(), total = projected.features.len(), "cropped features to AOI");
            (cropped, aoi.bounds)
        }
        None => {
            let extent = features
                .bounds()
                .ok_or_else(|| Error::NoOverlap { subject: "empty feature set".into() })?;
            (features.clone(), extent)
        }
    };
    if features.features.is_empty() {
        return Err(Error::NoOverlap { subject: "vector features".into() });
    }

    let width = (extent.width() / params.resolution + EDGE_EPS).floor() as usize;
    let height = (extent.height() / params.resolution + EDGE_EPS).floor() as usize;
    if width == 0 || height == 0 {
        return Err(Error::InvalidParameter(format!(
            "extent {extent:?} is smaller than one {}-unit cell",
            params.resolution
        )));
    }
    let transform = GeoTransform::north_up(extent.min_x, extent.max_y, params.resolution);
    let mut grid = Grid::empty(width, height, transform, features.crs, params.nodata);

    let mut burned = 0usize;
    for (i, f) in features.features.iter().enumerate() {
        let Some(value) = feature_value(f, &key) else {
            debug!(feature = i, attribute = %key, "no numeric value, skipped");
            continue;
        };
        match &f.geometry {
            Geometry::Polygons(polys) => {
                for p in polys {
                    burn_polygon(&mut grid, p, value);
                }
            }
            Geometry::Point([x, y]) => {
                if let Some((r, c)) = grid.locate(*x, *y) {
                    grid.set(r, c, value);
                }
            }
        }
        burned += 1;
    }
    info!(features = burned, attribute = %key, width, height, "rasterized");
    Ok(grid)
}

/// Paint every cell the polygon touches. North-up grids only.
fn burn_polygon(grid: &mut Grid, poly: &Polygon, value: f32) {
    let gt = grid.transform;
    let res_x = gt.pixel_width;
    let res_y = -gt.pixel_height;
    let (w, h) = (grid.width, grid.height);

    // Centres inside the polygon: even-odd scanline over every ring.
    let mut xs: Vec<f64> = Vec::new();
    for row in 0..h {
        let y = gt.origin_y - (row as f64 + 0.5) * res_y;
        xs.clear();
        for ring in poly.rings() {
            let n = ring.len();
            for i in 0..n {
                let [ax, ay] = ring[i];
                let [bx, by] = ring[(i + 1) % n];
                if (ay > y) != (by > y) {
                    xs.push(ax + (y - ay) * (bx - ax) / (by - ay));
                }
            }
        }
        xs.sort_by(f64::total_cmp);
        for pair in xs.chunks_exact(2) {
            let c0 = ((pair[0] - gt.origin_x) / res_x - 0.5).ceil().clamp(0.0, w as f64) as usize;
            let c1 = ((pair[1] - gt.origin_x) / res_x - 0.5).ceil().clamp(0.0, w as f64) as usize;
            for col in c0..c1 {
                grid.set(row, col, value);
            }
        }
    }

    // Cells crossed by an edge.
    for ring in poly.rings() {
        let n = ring.len();
        for i in 0..n {
            let a = ring[i];
            let b = ring[(i + 1) % n];
            let to_px = |p: [f64; 2]| ((p[0] - gt.origin_x) / res_x, (gt.origin_y - p[1]) / res_y);
            let (ac, ar) = to_px(a);
            let (bc, br) = to_px(b);
            let col_lo = ac.min(bc).floor().max(0.0) as usize;
            let row_lo = ar.min(br).floor().max(0.0) as usize;
            let col_hi = (ac.max(bc).floor() + 1.0).clamp(0.0, w as f64) as usize;
            let row_hi = (ar.max(br).floor() + 1.0).clamp(0.0, h as f64) as usize;
            for row in row_lo..row_hi {
                for col in col_lo..col_hi {
                    let cell = (
                        col as f64 + EDGE_EPS,
                        row as f64 + EDGE_EPS,
                        col as f64 + 1.0 - EDGE_EPS,
                        row as f64 + 1.0 - EDGE_EPS,
                    );
                    if segment_hits_rect((ac, ar), (bc, br), cell) {
                        grid.set(row, col, value);
                    }
                }
            }
        }
    }
}

/// Liang–Barsky test of segment p→q against rectangle (x0, y0, x1, y1).
fn segment_hits_rect(p: (f64, f64), q: (f64, f64), (x0, y0, x1, y1): (f64, f64, f64, f64)) -> bool {
    let (dx, dy) = (q.0 - p.0, q.1 - p.1);
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (pk, qk) in [(-dx, p.0 - x0), (dx, x1 - p.0), (-dy, p.1 - y0), (dy, y1 - p.1)] {
        if pk == 0.0 {
            if qk < 0.0 {
                return false;
            }
        } else {
            let t = qk / pk;
            if pk < 0.0 {
                t0 = t0.max(t);
            } else {
                t1 = t1.min(t);
            }
            if t0 > t1 {
                return false;
            }
        }
    }
    true
}

/// Express `aoi` in `crs` (envelope of the transformed extent).
pub fn aoi_in_crs(aoi: &Aoi, crs: Crs) -> Result<Aoi> {
    let bounds = CoordTransformer::new(aoi.crs, crs)?.transform_bounds(&aoi.bounds)?;
    Ok(Aoi { bounds, crs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn square(x0: f64, y0: f64, size: f64, height: f64, key: &str) -> Feature {
        let mut properties = Map::new();
        properties.insert(key.to_string(), json!(height));
        Feature {
            geometry: Geometry::Polygons(vec![Polygon::rect(&Bounds::new(x0, y0, x0 + size, y0 + size))]),
            properties,
        }
    }

    fn set(features: Vec<Feature>) -> FeatureSet {
        FeatureSet { features, crs: Crs::Epsg(28992) }
    }

    #[test]
    fn centres_inside_take_polygon_value_and_rest_is_nodata() {
        let fs = set(vec![square(1.0, 1.0, 3.0, 12.0, "height"), square(6.0, 5.0, 2.0, 20.0, "height")]);
        let aoi = Aoi::new(Bounds::new(0.0, 0.0, 10.0, 10.0), Crs::Epsg(28992));
        let g = rasterize(&fs, Some(&aoi), &RasterizeParams::default()).unwrap();
        assert_eq!((g.width, g.height), (10, 10));
        for row in 0..10 {
            for col in 0..10 {
                let (x, y) = g.cell_center(row, col);
                let expected = if (1.0..4.0).contains(&x) && (1.0..4.0).contains(&y) {
                    Some(12.0)
                } else if (6.0..8.0).contains(&x) && (5.0..7.0).contains(&y) {
                    Some(20.0)
                } else {
                    None
                };
                assert_eq!(g.value(row, col), expected, "cell ({row}, {col})");
            }
        }
    }

    #[test]
    fn overlap_is_last_writer_wins() {
        let fs = set(vec![square(0.0, 0.0, 4.0, 5.0, "height"), square(2.0, 2.0, 4.0, 9.0, "height")]);
        let g = rasterize(&fs, None, &RasterizeParams::default()).unwrap();
        // Extent (0,0)-(6,6); cell centred at (2.5, 2.5) is under both.
        let (r, c) = g.locate(2.5, 2.5).unwrap();
        assert_eq!(g.get(r, c), 9.0);
        let (r, c) = g.locate(0.5, 0.5).unwrap();
        assert_eq!(g.get(r, c), 5.0);
    }

    #[test]
    fn sliver_touching_a_cell_is_burned() {
        let mut f = square(0.0, 0.0, 1.0, 3.0, "height");
        f.geometry = Geometry::Polygons(vec![Polygon::new(vec![[2.1, 2.1], [2.3, 2.1], [2.2, 2.3]])]);
        let fs = set(vec![f]);
        let aoi = Aoi::new(Bounds::new(0.0, 0.0, 4.0, 4.0), Crs::Epsg(28992));
        let g = rasterize(&fs, Some(&aoi), &RasterizeParams::default()).unwrap();
        assert_eq!(g.valid_count(), 1);
        let (r, c) = g.locate(2.2, 2.2).unwrap();
        assert_eq!(g.get(r, c), 3.0);
    }

    #[test]
    fn grid_aligned_square_does_not_spill() {
        let fs = set(vec![square(2.0, 2.0, 4.0, 7.0, "height")]);
        let aoi = Aoi::new(Bounds::new(0.0, 0.0, 8.0, 8.0), Crs::Epsg(28992));
        let g = rasterize(&fs, Some(&aoi), &RasterizeParams::default()).unwrap();
        assert_eq!(g.valid_count(), 16);
    }

    #[test]
    fn cells_inside_a_hole_stay_nodata() {
        let mut f = square(0.0, 0.0, 6.0, 4.0, "height");
        if let Geometry::Polygons(p) = &mut f.geometry {
            p[0].holes.push(vec![[1.0, 1.0], [5.0, 1.0], [5.0, 5.0], [1.0, 5.0]]);
        }
        let g = rasterize(&set(vec![f]), None, &RasterizeParams::default()).unwrap();
        let (r, c) = g.locate(3.0, 3.0).unwrap();
        assert!(!g.is_valid(r, c));
        assert_eq!(g.valid_count(), 36 - 16);
    }

    #[test]
    fn attribute_synonyms_match_case_insensitively() {
        let fs = set(vec![square(0.0, 0.0, 2.0, 11.0, "BUILDING_HEIGHT")]);
        assert_eq!(resolve_attribute(&fs, &RasterizeParams::default().attributes).unwrap(), "BUILDING_HEIGHT");
        let g = rasterize(&fs, None, &RasterizeParams::default()).unwrap();
        assert!(g.data.iter().all(|&v| v == 11.0));
    }

    #[test]
    fn missing_attribute_is_reported() {
        let fs = set(vec![square(0.0, 0.0, 2.0, 11.0, "floors")]);
        let err = rasterize(&fs, None, &RasterizeParams::default()).unwrap_err();
        assert!(matches!(err, Error::MissingAttribute { ref candidates } if candidates.len() == HEIGHT_ATTRIBUTES.len()));
    }

    #[test]
    fn aoi_crops_before_burning() {
        let fs = set(vec![square(100.0, 100.0, 5.0, 8.0, "height"), square(1.0, 1.0, 2.0, 4.0, "height")]);
        let aoi = Aoi::new(Bounds::new(0.0, 0.0, 5.0, 5.0), Crs::Epsg(28992));
        let g = rasterize(&fs, Some(&aoi), &RasterizeParams::default()).unwrap();
        assert_eq!(g.bounds(), aoi.bounds);
        assert_eq!(g.valid_count(), 4);

        let far = Aoi::new(Bounds::new(500.0, 500.0, 510.0, 510.0), Crs::Epsg(28992));
        assert!(matches!(rasterize(&fs, Some(&far), &RasterizeParams::default()), Err(Error::NoOverlap { .. })));
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let mut f = square(0.0, 0.0, 1.0, 0.0, "height");
        f.properties.insert("height".into(), json!(" 6.5 "));
        assert_eq!(feature_value(&f, "height"), Some(6.5));
        f.properties.insert("height".into(), json!(null));
        assert_eq!(feature_value(&f, "height"), None);
    }

    #[test]
    fn geographic_features_burn_onto_projected_aoi() {
        let lonlat = FeatureSet {
            features: vec![square(4.89, 52.37, 0.001, 15.0, "height")],
            crs: Crs::Epsg(4326),
        };
        let projected = lonlat.reprojected(Crs::Epsg(32631)).unwrap();
        let b = projected.bounds().unwrap();
        let aoi = Aoi::new(Bounds::new(b.min_x - 10.0, b.min_y - 10.0, b.max_x + 10.0, b.max_y + 10.0), Crs::Epsg(32631));
        let g = rasterize(&lonlat, Some(&aoi), &RasterizeParams::default()).unwrap();
        assert_eq!(g.crs, Crs::Epsg(32631));
        assert!(g.valid_count() > 50, "about 70 m x 110 m footprint, got {}", g.valid_count());
    }

    #[test]
    fn segment_rect_hits_and_misses() {
        let cell = (0.0, 0.0, 1.0, 1.0);
        assert!(segment_hits_rect((-1.0, 0.5), (2.0, 0.5), cell));
        assert!(segment_hits_rect((0.2, 0.2), (0.3, 0.3), cell));
        assert!(!segment_hits_rect((-1.0, 2.0), (2.0, 1.5), cell));
    }
}
