//! Georeferencing primitives: extents, affine transforms, coordinate
//! reference systems and point/extent transforms between them.
//! All coordinate math uses f64.

use std::fmt;
use std::str::FromStr;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const EPSG_WGS84: u32 = 4326;
pub const EPSG_WEB_MERCATOR: u32 = 3857;
pub const EPSG_RD_NEW: u32 = 28992;

/// Samples per edge when transforming an extent between CRSs.
const BOUNDS_EDGE_SAMPLES: usize = 8;

// ── Bounds ───────────────────────────────────────────────────────────────────

/// Axis-aligned extent in map units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Envelope of a set of points; `None` for an empty set.
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let mut b = Self::new(x0, y0, x0, y0);
        for (x, y) in iter {
            b.expand_to(x, y);
        }
        Some(b)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn expand_to(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Common extent with positive area, if any.
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let b = Bounds::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        (b.width() > 0.0 && b.height() > 0.0).then_some(b)
    }

    /// Envelope test that also accepts shared edges.
    pub fn touches(&self, other: &Bounds) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Move every edge inward by `d` map units.
    pub fn shrink(&self, d: f64) -> Bounds {
        Bounds::new(self.min_x + d, self.min_y + d, self.max_x - d, self.max_y - d)
    }
}

// ── Affine transform ─────────────────────────────────────────────────────────

/// Pixel-to-map affine transform in GDAL coefficient order:
///   x = origin_x + col * pixel_width  + row * row_rotation
///   y = origin_y + col * col_rotation + row * pixel_height
/// Pixel (0, 0) is the upper-left corner of the upper-left cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    /// Negative for north-up grids.
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square cells of `resolution` map units.
    pub fn north_up(origin_x: f64, origin_y: f64, resolution: f64) -> Self {
        Self {
            origin_x,
            pixel_width: resolution,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -resolution,
        }
    }

    pub fn from_gdal(c: [f64; 6]) -> Self {
        Self {
            origin_x: c[0],
            pixel_width: c[1],
            row_rotation: c[2],
            origin_y: c[3],
            col_rotation: c[4],
            pixel_height: c[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            self.row_rotation,
            self.origin_y,
            self.col_rotation,
            self.pixel_height,
        ]
    }

    pub fn is_north_up(&self) -> bool {
        self.row_rotation == 0.0 && self.col_rotation == 0.0
    }

    /// Cell size along x and y, always positive.
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.pixel_width.hypot(self.col_rotation),
            self.row_rotation.hypot(self.pixel_height),
        )
    }

    /// Map coordinate of a fractional pixel position.
    #[inline]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Fractional pixel position (col, row) of a map coordinate.
    /// `None` if the transform is degenerate.
    #[inline]
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation;
        if det == 0.0 {
            return None;
        }
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        let col = (dx * self.pixel_height - dy * self.row_rotation) / det;
        let row = (dy * self.pixel_width - dx * self.col_rotation) / det;
        Some((col, row))
    }

    /// Envelope of a `width` x `height` pixel block's four corners.
    pub fn extent(&self, width: usize, height: usize) -> Bounds {
        let (w, h) = (width as f64, height as f64);
        let mut b = Bounds::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (c, r) in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)] {
            let (x, y) = self.apply(c, r);
            b.expand_to(x, y);
        }
        b
    }

    /// Transform of the window starting at (col_off, row_off).
    pub fn shifted(&self, col_off: f64, row_off: f64) -> Self {
        let (ox, oy) = self.apply(col_off, row_off);
        Self { origin_x: ox, origin_y: oy, ..*self }
    }

    /// Same transform with cells scaled by `factor` (aggregation).
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            pixel_width: self.pixel_width * factor,
            row_rotation: self.row_rotation * factor,
            col_rotation: self.col_rotation * factor,
            pixel_height: self.pixel_height * factor,
            ..*self
        }
    }

    pub fn approx_eq(&self, other: &GeoTransform, tol: f64) -> bool {
        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }
}

// ── Coordinate reference systems ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    Epsg(u32),
    Unknown,
}

impl Crs {
    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Epsg(EPSG_WGS84))
    }

    pub fn epsg(&self) -> Option<u32> {
        match self {
            Crs::Epsg(code) => Some(*code),
            Crs::Unknown => None,
        }
    }

    /// PROJ.4 definition for the supported EPSG codes.
    pub fn proj_string(&self) -> Result<String> {
        let code = match self {
            Crs::Epsg(code) => *code,
            Crs::Unknown => return Err(Error::UnsupportedCrs("unknown".into())),
        };
        let s = match code {
            EPSG_WGS84 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
            EPSG_WEB_MERCATOR => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 \
                                  +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                .to_string(),
            EPSG_RD_NEW => "+proj=sterea +lat_0=52.15616055555555 +lon_0=5.38763888888889 \
                            +k=0.9999079 +x_0=155000 +y_0=463000 +ellps=bessel \
                            +towgs84=565.417,50.3319,465.552,-0.398957,0.343988,-1.8774,4.0725 \
                            +units=m +no_defs"
                .to_string(),
            32601..=32660 => format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", code - 32600),
            32701..=32760 => {
                format!("+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs", code - 32700)
            }
            other => return Err(Error::UnsupportedCrs(format!("EPSG:{other}"))),
        };
        Ok(s)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(code) => write!(f, "EPSG:{code}"),
            Crs::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Crs {
    type Err = Error;

    /// Accepts `EPSG:28992`, `epsg:28992`, `28992` and OGC URNs such as
    /// `urn:ogc:def:crs:EPSG::28992`. `OGC:CRS84` maps to EPSG:4326.
    fn from_str(s: &str) -> Result<Self> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("urn:ogc:def:crs:OGC:1.3:CRS84") || t.eq_ignore_ascii_case("OGC:CRS84") {
            return Ok(Crs::Epsg(EPSG_WGS84));
        }
        let digits = t.rsplit(':').next().unwrap_or(t);
        digits
            .parse::<u32>()
            .map(Crs::Epsg)
            .map_err(|_| Error::UnsupportedCrs(s.to_string()))
    }
}

// ── Transforms ───────────────────────────────────────────────────────────────

/// Reusable point transformer between two CRSs.
/// Geographic coordinates are degrees on both ends.
pub struct CoordTransformer {
    projs: Option<(Proj, Proj)>,
    src_geographic: bool,
    dst_geographic: bool,
}

impl CoordTransformer {
    pub fn new(src: Crs, dst: Crs) -> Result<Self> {
        if src == dst {
            return Ok(Self { projs: None, src_geographic: false, dst_geographic: false });
        }
        let src_proj = Proj::from_proj_string(&src.proj_string()?)
            .map_err(|e| Error::Projection(format!("{src}: {e:?}")))?;
        let dst_proj = Proj::from_proj_string(&dst.proj_string()?)
            .map_err(|e| Error::Projection(format!("{dst}: {e:?}")))?;
        Ok(Self {
            projs: Some((src_proj, dst_proj)),
            src_geographic: src.is_geographic(),
            dst_geographic: dst.is_geographic(),
        })
    }

    pub fn is_identity(&self) -> bool {
        self.projs.is_none()
    }

    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let Some((src, dst)) = &self.projs else {
            return Ok((x, y));
        };
        let mut p = if self.src_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(src, dst, &mut p).map_err(|e| Error::Projection(format!("({x}, {y}): {e:?}")))?;
        if self.dst_geographic {
            Ok((p.0.to_degrees(), p.1.to_degrees()))
        } else {
            Ok((p.0, p.1))
        }
    }

    /// Envelope of `b` after transformation, densified along each edge so
    /// curved edges are not under-covered.
    pub fn transform_bounds(&self, b: &Bounds) -> Result<Bounds> {
        if self.is_identity() {
            return Ok(*b);
        }
        let n = BOUNDS_EDGE_SAMPLES;
        let mut out: Option<Bounds> = None;
        for i in 0..=n {
            let t = i as f64 / n as f64;
            let x = b.min_x + t * b.width();
            let y = b.min_y + t * b.height();
            for (px, py) in [(x, b.min_y), (x, b.max_y), (b.min_x, y), (b.max_x, y)] {
                let (tx, ty) = self.transform(px, py)?;
                match out.as_mut() {
                    Some(o) => o.expand_to(tx, ty),
                    None => out = Some(Bounds::new(tx, ty, tx, ty)),
                }
            }
        }
        out.ok_or_else(|| Error::Projection("empty extent".into()))
    }
}

/// Extent of `b` expressed in `dst`.
pub fn transform_bounds(b: &Bounds, src: Crs, dst: Crs) -> Result<Bounds> {
    CoordTransformer::new(src, dst)?.transform_bounds(b)
}
