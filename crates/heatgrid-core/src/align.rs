//! Grid alignment: resample and reproject layers onto one reference grid,
//! plus read-only inspection of a batch of grids.
//!
//! Every destination cell is mapped back into the source grid
//! (destination → source), so the output always has exactly the reference
//! shape, transform and CRS. Resampling is chosen per layer: nearest or mode
//! for categorical rasters, bilinear or average for continuous ones.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geo::{transform_bounds, Bounds, CoordTransformer, Crs, GeoTransform, EPSG_WGS84};
use crate::grid::Grid;

/// Origins closer than this to a whole unit count as integer.
const ORIGIN_TOLERANCE: f64 = 1e-6;

// ── Resampling methods ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    Bilinear,
    /// Area-weighted mean of the source cells under the destination cell.
    Average,
    /// Area-weighted majority value; ties go to the smaller value.
    Mode,
}

impl Resampling {
    pub fn name(&self) -> &'static str {
        match self {
            Resampling::Nearest => "nearest",
            Resampling::Bilinear => "bilinear",
            Resampling::Average => "average",
            Resampling::Mode => "mode",
        }
    }
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resampling {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            "average" | "mean" => Ok(Resampling::Average),
            "mode" | "majority" => Ok(Resampling::Mode),
            other => Err(Error::InvalidParameter(format!("unknown resampling method `{other}`"))),
        }
    }
}

// ── Target grids ─────────────────────────────────────────────────────────────

/// Georeferencing of a grid without its cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl GridSpec {
    pub fn of(grid: &Grid) -> Self {
        Self {
            width: grid.width,
            height: grid.height,
            transform: grid.transform,
            crs: grid.crs,
        }
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.extent(self.width, self.height)
    }

    /// True when `grid` already has exactly this georeferencing.
    pub fn matches(&self, grid: &Grid) -> bool {
        self.width == grid.width
            && self.height == grid.height
            && self.crs == grid.crs
            && self.transform.approx_eq(&grid.transform, self.transform.resolution().0 * 1e-6)
    }

    /// Same extent with cells of `resolution` map units; partial cells at the
    /// right and bottom edges are dropped.
    pub fn with_resolution(&self, resolution: f64) -> Result<Self> {
        let current = self.transform.resolution().0;
        if !(resolution > 0.0) {
            return Err(Error::InvalidParameter(format!("resolution must be > 0, got {resolution}")));
        }
        let scale = resolution / current;
        let width = (self.width as f64 / scale + 1e-9).floor() as usize;
        let height = (self.height as f64 / scale + 1e-9).floor() as usize;
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter(format!(
                "resolution {resolution} leaves no cells in a {}x{} grid",
                self.width, self.height
            )));
        }
        Ok(Self { width, height, transform: self.transform.scaled(scale), crs: self.crs })
    }
}

/// Round the origin to whole map units; cell size and shape are kept.
pub fn snap_origin(spec: &GridSpec) -> GridSpec {
    let mut transform = spec.transform;
    transform.origin_x = transform.origin_x.round();
    transform.origin_y = transform.origin_y.round();
    GridSpec { transform, ..*spec }
}

// ── Resampling ───────────────────────────────────────────────────────────────

/// Resample / reproject `src` onto `target`. Cells whose source footprint
/// holds no valid data are nodata; the source nodata sentinel is kept.
pub fn resample(src: &Grid, target: &GridSpec, method: Resampling) -> Result<Grid> {
    let to_src = CoordTransformer::new(target.crs, src.crs)?;
    let mut out = Grid::empty(target.width, target.height, target.transform, target.crs, src.nodata);

    for row in 0..target.height {
        for col in 0..target.width {
            let v = match method {
                Resampling::Nearest | Resampling::Bilinear => {
                    let (x, y) = target.transform.apply(col as f64 + 0.5, row as f64 + 0.5);
                    let (sx, sy) = to_src.transform(x, y)?;
                    let Some((fc, fr)) = src.transform.invert(sx, sy) else {
                        return Err(Error::Raster("degenerate source transform".into()));
                    };
                    if method == Resampling::Nearest {
                        sample_nearest(src, fc, fr)
                    } else {
                        sample_bilinear(src, fc, fr)
                    }
                }
                Resampling::Average | Resampling::Mode => {
                    let fp = footprint(src, target, &to_src, row, col)?;
                    if method == Resampling::Average {
                        sample_average(src, fp)
                    } else {
                        sample_mode(src, fp)
                    }
                }
            };
            if let Some(v) = v {
                out.set(row, col, v);
            }
        }
    }
    Ok(out)
}

fn sample_nearest(src: &Grid, fc: f64, fr: f64) -> Option<f32> {
    if fc < 0.0 || fr < 0.0 {
        return None;
    }
    let (col, row) = (fc.floor() as usize, fr.floor() as usize);
    if row >= src.height || col >= src.width {
        return None;
    }
    src.value(row, col)
}

/// Bilinear weights over the four surrounding cell centres, renormalised
/// over the valid ones.
fn sample_bilinear(src: &Grid, fc: f64, fr: f64) -> Option<f32> {
    if fc < 0.0 || fr < 0.0 || fc > src.width as f64 || fr > src.height as f64 {
        return None;
    }
    let px = (fc - 0.5).clamp(0.0, (src.width - 1) as f64);
    let py = (fr - 0.5).clamp(0.0, (src.height - 1) as f64);
    let x0 = px.floor() as usize;
    let y0 = py.floor() as usize;
    let x1 = (x0 + 1).min(src.width - 1);
    let y1 = (y0 + 1).min(src.height - 1);
    let tx = px - x0 as f64;
    let ty = py - y0 as f64;

    let taps = [
        (y0, x0, (1.0 - tx) * (1.0 - ty)),
        (y0, x1, tx * (1.0 - ty)),
        (y1, x0, (1.0 - tx) * ty),
        (y1, x1, tx * ty),
    ];
    let (mut acc, mut wsum) = (0.0f64, 0.0f64);
    for (r, c, w) in taps {
        if let Some(v) = src.value(r, c) {
            acc += v as f64 * w;
            wsum += w;
        }
    }
    (wsum > 1e-12).then(|| (acc / wsum) as f32)
}

/// Fractional source-pixel box (c0, r0, c1, r1) under a destination cell.
fn footprint(
    src: &Grid,
    target: &GridSpec,
    to_src: &CoordTransformer,
    row: usize,
    col: usize,
) -> Result<(f64, f64, f64, f64)> {
    let mut b: Option<(f64, f64, f64, f64)> = None;
    for (dc, dr) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
        let (x, y) = target.transform.apply(col as f64 + dc, row as f64 + dr);
        let (sx, sy) = to_src.transform(x, y)?;
        let (fc, fr) = src
            .transform
            .invert(sx, sy)
            .ok_or_else(|| Error::Raster("degenerate source transform".into()))?;
        b = Some(match b {
            None => (fc, fr, fc, fr),
            Some((c0, r0, c1, r1)) => (c0.min(fc), r0.min(fr), c1.max(fc), r1.max(fr)),
        });
    }
    b.ok_or_else(|| Error::Raster("empty footprint".into()))
}

/// Source cells under a footprint with their fractional overlap areas.
fn weighted_cells(src: &Grid, (c0, r0, c1, r1): (f64, f64, f64, f64)) -> Vec<(f32, f64)> {
    let col_lo = c0.max(0.0).floor() as usize;
    let row_lo = r0.max(0.0).floor() as usize;
    let col_hi = (c1.min(src.width as f64).ceil().max(0.0) as usize).min(src.width);
    let row_hi = (r1.min(src.height as f64).ceil().max(0.0) as usize).min(src.height);
    let mut cells = Vec::new();
    for r in row_lo..row_hi {
        let wy = (r1.min(r as f64 + 1.0) - r0.max(r as f64)).max(0.0);
        if wy <= 0.0 {
            continue;
        }
        for c in col_lo..col_hi {
            let wx = (c1.min(c as f64 + 1.0) - c0.max(c as f64)).max(0.0);
            if wx <= 0.0 {
                continue;
            }
            if let Some(v) = src.value(r, c) {
                cells.push((v, wx * wy));
            }
        }
    }
    cells
}

fn sample_average(src: &Grid, fp: (f64, f64, f64, f64)) -> Option<f32> {
    let cells = weighted_cells(src, fp);
    let wsum: f64 = cells.iter().map(|(_, w)| w).sum();
    (wsum > 1e-12).then(|| (cells.iter().map(|&(v, w)| v as f64 * w).sum::<f64>() / wsum) as f32)
}

fn sample_mode(src: &Grid, fp: (f64, f64, f64, f64)) -> Option<f32> {
    let mut tally: Vec<(f32, f64)> = Vec::new();
    for (v, w) in weighted_cells(src, fp) {
        match tally.iter_mut().find(|(k, _)| *k == v) {
            Some(entry) => entry.1 += w,
            None => tally.push((v, w)),
        }
    }
    tally
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.total_cmp(&a.0)))
        .map(|(v, _)| v)
}

// ── Batch alignment ──────────────────────────────────────────────────────────

/// One input of an alignment batch.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub grid: Grid,
    pub method: Resampling,
}

impl Layer {
    pub fn new(name: impl Into<String>, grid: Grid, method: Resampling) -> Self {
        Self { name: name.into(), grid, method }
    }
}

/// Align every layer onto the first one.
pub fn align_layers(layers: &[Layer]) -> Result<Vec<Grid>> {
    let Some(first) = layers.first() else {
        return Ok(Vec::new());
    };
    align_to(&GridSpec::of(&first.grid), layers)
}

/// Align every layer onto an explicit template. Fails with `NoOverlap` on
/// the first layer that shares no extent with the template.
pub fn align_to(reference: &GridSpec, layers: &[Layer]) -> Result<Vec<Grid>> {
    let ref_bounds = reference.bounds();
    let mut out = Vec::with_capacity(layers.len());
    for layer in layers {
        let b = transform_bounds(&layer.grid.bounds(), layer.grid.crs, reference.crs)?;
        if b.intersection(&ref_bounds).is_none() {
            return Err(Error::NoOverlap { subject: layer.name.clone() });
        }
        let g = &layer.grid;
        if reference.matches(g) {
            debug!(layer = %layer.name, "already aligned");
            out.push(g.clone());
            continue;
        }
        debug!(layer = %layer.name, method = %layer.method, "resampling onto reference");
        out.push(resample(g, reference, layer.method)?);
    }
    Ok(out)
}

/// Extent shared by two grids, expressed in `a`'s CRS.
pub fn overlap_bounds(a: &Grid, b: &Grid) -> Result<Bounds> {
    let bb = transform_bounds(&b.bounds(), b.crs, a.crs)?;
    a.bounds()
        .intersection(&bb)
        .ok_or_else(|| Error::NoOverlap { subject: "grid pair".into() })
}

// ── Inspection ───────────────────────────────────────────────────────────────

/// Read-only description of one grid.
#[derive(Debug, Clone, Serialize)]
pub struct GridReport {
    pub name: String,
    pub crs: String,
    pub resolution_x: f64,
    pub resolution_y: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub rows: usize,
    pub cols: usize,
    pub bounds: Bounds,
    /// Extent in EPSG:4326 degrees; `None` when the CRS cannot be transformed.
    pub bounds_wgs84: Option<Bounds>,
    pub nodata: f32,
    pub valid_cells: usize,
}

pub fn inspect(grids: &[(String, &Grid)]) -> Vec<GridReport> {
    grids
        .iter()
        .map(|(name, g)| {
            let (rx, ry) = g.transform.resolution();
            let bounds = g.bounds();
            let bounds_wgs84 = match transform_bounds(&bounds, g.crs, Crs::Epsg(EPSG_WGS84)) {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!(grid = %name, error = %e, "cannot express extent in EPSG:4326");
                    None
                }
            };
            GridReport {
                name: name.clone(),
                crs: g.crs.to_string(),
                resolution_x: rx,
                resolution_y: ry,
                origin_x: g.transform.origin_x,
                origin_y: g.transform.origin_y,
                rows: g.height,
                cols: g.width,
                bounds,
                bounds_wgs84,
                nodata: g.nodata,
                valid_cells: g.valid_count(),
            }
        })
        .collect()
}

/// Problems that make a set of grids unfit as model input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum AlignmentIssue {
    CrsMismatch { name: String, expected: String, found: String },
    Resolution { name: String, expected: f64, found: f64 },
    NonIntegerOrigin { name: String, origin_x: f64, origin_y: f64 },
    ShapeMismatch { name: String, expected: (usize, usize), found: (usize, usize) },
    ExtentMismatch { name: String },
}

impl fmt::Display for AlignmentIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrsMismatch { name, expected, found } => write!(f, "{name}: CRS {found}, expected {expected}"),
            Self::Resolution { name, expected, found } => write!(f, "{name}: resolution {found}, expected {expected}"),
            Self::NonIntegerOrigin { name, origin_x, origin_y } => {
                write!(f, "{name}: origin ({origin_x}, {origin_y}) is not on whole units")
            }
            Self::ShapeMismatch { name, expected, found } => {
                write!(f, "{name}: shape {found:?} (rows, cols), expected {expected:?}")
            }
            Self::ExtentMismatch { name } => write!(f, "{name}: extent differs from the first grid"),
        }
    }
}

/// Check a batch against the first grid and `expected_resolution`.
pub fn check_alignment(grids: &[(String, &Grid)], expected_resolution: f64) -> Vec<AlignmentIssue> {
    let mut issues = Vec::new();
    let Some((_, first)) = grids.first() else {
        return issues;
    };
    for (name, g) in grids {
        if g.crs != first.crs {
            issues.push(AlignmentIssue::CrsMismatch {
                name: name.clone(),
                expected: first.crs.to_string(),
                found: g.crs.to_string(),
            });
        }
        let (rx, ry) = g.transform.resolution();
        for found in [rx, ry] {
            if (found - expected_resolution).abs() > 1e-9 {
                issues.push(AlignmentIssue::Resolution {
                    name: name.clone(),
                    expected: expected_resolution,
                    found,
                });
                break;
            }
        }
        let (ox, oy) = (g.transform.origin_x, g.transform.origin_y);
        if (ox - ox.round()).abs() > ORIGIN_TOLERANCE || (oy - oy.round()).abs() > ORIGIN_TOLERANCE {
            issues.push(AlignmentIssue::NonIntegerOrigin { name: name.clone(), origin_x: ox, origin_y: oy });
        }
        if (g.height, g.width) != (first.height, first.width) {
            issues.push(AlignmentIssue::ShapeMismatch {
                name: name.clone(),
                expected: (first.height, first.width),
                found: (g.height, g.width),
            });
        } else if !g.transform.approx_eq(&first.transform, ORIGIN_TOLERANCE) {
            issues.push(AlignmentIssue::ExtentMismatch { name: name.clone() });
        }
    }
    issues
}
