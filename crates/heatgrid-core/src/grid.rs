use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geo::{Bounds, Crs, GeoTransform};

/// Absorbs float noise when converting map distances to whole cells.
const CELL_EPS: f64 = 1e-9;

/// A georeferenced single-band raster, row-major with row 0 at the top.
/// Cell values use f32; coordinate math uses f64.
///
/// A cell is nodata when it equals `nodata` or is NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub data: Vec<f32>,
    /// Number of columns.
    pub width: usize,
    /// Number of rows.
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Crs,
    pub nodata: f32,
}

impl Grid {
    /// Create a grid filled with `fill`.
    pub fn new(width: usize, height: usize, transform: GeoTransform, crs: Crs, nodata: f32, fill: f32) -> Self {
        Self {
            data: vec![fill; width * height],
            width,
            height,
            transform,
            crs,
            nodata,
        }
    }

    /// Grid where every cell is nodata.
    pub fn empty(width: usize, height: usize, transform: GeoTransform, crs: Crs, nodata: f32) -> Self {
        Self::new(width, height, transform, crs, nodata, nodata)
    }

    pub fn from_vec(
        data: Vec<f32>,
        width: usize,
        height: usize,
        transform: GeoTransform,
        crs: Crs,
        nodata: f32,
    ) -> Result<Self> {
        if data.len() != width * height {
            return Err(Error::Raster(format!(
                "{} values do not fill a {width}x{height} grid",
                data.len()
            )));
        }
        Ok(Self { data, width, height, transform, crs, nodata })
    }

    /// Same georeferencing and nodata sentinel, all cells nodata.
    pub fn empty_like(&self) -> Self {
        Self::empty(self.width, self.height, self.transform, self.crs, self.nodata)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f32) {
        self.data[row * self.width + col] = val;
    }

    #[inline]
    pub fn is_nodata_value(&self, v: f32) -> bool {
        v.is_nan() || v == self.nodata
    }

    #[inline]
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        !self.is_nodata_value(self.get(row, col))
    }

    /// Cell value, `None` for nodata.
    #[inline]
    pub fn value(&self, row: usize, col: usize) -> Option<f32> {
        let v = self.get(row, col);
        (!self.is_nodata_value(v)).then_some(v)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| !self.is_nodata_value(v)).count()
    }

    pub fn nodata_count(&self) -> usize {
        self.data.len() - self.valid_count()
    }

    pub fn valid_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().copied().filter(move |&v| !self.is_nodata_value(v))
    }

    pub fn min_value(&self) -> Option<f32> {
        self.valid_values().reduce(f32::min)
    }

    pub fn max_value(&self) -> Option<f32> {
        self.valid_values().reduce(f32::max)
    }

    /// Apply `f` to every valid cell; nodata cells stay nodata.
    pub fn map_valid(&self, f: impl Fn(f32) -> f32) -> Grid {
        let mut out = self.clone();
        for v in out.data.iter_mut() {
            if !self.is_nodata_value(*v) {
                *v = f(*v);
            }
        }
        out
    }

    // ── Georeferencing ───────────────────────────────────────────────────────

    /// Cell size along x (square cells are assumed by area statistics).
    pub fn resolution(&self) -> f64 {
        self.transform.resolution().0
    }

    /// Area of one cell in squared map units.
    pub fn cell_area(&self) -> f64 {
        let (rx, ry) = self.transform.resolution();
        rx * ry
    }

    #[inline]
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.transform.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Cell containing map coordinate (x, y), if inside the grid.
    pub fn locate(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (c, r) = self.transform.invert(x, y)?;
        if c < 0.0 || r < 0.0 {
            return None;
        }
        let (row, col) = (r.floor() as usize, c.floor() as usize);
        (row < self.height && col < self.width).then_some((row, col))
    }

    /// Envelope of the four grid corners.
    pub fn bounds(&self) -> Bounds {
        self.transform.extent(self.width, self.height)
    }

    /// Same shape, CRS and transform (to within a millionth of a cell).
    pub fn same_georef(&self, other: &Grid) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.crs == other.crs
            && self.transform.approx_eq(&other.transform, self.resolution() * 1e-6)
    }

    /// Guard for cell-wise operations.
    pub fn ensure_same_georef(&self, other: &Grid, context: &str) -> Result<()> {
        if self.same_georef(other) {
            return Ok(());
        }
        Err(Error::IncompatibleGrid(format!(
            "{context}: {}x{} {} {:?} vs {}x{} {} {:?}",
            self.width,
            self.height,
            self.crs,
            self.transform.to_gdal(),
            other.width,
            other.height,
            other.crs,
            other.transform.to_gdal()
        )))
    }

    // ── Windows ──────────────────────────────────────────────────────────────

    /// Copy of the window starting at (col_off, row_off).
    pub fn window(&self, col_off: usize, row_off: usize, width: usize, height: usize) -> Result<Grid> {
        if width == 0 || height == 0 || col_off + width > self.width || row_off + height > self.height {
            return Err(Error::InvalidParameter(format!(
                "window {width}x{height}+{col_off}+{row_off} outside {}x{} grid",
                self.width, self.height
            )));
        }
        let mut data = Vec::with_capacity(width * height);
        for r in row_off..row_off + height {
            let start = r * self.width + col_off;
            data.extend_from_slice(&self.data[start..start + width]);
        }
        Ok(Grid {
            data,
            width,
            height,
            transform: self.transform.shifted(col_off as f64, row_off as f64),
            crs: self.crs,
            nodata: self.nodata,
        })
    }

    /// Crop to the cells covered by `b`, window-read style: fractional
    /// offsets are truncated and the window is clamped to the grid.
    /// Requires a north-up grid.
    pub fn crop_to_bounds(&self, b: &Bounds) -> Result<Grid> {
        if !self.transform.is_north_up() {
            return Err(Error::InvalidParameter("bounds crop needs a north-up grid".into()));
        }
        let (c0, r0) = self
            .transform
            .invert(b.min_x, b.max_y)
            .ok_or_else(|| Error::Raster("degenerate transform".into()))?;
        let (c1, r1) = self
            .transform
            .invert(b.max_x, b.min_y)
            .ok_or_else(|| Error::Raster("degenerate transform".into()))?;
        let clamp = |v: f64, max: usize| (v + CELL_EPS).floor().clamp(0.0, max as f64) as usize;
        let (col0, col1) = (clamp(c0.min(c1), self.width), clamp(c0.max(c1), self.width));
        let (row0, row1) = (clamp(r0.min(r1), self.height), clamp(r0.max(r1), self.height));
        if col1 <= col0 || row1 <= row0 {
            return Err(Error::NoOverlap { subject: format!("crop window {b:?}") });
        }
        self.window(col0, row0, col1 - col0, row1 - row0)
    }

    /// Extent left after removing `buffer` map units from every edge.
    /// Fails unless at least one cell survives in each direction.
    pub fn buffered_bounds(&self, buffer: f64) -> Result<Bounds> {
        if !buffer.is_finite() || buffer < 0.0 {
            return Err(Error::InvalidParameter(format!("edge buffer must be >= 0, got {buffer}")));
        }
        let buffer_cells = (buffer / self.resolution() + CELL_EPS).floor() as usize;
        let min_dim = self.width.min(self.height);
        if 2 * buffer_cells >= min_dim {
            return Err(Error::InvalidBuffer { buffer, buffer_cells, min_dim });
        }
        Ok(self.bounds().shrink(buffer))
    }

    /// Drop `buffer` map units from every edge.
    pub fn crop_edge_buffer(&self, buffer: f64) -> Result<Grid> {
        let b = self.buffered_bounds(buffer)?;
        self.crop_to_bounds(&b)
    }

    /// Drop `cells` whole cells from every edge.
    pub fn shrink_cells(&self, cells: usize) -> Result<Grid> {
        if 2 * cells >= self.width.min(self.height) {
            return Err(Error::InvalidBuffer {
                buffer: cells as f64 * self.resolution(),
                buffer_cells: cells,
                min_dim: self.width.min(self.height),
            });
        }
        self.window(cells, cells, self.width - 2 * cells, self.height - 2 * cells)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `w`x`h` north-up grid, 1 m cells, origin (0, h), filled with `fill`.
    pub(crate) fn metric_grid(w: usize, h: usize, fill: f32) -> Grid {
        Grid::new(w, h, GeoTransform::north_up(0.0, h as f64, 1.0), Crs::Epsg(28992), -9999.0, fill)
    }

    #[test]
    fn nan_and_sentinel_are_nodata() {
        let mut g = metric_grid(3, 1, 1.0);
        g.set(0, 0, -9999.0);
        g.set(0, 1, f32::NAN);
        assert_eq!(g.valid_count(), 1);
        assert_eq!(g.value(0, 2), Some(1.0));
        assert_eq!(g.value(0, 1), None);
    }

    #[test]
    fn cell_center_and_locate_agree() {
        let g = metric_grid(10, 5, 0.0);
        let (x, y) = g.cell_center(2, 7);
        assert_eq!((x, y), (7.5, 2.5));
        assert_eq!(g.locate(x, y), Some((2, 7)));
        assert_eq!(g.locate(-0.1, 2.0), None);
        assert_eq!(g.locate(10.0, 2.0), None);
    }

    #[test]
    fn window_shifts_origin() {
        let mut g = metric_grid(4, 4, 0.0);
        g.set(1, 2, 5.0);
        let w = g.window(2, 1, 2, 2).unwrap();
        assert_eq!(w.get(0, 0), 5.0);
        assert_eq!(w.transform.origin_x, 2.0);
        assert_eq!(w.transform.origin_y, 3.0);
        assert!(g.window(3, 3, 2, 2).is_err());
    }

    #[test]
    fn edge_buffer_of_half_minus_one_cell_succeeds() {
        let g = metric_grid(10, 10, 1.0);
        let cropped = g.crop_edge_buffer(4.0).unwrap();
        assert_eq!((cropped.width, cropped.height), (2, 2));
        assert_eq!(cropped.bounds(), Bounds::new(4.0, 4.0, 6.0, 6.0));
    }

    #[test]
    fn edge_buffer_of_half_or_more_is_rejected() {
        let g = metric_grid(10, 20, 1.0);
        for buffer in [5.0, 6.0, 500.0] {
            match g.crop_edge_buffer(buffer) {
                Err(Error::InvalidBuffer { min_dim, .. }) => assert_eq!(min_dim, 10),
                other => panic!("buffer {buffer} should be rejected, got {other:?}"),
            }
        }
        assert!(matches!(g.crop_edge_buffer(-1.0), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn zero_buffer_is_identity() {
        let g = metric_grid(3, 3, 2.0);
        assert_eq!(g.crop_edge_buffer(0.0).unwrap(), g);
    }

    #[test]
    fn crop_to_bounds_truncates_fractional_offsets() {
        let g = metric_grid(10, 10, 0.0);
        let c = g.crop_to_bounds(&Bounds::new(1.4, 2.0, 5.9, 8.6)).unwrap();
        assert_eq!((c.width, c.height), (4, 7));
        assert_eq!(c.transform.origin_x, 1.0);
        assert_eq!(c.transform.origin_y, 9.0);
        assert!(g.crop_to_bounds(&Bounds::new(20.0, 20.0, 30.0, 30.0)).is_err());
    }

    #[test]
    fn georef_mismatch_is_incompatible() {
        let a = metric_grid(4, 4, 0.0);
        let mut b = a.clone();
        b.transform.origin_x += 1.0;
        assert!(a.ensure_same_georef(&a.clone(), "diff").is_ok());
        assert!(matches!(a.ensure_same_georef(&b, "diff"), Err(Error::IncompatibleGrid(_))));
    }
}
