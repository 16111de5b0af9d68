//! Point-cloud gridding: highest return per cell.
//!
//! Gridding and cluster extraction (see [`crate::cluster`]) are independent
//! passes over the same points.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geo::{Bounds, CoordTransformer, Crs, GeoTransform};
use crate::grid::Grid;
use crate::io::raster::DEFAULT_NODATA;

/// ASPRS class codes used when selecting returns.
pub const CLASS_GROUND: u8 = 2;
pub const CLASS_HIGH_VEGETATION: u8 = 5;
pub const CLASS_BUILDING: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub classification: Option<u8>,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, classification: None }
    }
}

/// Unordered 3-D points in one CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Point3>,
    pub crs: Crs,
}

impl PointCloud {
    pub fn new(points: Vec<Point3>, crs: Crs) -> Self {
        Self { points, crs }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(self.points.iter().map(|p| (p.x, p.y)))
    }

    /// Keep points whose classification is in `classes`; unclassified points
    /// are dropped.
    pub fn filter_classes(&self, classes: &[u8]) -> PointCloud {
        let points = self
            .points
            .iter()
            .filter(|p| p.classification.is_some_and(|c| classes.contains(&c)))
            .copied()
            .collect();
        PointCloud { points, crs: self.crs }
    }

    pub fn filter_bounds(&self, b: &Bounds) -> PointCloud {
        let points = self.points.iter().filter(|p| b.contains(p.x, p.y)).copied().collect();
        PointCloud { points, crs: self.crs }
    }

    /// Horizontal coordinates expressed in `crs`; z is untouched.
    pub fn reprojected(&self, crs: Crs) -> Result<PointCloud> {
        let t = CoordTransformer::new(self.crs, crs)?;
        if t.is_identity() {
            return Ok(PointCloud { points: self.points.clone(), crs });
        }
        let points = self
            .points
            .iter()
            .map(|p| t.transform(p.x, p.y).map(|(x, y)| Point3 { x, y, ..*p }))
            .collect::<Result<Vec<_>>>()?;
        Ok(PointCloud { points, crs })
    }
}

/// Bin points into `resolution`-sized cells and keep the maximum z per cell.
///
/// Without an explicit extent the grid origin is the upper-left point and
/// the grid grows right/down far enough to hold every point. Points outside
/// an explicit extent are ignored. Empty cells are nodata.
pub fn grid_max_z(cloud: &PointCloud, resolution: f64, extent: Option<&Bounds>) -> Result<Grid> {
    if !(resolution > 0.0) {
        return Err(Error::InvalidParameter(format!("resolution must be > 0, got {resolution}")));
    }
    let (origin_x, origin_y, width, height) = match extent {
        Some(b) => (
            b.min_x,
            b.max_y,
            (b.width() / resolution).ceil().max(1.0) as usize,
            (b.height() / resolution).ceil().max(1.0) as usize,
        ),
        None => {
            let b = cloud
                .bounds()
                .ok_or_else(|| Error::InvalidParameter("empty point cloud".into()))?;
            (
                b.min_x,
                b.max_y,
                (b.width() / resolution).floor() as usize + 1,
                (b.height() / resolution).floor() as usize + 1,
            )
        }
    };

    let transform = GeoTransform::north_up(origin_x, origin_y, resolution);
    let mut grid = Grid::empty(width, height, transform, cloud.crs, DEFAULT_NODATA);
    for p in &cloud.points {
        let col = ((p.x - origin_x) / resolution).floor();
        let row = ((origin_y - p.y) / resolution).floor();
        if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 || !p.z.is_finite() {
            continue;
        }
        let (row, col) = (row as usize, col as usize);
        let z = p.z as f32;
        match grid.value(row, col) {
            Some(current) if current >= z => {}
            _ => grid.set(row, col, z),
        }
    }
    Ok(grid)
}
