//! File-format collaborators. The pipeline stages only see [`Grid`],
//! [`FeatureSet`] and [`PointCloud`] values.
//!
//! [`Grid`]: crate::grid::Grid
//! [`FeatureSet`]: vector::FeatureSet
//! [`PointCloud`]: crate::pointcloud::PointCloud

pub mod points;
pub mod raster;
pub mod table;
pub mod vector;

pub use raster::{read_grid, write_grid, GeoTiffStore, RasterStore};
