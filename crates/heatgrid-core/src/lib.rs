//! Raster/vector reconciliation and validation for microclimate modelling.
//!
//! The preparation half brings DEMs, building footprints, point clouds and
//! land cover onto one grid ([`align`], [`rasterize`], [`pointcloud`],
//! [`cluster`], [`fill`], [`composite`], [`pipeline`]). The analysis half
//! compares folders of model outputs ([`scenario`], [`compare`], [`utci`],
//! [`aggregate`]) and validates one source against another ([`accuracy`]).

pub mod accuracy;
pub mod aggregate;
pub mod align;
pub mod cluster;
pub mod compare;
pub mod composite;
pub mod config;
pub mod error;
pub mod fill;
pub mod geo;
pub mod grid;
pub mod io;
pub mod pipeline;
pub mod pointcloud;
pub mod rasterize;
pub mod scenario;
pub mod stats;
pub mod utci;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use grid::Grid;
