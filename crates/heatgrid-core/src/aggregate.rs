//! Multi-resolution aggregation of run folders.
//!
//! Every GeoTIFF in every run folder is resampled to each target resolution
//! with each method, written to `<out>/<method>/<run>/<stem>_<res>m.tif`.
//! The coarse grid keeps the source origin; partial cells at the right and
//! bottom edges are dropped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::align::{resample, GridSpec, Resampling};
use crate::config::DEFAULT_AGGREGATION_RESOLUTIONS;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::io::RasterStore;
use crate::scenario::{for_each_run, BatchReport, CancelToken, ScenarioRun, ScenarioSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Target cell sizes in map units.
    pub resolutions: Vec<f64>,
    pub methods: Vec<Resampling>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            resolutions: DEFAULT_AGGREGATION_RESOLUTIONS.to_vec(),
            methods: vec![Resampling::Average, Resampling::Bilinear],
        }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(r) = self.resolutions.iter().find(|r| !(**r > 0.0)) {
            return Err(Error::InvalidParameter(format!("aggregation resolution must be > 0, got {r}")));
        }
        if self.resolutions.is_empty() || self.methods.is_empty() {
            return Err(Error::InvalidParameter("aggregation needs at least one resolution and one method".into()));
        }
        Ok(())
    }
}

/// Resample `grid` to cells of `resolution`.
pub fn aggregate(grid: &Grid, resolution: f64, method: Resampling) -> Result<Grid> {
    let target = GridSpec::of(grid).with_resolution(resolution)?;
    resample(grid, &target, method)
}

/// `5.0` -> "5", `2.5` -> "2.5".
fn resolution_label(r: f64) -> String {
    if r.fract() == 0.0 {
        format!("{}", r as i64)
    } else {
        format!("{r}")
    }
}

pub fn aggregate_path(out_root: &Path, method: Resampling, run: &str, stem: &str, resolution: f64) -> PathBuf {
    out_root
        .join(method.name())
        .join(run)
        .join(format!("{stem}_{}m.tif", resolution_label(resolution)))
}

/// One aggregated grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateOutput {
    pub run: String,
    pub source: String,
    pub method: Resampling,
    pub resolution: f64,
    pub width: usize,
    pub height: usize,
    pub path: String,
}

/// GeoTIFFs directly inside a run folder, sorted by name.
fn run_rasters(run: &ScenarioRun) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(&run.dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Aggregate every raster of every run for each (method, resolution).
pub fn aggregate_runs(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    config: &AggregationConfig,
    out_root: &Path,
    cancel: &CancelToken,
) -> Result<BatchReport<AggregateOutput>> {
    config.validate()?;
    let runs: Vec<&ScenarioRun> = set.runs.iter().collect();
    let report = for_each_run(&runs, cancel, |run| {
        let mut r = BatchReport::default();
        for file in run_rasters(run)? {
            let stem = file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
            let unit = format!("{}/{stem}", run.name);
            let grid = match store.read(&file) {
                Ok(g) => g,
                Err(e) if e.is_recoverable() => {
                    r.skip(unit, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for &method in &config.methods {
                for &res in &config.resolutions {
                    let out = aggregate(&grid, res, method).and_then(|g| {
                        let path = aggregate_path(out_root, method, &run.name, &stem, res);
                        store.write(&g, &path)?;
                        Ok(AggregateOutput {
                            run: run.name.clone(),
                            source: stem.clone(),
                            method,
                            resolution: res,
                            width: g.width,
                            height: g.height,
                            path: path.display().to_string(),
                        })
                    });
                    match out {
                        Ok(o) => r.push(o),
                        // A resolution coarser than the grid is a per-unit skip.
                        Err(e @ Error::InvalidParameter(_)) => r.skip(format!("{unit}@{}m", resolution_label(res)), e),
                        Err(e) => r.record(format!("{unit}@{}/{}m", method, resolution_label(res)), Err(e))?,
                    }
                }
            }
        }
        Ok(r)
    })?;
    info!(written = report.processed.len(), skipped = report.skipped.len(), "aggregation");
    Ok(report)
}
