//! Scenario comparison: per-category statistics, layer summaries, shade
//! change against a baseline and cell-wise difference maps.
//!
//! Every grid is first cropped to the analysis window: the extent of one
//! reference grid minus an edge buffer on all sides. With a baseline the
//! window comes from the baseline and is shared by all runs, otherwise each
//! run uses its own. Windows are resolved, and buffer errors raised,
//! before any per-run work starts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::align::{resample, GridSpec, Resampling};
use crate::error::{Error, Result};
use crate::geo::Bounds;
use crate::grid::Grid;
use crate::io::RasterStore;
use crate::scenario::{for_each_run, BatchReport, CancelToken, LayerKind, OutputKind, ScenarioRun, ScenarioSet};
use crate::stats::summarize;

// ── Shade categories ─────────────────────────────────────────────────────────

/// Shadow grids hold 0 for building shade, 1 for full sun and fractions
/// for shade cast through tree canopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadeCategory {
    BuildingShade,
    TreeShade,
    NoShade,
}

impl ShadeCategory {
    pub const ALL: [ShadeCategory; 3] = [ShadeCategory::BuildingShade, ShadeCategory::TreeShade, ShadeCategory::NoShade];

    pub fn classify(v: f32) -> Option<Self> {
        if v == 0.0 {
            Some(ShadeCategory::BuildingShade)
        } else if v == 1.0 {
            Some(ShadeCategory::NoShade)
        } else if v > 0.0 && v < 1.0 {
            Some(ShadeCategory::TreeShade)
        } else {
            None
        }
    }
}

impl fmt::Display for ShadeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShadeCategory::BuildingShade => "building_shade",
            ShadeCategory::TreeShade => "tree_shade",
            ShadeCategory::NoShade => "no_shade",
        })
    }
}

/// Area per shade category of one grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ShadeAreas {
    pub building_shade_m2: f64,
    pub tree_shade_m2: f64,
    pub no_shade_m2: f64,
    /// Whole window, nodata cells included.
    pub total_m2: f64,
}

impl ShadeAreas {
    pub fn area(&self, category: ShadeCategory) -> f64 {
        match category {
            ShadeCategory::BuildingShade => self.building_shade_m2,
            ShadeCategory::TreeShade => self.tree_shade_m2,
            ShadeCategory::NoShade => self.no_shade_m2,
        }
    }
}

pub fn shade_areas(grid: &Grid) -> ShadeAreas {
    let cell = grid.cell_area();
    let mut counts = [0usize; 3];
    for v in grid.valid_values() {
        match ShadeCategory::classify(v) {
            Some(ShadeCategory::BuildingShade) => counts[0] += 1,
            Some(ShadeCategory::TreeShade) => counts[1] += 1,
            Some(ShadeCategory::NoShade) => counts[2] += 1,
            None => {}
        }
    }
    ShadeAreas {
        building_shade_m2: counts[0] as f64 * cell,
        tree_shade_m2: counts[1] as f64 * cell,
        no_shade_m2: counts[2] as f64 * cell,
        total_m2: grid.data.len() as f64 * cell,
    }
}

// ── Analysis windows ─────────────────────────────────────────────────────────

/// The grid in `run` that defines its window: the reference-hour shadow,
/// else the first of `fallback` the run has.
fn window_kind(run: &ScenarioRun, set: &ScenarioSet, fallback: &[OutputKind]) -> Result<OutputKind> {
    let shadow = OutputKind::Shadow(set.naming.reference_hour()?);
    if run.has(shadow) {
        return Ok(shadow);
    }
    fallback.iter().copied().find(|k| run.has(*k)).ok_or_else(|| Error::MissingRunFile {
        run: run.name.clone(),
        file: shadow.to_string(),
    })
}

/// Reference extent of `run` minus `edge_buffer` on every side.
pub fn analysis_window(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    run: &ScenarioRun,
    fallback: &[OutputKind],
    edge_buffer: f64,
) -> Result<Bounds> {
    let kind = window_kind(run, set, fallback)?;
    let grid = store.read(run.path(kind)?)?;
    let window = grid.buffered_bounds(edge_buffer)?;
    debug!(run = %run.name, %kind, ?window, "analysis window");
    Ok(window)
}

fn load_cropped(store: &dyn RasterStore, run: &ScenarioRun, kind: OutputKind, window: &Bounds) -> Result<Grid> {
    store.read(run.path(kind)?)?.crop_to_bounds(window)
}

/// Window shared by all runs, if a baseline is set.
fn shared_window<'a>(
    store: &dyn RasterStore,
    set: &'a ScenarioSet,
    baseline: Option<&str>,
    fallback: &[OutputKind],
    edge_buffer: f64,
) -> Result<Option<(Bounds, &'a ScenarioRun)>> {
    match baseline {
        Some(name) => {
            let base = set.baseline(name)?;
            Ok(Some((analysis_window(store, set, base, fallback, edge_buffer)?, base)))
        }
        None => Ok(None),
    }
}

/// Analysis window of every run, resolved before any per-run work. Runs
/// whose reference grid is unavailable are skipped into `report`.
pub(crate) fn run_windows<'a, T>(
    store: &dyn RasterStore,
    set: &'a ScenarioSet,
    shared: Option<Bounds>,
    fallback: &[OutputKind],
    edge_buffer: f64,
    report: &mut BatchReport<T>,
) -> Result<(Vec<&'a ScenarioRun>, BTreeMap<&'a str, Bounds>)> {
    let mut runs = Vec::new();
    let mut windows = BTreeMap::new();
    for run in &set.runs {
        let window = match shared {
            Some(w) => w,
            None => match analysis_window(store, set, run, fallback, edge_buffer) {
                Ok(w) => w,
                Err(e) if e.is_recoverable() => {
                    report.skip(run.name.clone(), e);
                    continue;
                }
                Err(e) => return Err(e),
            },
        };
        runs.push(run);
        windows.insert(run.name.as_str(), window);
    }
    Ok((runs, windows))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsOptions {
    pub edge_buffer: f64,
    pub baseline: Option<String>,
}

// ── Non-spatial shade statistics ─────────────────────────────────────────────

/// One (run, hour, category) row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStat {
    pub run: String,
    pub hour: u8,
    pub category: ShadeCategory,
    pub area_m2: f64,
    pub percent_of_aoi: f64,
    /// Signed area difference from the baseline at the same hour.
    pub baseline_diff_m2: Option<f64>,
    pub baseline_diff_pct_points: Option<f64>,
}

fn category_rows(run: &str, hour: u8, areas: &ShadeAreas, base: Option<&ShadeAreas>) -> Vec<CategoryStat> {
    let pct = |a: &ShadeAreas, c| if a.total_m2 > 0.0 { a.area(c) / a.total_m2 * 100.0 } else { 0.0 };
    ShadeCategory::ALL
        .iter()
        .map(|&c| CategoryStat {
            run: run.to_string(),
            hour,
            category: c,
            area_m2: areas.area(c),
            percent_of_aoi: pct(areas, c),
            baseline_diff_m2: base.map(|b| areas.area(c) - b.area(c)),
            baseline_diff_pct_points: base.map(|b| pct(areas, c) - pct(b, c)),
        })
        .collect()
}

/// Shade area per category for every run and hour.
pub fn shade_statistics(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    opts: &StatsOptions,
    cancel: &CancelToken,
) -> Result<BatchReport<CategoryStat>> {
    let shared = shared_window(store, set, opts.baseline.as_deref(), &[], opts.edge_buffer)?;
    let hours = set.naming.hours.clone();

    let mut base_areas: BTreeMap<u8, ShadeAreas> = BTreeMap::new();
    if let Some((window, base)) = &shared {
        for &h in &hours {
            if let Ok(g) = load_cropped(store, base, OutputKind::Shadow(h), window) {
                base_areas.insert(h, shade_areas(&g));
            }
        }
    }

    let mut report = BatchReport::default();
    let (runs, windows) = run_windows(store, set, shared.map(|(w, _)| w), &[], opts.edge_buffer, &mut report)?;
    let batch = for_each_run(&runs, cancel, |run| {
        let window = windows[run.name.as_str()];
        let mut r = BatchReport::default();
        for &h in &hours {
            let rows = load_cropped(store, run, OutputKind::Shadow(h), &window)
                .map(|g| category_rows(&run.name, h, &shade_areas(&g), base_areas.get(&h)));
            r.record_all(format!("{}_{h}", run.name), rows)?;
        }
        Ok(r)
    })?;
    report.merge(batch);
    info!(rows = report.processed.len(), skipped = report.skipped.len(), "shade statistics");
    Ok(report)
}

// ── Continuous layer statistics ──────────────────────────────────────────────

/// Summary of one continuous grid (Tmrt, UTCI) of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStat {
    pub run: String,
    pub layer: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub range: f64,
    pub baseline_mean_diff: Option<f64>,
}

fn layer_stat(run: &str, kind: OutputKind, grid: &Grid, base_mean: Option<f64>) -> Result<LayerStat> {
    let s = summarize(grid.valid_values().map(f64::from))
        .ok_or_else(|| Error::Raster(format!("{run} {kind}: no valid cells in window")))?;
    Ok(LayerStat {
        run: run.to_string(),
        layer: kind.to_string(),
        count: s.count,
        min: s.min,
        max: s.max,
        mean: s.mean,
        median: s.median,
        std: s.std,
        range: s.range,
        baseline_mean_diff: base_mean.map(|b| s.mean - b),
    })
}

/// Descriptive statistics of `kinds` for every run.
pub fn layer_statistics(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    kinds: &[OutputKind],
    opts: &StatsOptions,
    cancel: &CancelToken,
) -> Result<BatchReport<LayerStat>> {
    let shared = shared_window(store, set, opts.baseline.as_deref(), kinds, opts.edge_buffer)?;

    let mut base_means: BTreeMap<OutputKind, f64> = BTreeMap::new();
    if let Some((window, base)) = &shared {
        for &k in kinds {
            if let Some(s) = load_cropped(store, base, k, window)
                .ok()
                .and_then(|g| summarize(g.valid_values().map(f64::from)))
            {
                base_means.insert(k, s.mean);
            }
        }
    }

    let mut report = BatchReport::default();
    let (runs, windows) = run_windows(store, set, shared.map(|(w, _)| w), kinds, opts.edge_buffer, &mut report)?;
    let batch = for_each_run(&runs, cancel, |run| {
        let window = windows[run.name.as_str()];
        let mut r = BatchReport::default();
        for &k in kinds {
            let stat = load_cropped(store, run, k, &window)
                .and_then(|g| layer_stat(&run.name, k, &g, base_means.get(&k).copied()));
            r.record(format!("{}_{k}", run.name), stat)?;
        }
        Ok(r)
    })?;
    report.merge(batch);
    Ok(report)
}

// ── Differences against the baseline ─────────────────────────────────────────

/// `compare - base` where both are valid, nodata (base sentinel) elsewhere.
pub fn difference(compare: &Grid, base: &Grid) -> Result<Grid> {
    base.ensure_same_georef(compare, "difference")?;
    let mut out = base.empty_like();
    for (i, (&c, &b)) in compare.data.iter().zip(&base.data).enumerate() {
        if !compare.is_nodata_value(c) && !base.is_nodata_value(b) {
            out.data[i] = c - b;
        }
    }
    Ok(out)
}

/// Nearest-neighbour onto the baseline grid unless already aligned.
fn onto(grid: Grid, base: &Grid) -> Result<Grid> {
    let spec = GridSpec::of(base);
    if spec.matches(&grid) {
        Ok(grid)
    } else {
        resample(&grid, &spec, Resampling::Nearest)
    }
}

/// Baseline grids per hour, cropped to the baseline window.
fn baseline_grids(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    baseline: &str,
    layer: LayerKind,
    edge_buffer: f64,
) -> Result<(String, BTreeMap<u8, Grid>)> {
    let kinds: Vec<OutputKind> = set.naming.hours.iter().map(|&h| layer.at(h)).collect();
    let (window, base) = shared_window(store, set, Some(baseline), &kinds, edge_buffer)?
        .ok_or_else(|| Error::MissingBaseline(baseline.to_string()))?;
    let mut grids = BTreeMap::new();
    for &h in &set.naming.hours {
        match load_cropped(store, base, layer.at(h), &window) {
            Ok(g) => {
                grids.insert(h, g);
            }
            Err(e) if e.is_recoverable() => debug!(hour = h, error = %e, "baseline hour unavailable"),
            Err(e) => return Err(e),
        }
    }
    Ok((base.name.clone(), grids))
}

/// Baseline grid for `hour` or a recoverable error naming it.
fn base_at<'a>(grids: &'a BTreeMap<u8, Grid>, base_name: &str, kind: OutputKind) -> Result<&'a Grid> {
    kind.hour().and_then(|h| grids.get(&h)).ok_or_else(|| Error::MissingRunFile {
        run: base_name.to_string(),
        file: kind.to_string(),
    })
}

/// Output of one difference map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffOutput {
    pub run: String,
    pub hour: u8,
    pub path: String,
    pub valid_cells: usize,
    pub mean_difference: Option<f64>,
    pub min_difference: Option<f64>,
    pub max_difference: Option<f64>,
}

pub fn difference_path(out_root: &Path, run: &str, hour: u8) -> PathBuf {
    out_root.join(run).join(format!("difference_{hour:02}.tif"))
}

/// Write `<out_root>/<run>/difference_<HH>.tif` for every non-baseline run
/// and hour of `layer`.
pub fn difference_maps(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    layer: LayerKind,
    baseline: &str,
    edge_buffer: f64,
    out_root: &Path,
    cancel: &CancelToken,
) -> Result<BatchReport<DiffOutput>> {
    let (base_name, grids) = baseline_grids(store, set, baseline, layer, edge_buffer)?;
    let runs: Vec<&ScenarioRun> = set.others(&base_name).collect();
    let hours = set.naming.hours.clone();

    let report = for_each_run(&runs, cancel, |run| {
        let mut r = BatchReport::default();
        for &h in &hours {
            let kind = layer.at(h);
            let out = base_at(&grids, &base_name, kind).and_then(|base| {
                let compare = onto(store.read(run.path(kind)?)?, base)?;
                let diff = difference(&compare, base)?;
                let path = difference_path(out_root, &run.name, h);
                store.write(&diff, &path)?;
                let s = summarize(diff.valid_values().map(f64::from));
                Ok(DiffOutput {
                    run: run.name.clone(),
                    hour: h,
                    path: path.display().to_string(),
                    valid_cells: s.map_or(0, |s| s.count),
                    mean_difference: s.map(|s| s.mean),
                    min_difference: s.map(|s| s.min),
                    max_difference: s.map(|s| s.max),
                })
            });
            r.record(format!("{}_{h}", run.name), out)?;
        }
        Ok(r)
    })?;
    info!(written = report.processed.len(), skipped = report.skipped.len(), "difference maps");
    Ok(report)
}

/// Shade overlap with the baseline for one run and hour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadeChange {
    pub run: String,
    pub hour: u8,
    /// Shaded (building or tree) in both.
    pub shaded_both_m2: f64,
    /// Shaded in the run only.
    pub newly_shaded_m2: f64,
    /// Shaded in the baseline only.
    pub lost_shade_m2: f64,
    pub valid_cells: usize,
}

pub fn shade_change(compare: &Grid, base: &Grid) -> Result<(f64, f64, f64, usize)> {
    base.ensure_same_georef(compare, "shade change")?;
    let shaded = |v: f32| matches!(ShadeCategory::classify(v), Some(ShadeCategory::BuildingShade | ShadeCategory::TreeShade));
    let (mut both, mut new, mut lost, mut n) = (0usize, 0usize, 0usize, 0usize);
    for (&c, &b) in compare.data.iter().zip(&base.data) {
        if compare.is_nodata_value(c) || base.is_nodata_value(b) {
            continue;
        }
        n += 1;
        match (shaded(c), shaded(b)) {
            (true, true) => both += 1,
            (true, false) => new += 1,
            (false, true) => lost += 1,
            (false, false) => {}
        }
    }
    let cell = base.cell_area();
    Ok((both as f64 * cell, new as f64 * cell, lost as f64 * cell, n))
}

/// Shade overlap statistics of every non-baseline run.
pub fn shade_changes(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    baseline: &str,
    edge_buffer: f64,
    cancel: &CancelToken,
) -> Result<BatchReport<ShadeChange>> {
    let (base_name, grids) = baseline_grids(store, set, baseline, LayerKind::Shadow, edge_buffer)?;
    let runs: Vec<&ScenarioRun> = set.others(&base_name).collect();
    let hours = set.naming.hours.clone();

    for_each_run(&runs, cancel, |run| {
        let mut r = BatchReport::default();
        for &h in &hours {
            let kind = OutputKind::Shadow(h);
            let change = base_at(&grids, &base_name, kind).and_then(|base| {
                let compare = onto(store.read(run.path(kind)?)?, base)?;
                let (both, new, lost, n) = shade_change(&compare, base)?;
                Ok(ShadeChange {
                    run: run.name.clone(),
                    hour: h,
                    shaded_both_m2: both,
                    newly_shaded_m2: new,
                    lost_shade_m2: lost,
                    valid_cells: n,
                })
            });
            r.record(format!("{}_{h}", run.name), change)?;
        }
        Ok(r)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geo::{Crs, GeoTransform};
    use crate::grid::tests::metric_grid;
    use crate::io::GeoTiffStore;
    use crate::scenario::FileNaming;
    use approx::assert_abs_diff_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Raster store backed by a map, for batch tests without GeoTIFFs.
    #[derive(Default)]
    pub(crate) struct MemStore {
        pub grids: Mutex<HashMap<PathBuf, Grid>>,
    }

    impl MemStore {
        pub fn put(&self, path: PathBuf, grid: Grid) {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).unwrap();
            }
            std::fs::write(&path, b"").unwrap();
            self.grids.lock().unwrap().insert(path, grid);
        }

        pub fn get(&self, path: &Path) -> Option<Grid> {
            self.grids.lock().unwrap().get(path).cloned()
        }
    }

    impl RasterStore for MemStore {
        fn read(&self, path: &Path) -> Result<Grid> {
            self.get(path)
                .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string())))
        }

        fn write(&self, grid: &Grid, path: &Path) -> Result<()> {
            self.grids.lock().unwrap().insert(path.to_path_buf(), grid.clone());
            Ok(())
        }
    }

    /// 20x20 shadow grid, 1 m cells: left half building shade, a 4x4 tree
    /// block, the rest sun.
    fn shadow_grid(tree_offset: usize) -> Grid {
        let mut g = metric_grid(20, 20, 1.0);
        for r in 0..20 {
            for c in 0..10 {
                g.set(r, c, 0.0);
            }
        }
        for r in 8..12 {
            for c in (10 + tree_offset)..(14 + tree_offset) {
                g.set(r, c, 0.4);
            }
        }
        g
    }

    /// Root with runs `local` (baseline), `global` (tree block shifted by
    /// two cells) and `broken` (no 15:00 shadow).
    fn scenario_root(store: &MemStore) -> (tempfile::TempDir, ScenarioSet) {
        let tmp = tempfile::tempdir().unwrap();
        let naming = FileNaming::default();
        for (run, offset) in [("local", 0), ("global", 2), ("broken", 0)] {
            for &h in &naming.hours {
                if run == "broken" && h == 15 {
                    continue;
                }
                let dir = tmp.path().join(run);
                store.put(dir.join(naming.file_name(OutputKind::Shadow(h))), shadow_grid(offset));
                let tmrt = metric_grid(20, 20, 40.0 + offset as f32);
                store.put(dir.join(naming.file_name(OutputKind::Tmrt(h))), tmrt);
            }
        }
        let set = ScenarioSet::discover(tmp.path(), &naming).unwrap();
        (tmp, set)
    }

    #[test]
    fn classify_shade_values() {
        assert_eq!(ShadeCategory::classify(0.0), Some(ShadeCategory::BuildingShade));
        assert_eq!(ShadeCategory::classify(0.03), Some(ShadeCategory::TreeShade));
        assert_eq!(ShadeCategory::classify(1.0), Some(ShadeCategory::NoShade));
        assert_eq!(ShadeCategory::classify(1.5), None);
    }

    #[test]
    fn shade_areas_scale_with_cell_size() {
        let mut g = shadow_grid(0);
        g.transform = GeoTransform::north_up(0.0, 40.0, 2.0);
        let a = shade_areas(&g);
        assert_abs_diff_eq!(a.building_shade_m2, 200.0 * 4.0);
        assert_abs_diff_eq!(a.tree_shade_m2, 16.0 * 4.0);
        assert_abs_diff_eq!(a.no_shade_m2, 184.0 * 4.0);
        assert_abs_diff_eq!(a.total_m2, 1600.0);
    }

    #[test]
    fn statistics_cover_every_run_and_skip_missing_files() {
        let store = MemStore::default();
        let (_tmp, set) = scenario_root(&store);
        let opts = StatsOptions { edge_buffer: 2.0, baseline: Some("local".into()) };
        let report = shade_statistics(&store, &set, &opts, &CancelToken::new()).unwrap();
        // 3 runs x 3 hours x 3 categories, minus broken_15.
        assert_eq!(report.processed.len(), 24);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].unit, "broken_15");

        // 16x16 window: 8 building columns, tree block intact.
        let global_tree = report
            .processed
            .iter()
            .find(|s| s.run == "global" && s.hour == 12 && s.category == ShadeCategory::TreeShade)
            .unwrap();
        assert_abs_diff_eq!(global_tree.area_m2, 16.0);
        assert_abs_diff_eq!(global_tree.percent_of_aoi, 16.0 / 256.0 * 100.0);
        assert_eq!(global_tree.baseline_diff_m2, Some(0.0));
        let local_building = report
            .processed
            .iter()
            .find(|s| s.run == "local" && s.hour == 18 && s.category == ShadeCategory::BuildingShade)
            .unwrap();
        assert_abs_diff_eq!(local_building.area_m2, 128.0);
    }

    #[test]
    fn oversized_buffer_fails_before_any_run() {
        let store = MemStore::default();
        let (_tmp, set) = scenario_root(&store);
        let opts = StatsOptions { edge_buffer: 10.0, baseline: None };
        let err = shade_statistics(&store, &set, &opts, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidBuffer { .. }), "got {err}");
    }

    #[test]
    fn missing_baseline_is_fatal() {
        let store = MemStore::default();
        let (tmp, set) = scenario_root(&store);
        let opts = StatsOptions { edge_buffer: 2.0, baseline: Some("nope".into()) };
        assert!(matches!(
            shade_statistics(&store, &set, &opts, &CancelToken::new()),
            Err(Error::MissingBaseline(_))
        ));
        assert!(matches!(
            difference_maps(&store, &set, LayerKind::Shadow, "nope", 2.0, tmp.path(), &CancelToken::new()),
            Err(Error::MissingBaseline(_))
        ));
    }

    #[test]
    fn difference_maps_mirror_runs_without_baseline() {
        let store = MemStore::default();
        let (tmp, set) = scenario_root(&store);
        let out = tmp.path().join("diff");
        let report = difference_maps(&store, &set, LayerKind::Tmrt, "local", 2.0, &out, &CancelToken::new()).unwrap();
        assert_eq!(report.processed.len(), 5);
        assert_eq!(report.skipped.len(), 1);
        assert!(store.get(&difference_path(&out, "local", 12)).is_none());
        let d = store.get(&difference_path(&out, "global", 15)).unwrap();
        assert_eq!((d.width, d.height), (16, 16));
        assert!(d.valid_values().all(|v| v == 2.0));
        let row = report.processed.iter().find(|d| d.run == "global" && d.hour == 18).unwrap();
        assert_eq!(row.mean_difference, Some(2.0));
        assert!(row.path.ends_with("difference_18.tif"));
    }

    #[test]
    fn shade_change_counts_overlap_new_and_lost() {
        let store = MemStore::default();
        let (_tmp, set) = scenario_root(&store);
        let report = shade_changes(&store, &set, "local", 2.0, &CancelToken::new()).unwrap();
        let g = report.processed.iter().find(|c| c.run == "global" && c.hour == 12).unwrap();
        // Tree block shifted by 2 columns: 8 cells shared, 8 new, 8 lost, plus building shade shared.
        assert_abs_diff_eq!(g.shaded_both_m2, 128.0 + 8.0);
        assert_abs_diff_eq!(g.newly_shaded_m2, 8.0);
        assert_abs_diff_eq!(g.lost_shade_m2, 8.0);
        assert_eq!(g.valid_cells, 256);
    }

    #[test]
    fn layer_statistics_report_mean_offsets() {
        let store = MemStore::default();
        let (_tmp, set) = scenario_root(&store);
        let opts = StatsOptions { edge_buffer: 2.0, baseline: Some("local".into()) };
        let kinds = [OutputKind::Tmrt(12), OutputKind::Tmrt(15)];
        let report = layer_statistics(&store, &set, &kinds, &opts, &CancelToken::new()).unwrap();
        let g = report.processed.iter().find(|s| s.run == "global" && s.layer == "tmrt_12").unwrap();
        assert_eq!(g.count, 256);
        assert_abs_diff_eq!(g.mean, 42.0);
        assert_eq!(g.baseline_mean_diff, Some(2.0));
        assert_eq!(report.skipped.len(), 1, "broken has no 15:00 Tmrt");
    }

    #[test]
    fn difference_rejects_misaligned_grids() {
        let a = metric_grid(3, 3, 1.0);
        let mut b = metric_grid(3, 3, 1.0);
        b.crs = Crs::Epsg(4326);
        assert!(matches!(difference(&a, &b), Err(Error::IncompatibleGrid(_))));
    }

    #[test]
    fn compared_grid_is_resampled_onto_baseline() {
        let base = metric_grid(4, 4, 1.0);
        let mut shifted = Grid::new(6, 6, GeoTransform::north_up(-1.0, 5.0, 1.0), Crs::Epsg(28992), -9999.0, 3.0);
        shifted.set(0, 0, 0.0);
        let aligned = onto(shifted, &base).unwrap();
        let d = difference(&aligned, &base).unwrap();
        assert!(d.valid_values().all(|v| v == 2.0));
    }

    #[test]
    fn geotiff_store_roundtrips_through_difference_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = difference_path(tmp.path(), "global", 12);
        let g = metric_grid(3, 2, 1.5);
        GeoTiffStore.write(&g, &path).unwrap();
        assert!(path.ends_with("global/difference_12.tif"));
        assert_eq!(GeoTiffStore.read(&path).unwrap().data, g.data);
    }
}
