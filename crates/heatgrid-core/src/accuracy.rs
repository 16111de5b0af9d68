//! Accuracy of one source against a reference.
//!
//! Categorical grids (shade classes) get a confusion matrix, overall and
//! per-class accuracy and Cohen's kappa. Continuous grids (UTCI, Tmrt,
//! building height) get MAE, RMSE and R² with the reference as truth,
//! unfiltered and after z-score outlier rejection. Only cells valid in both
//! sources take part; the valid count and coverage are always reported.
//!
//! Both grids are first brought onto a common validation window: their
//! overlap, in the reference's georeferencing, minus a margin of cells on
//! every side.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::align::{overlap_bounds, resample, GridSpec, Resampling};
use crate::composite::height_above_ground;
use crate::config::DEFAULT_ZSCORE_THRESHOLD;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::stats::{mean, std_dev};
use crate::stats::{percentile_sorted, summarize, Summary};

pub const DEFAULT_SHADE_TOLERANCE: f64 = 0.0005;
/// Cells trimmed from each edge of the validation window.
pub const DEFAULT_MARGIN_CELLS: usize = 10;

// ── Shade classes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadeClass {
    pub name: String,
    /// Shadow value this class is recognised by.
    pub value: f64,
}

/// Ordered class table; a class's position is its label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadeClassTable {
    pub classes: Vec<ShadeClass>,
    pub tolerance: f64,
}

impl Default for ShadeClassTable {
    fn default() -> Self {
        let class = |name: &str, value| ShadeClass { name: name.to_string(), value };
        Self {
            classes: vec![class("building_shade", 0.0), class("tree_shade", 0.03), class("no_shade", 1.0)],
            tolerance: DEFAULT_SHADE_TOLERANCE,
        }
    }
}

impl ShadeClassTable {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    /// Label of the first class within tolerance of `v`.
    pub fn classify(&self, v: f32) -> Option<usize> {
        let v = f64::from(v);
        self.classes.iter().position(|c| (v - c.value).abs() <= self.tolerance)
    }

    /// Labels per cell; nodata and unrecognised values are `None`.
    pub fn classify_grid(&self, grid: &Grid) -> Vec<Option<usize>> {
        grid.data
            .iter()
            .map(|&v| if grid.is_nodata_value(v) { None } else { self.classify(v) })
            .collect()
    }

    /// Labels of classes that are shade of any kind (value below full sun).
    fn shade_labels(&self) -> Vec<usize> {
        (0..self.classes.len()).filter(|&i| self.classes[i].value < 1.0).collect()
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub zscore_threshold: f64,
    pub margin_cells: usize,
    pub shade_classes: ShadeClassTable,
    /// Drop pairs whose absolute error exceeds this before any metric.
    pub max_abs_error: Option<f64>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            zscore_threshold: DEFAULT_ZSCORE_THRESHOLD,
            margin_cells: DEFAULT_MARGIN_CELLS,
            shade_classes: ShadeClassTable::default(),
            max_abs_error: None,
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.zscore_threshold > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "z-score threshold must be > 0, got {}",
                self.zscore_threshold
            )));
        }
        if self.shade_classes.is_empty() {
            return Err(Error::InvalidParameter("shade class table is empty".into()));
        }
        if !(self.shade_classes.tolerance >= 0.0) {
            return Err(Error::InvalidParameter("shade class tolerance must be >= 0".into()));
        }
        if let Some(cap) = self.max_abs_error {
            if !(cap > 0.0) {
                return Err(Error::InvalidParameter(format!("max_abs_error must be > 0, got {cap}")));
            }
        }
        Ok(())
    }
}

// ── Validation windows ───────────────────────────────────────────────────────

/// Bring `others` onto the reference's validation window. Grids already
/// sharing the reference's georeferencing are only trimmed; anything else
/// is cropped to the common overlap and resampled with its method.
pub fn validation_stack(reference: &Grid, others: &[(&Grid, Resampling)], margin: usize) -> Result<(Grid, Vec<Grid>)> {
    if others.iter().all(|(g, _)| reference.same_georef(g)) {
        let r = reference.shrink_cells(margin)?;
        let rest = others.iter().map(|(g, _)| g.shrink_cells(margin)).collect::<Result<Vec<_>>>()?;
        return Ok((r, rest));
    }

    let mut window = reference.bounds();
    for (g, _) in others {
        let ob = overlap_bounds(reference, g)?;
        window = window
            .intersection(&ob)
            .ok_or_else(|| Error::NoOverlap { subject: "validation inputs".into() })?;
    }
    let r = reference.crop_to_bounds(&window)?.shrink_cells(margin)?;
    let spec = GridSpec::of(&r);
    let rest = others
        .iter()
        .map(|(g, method)| if spec.matches(g) { Ok((*g).clone()) } else { resample(g, &spec, *method) })
        .collect::<Result<Vec<_>>>()?;
    debug!(width = r.width, height = r.height, "validation window");
    Ok((r, rest))
}

pub fn validation_pair(reference: &Grid, prediction: &Grid, margin: usize, method: Resampling) -> Result<(Grid, Grid)> {
    let (r, mut rest) = validation_stack(reference, &[(prediction, method)], margin)?;
    let p = rest.pop().ok_or_else(|| Error::InvalidParameter("empty validation stack".into()))?;
    Ok((r, p))
}

// ── Confusion matrix ─────────────────────────────────────────────────────────

/// Rows are reference classes, columns predicted classes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<String>,
    pub counts: Vec<Vec<u64>>,
}

/// Per-class accuracy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassAccuracy {
    pub class: String,
    /// Correct / predicted as this class (commission).
    pub users_accuracy: Option<f64>,
    /// Correct / reference of this class (omission).
    pub producers_accuracy: Option<f64>,
    /// Share of reference cells in this class.
    pub weight: f64,
    pub weighted_users_accuracy: Option<f64>,
    pub weighted_producers_accuracy: Option<f64>,
}

impl ConfusionMatrix {
    /// Tally cells labelled in both sequences.
    pub fn from_labels(labels: Vec<String>, reference: &[Option<usize>], prediction: &[Option<usize>]) -> Self {
        let n = labels.len();
        let mut counts = vec![vec![0u64; n]; n];
        for (r, p) in reference.iter().zip(prediction) {
            if let (Some(r), Some(p)) = (r, p) {
                if *r < n && *p < n {
                    counts[*r][*p] += 1;
                }
            }
        }
        Self { labels, counts }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    fn row_total(&self, i: usize) -> u64 {
        self.counts[i].iter().sum()
    }

    fn col_total(&self, j: usize) -> u64 {
        self.counts.iter().map(|row| row[j]).sum()
    }

    fn diagonal(&self) -> u64 {
        (0..self.labels.len()).map(|i| self.counts[i][i]).sum()
    }

    pub fn is_diagonal(&self) -> bool {
        self.counts
            .iter()
            .enumerate()
            .all(|(i, row)| row.iter().enumerate().all(|(j, &c)| i == j || c == 0))
    }

    pub fn overall_accuracy(&self) -> Option<f64> {
        let t = self.total();
        (t > 0).then(|| self.diagonal() as f64 / t as f64)
    }

    /// Cohen's kappa. Perfect agreement is 1 even when a single class
    /// makes chance agreement 1 as well.
    pub fn kappa(&self) -> Option<f64> {
        let t = self.total() as f64;
        if t == 0.0 {
            return None;
        }
        let po = self.diagonal() as f64 / t;
        let pe: f64 = (0..self.labels.len())
            .map(|i| self.row_total(i) as f64 * self.col_total(i) as f64)
            .sum::<f64>()
            / (t * t);
        if (1.0 - pe).abs() < f64::EPSILON {
            return Some(if po == 1.0 { 1.0 } else { 0.0 });
        }
        Some((po - pe) / (1.0 - pe))
    }

    pub fn class_accuracy(&self) -> Vec<ClassAccuracy> {
        let total = self.total();
        (0..self.labels.len())
            .map(|i| {
                let (row, col, hit) = (self.row_total(i), self.col_total(i), self.counts[i][i] as f64);
                let users = (col > 0).then(|| hit / col as f64);
                let producers = (row > 0).then(|| hit / row as f64);
                let weight = if total > 0 { row as f64 / total as f64 } else { 0.0 };
                ClassAccuracy {
                    class: self.labels[i].clone(),
                    users_accuracy: users,
                    producers_accuracy: producers,
                    weight,
                    weighted_users_accuracy: users.map(|u| u * weight),
                    weighted_producers_accuracy: producers.map(|p| p * weight),
                }
            })
            .collect()
    }
}

/// Categorical agreement of two shade grids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadeAccuracy {
    pub matrix: ConfusionMatrix,
    pub overall_accuracy: Option<f64>,
    pub kappa: Option<f64>,
    pub classes: Vec<ClassAccuracy>,
    pub valid_cells: u64,
    pub window_cells: usize,
}

pub fn shade_accuracy(reference: &Grid, prediction: &Grid, config: &ValidationConfig) -> Result<ShadeAccuracy> {
    let (r, p) = validation_pair(reference, prediction, config.margin_cells, Resampling::Nearest)?;
    let table = &config.shade_classes;
    let matrix = ConfusionMatrix::from_labels(table.names(), &table.classify_grid(&r), &table.classify_grid(&p));
    let valid_cells = matrix.total();
    debug!(valid_cells, window = r.data.len(), "shade confusion matrix");
    Ok(ShadeAccuracy {
        overall_accuracy: matrix.overall_accuracy(),
        kappa: matrix.kappa(),
        classes: matrix.class_accuracy(),
        valid_cells,
        window_cells: r.data.len(),
        matrix,
    })
}

// ── Continuous metrics ───────────────────────────────────────────────────────

/// Error metrics of `prediction` against `reference`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorMetrics {
    pub n: usize,
    /// Valid pairs / cells in the window.
    pub coverage: f64,
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    /// Mean of prediction - reference.
    pub mean_error: f64,
    pub error_std: f64,
    pub p90_abs_error: f64,
}

/// `None` when there are no pairs. R² of a constant reference is 1 for a
/// perfect prediction and 0 otherwise.
pub fn error_metrics(pairs: &[(f64, f64)], window_cells: usize) -> Option<ErrorMetrics> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;
    let errors: Vec<f64> = pairs.iter().map(|&(r, p)| p - r).collect();
    let mean_error = mean(&errors);
    let error_std = std_dev(&errors);
    let mut abs: Vec<f64> = errors.iter().map(|e| e.abs()).collect();
    abs.sort_by(f64::total_cmp);
    let mae = abs.iter().sum::<f64>() / n;
    let ss_res: f64 = errors.iter().map(|e| e * e).sum();
    let ref_mean = pairs.iter().map(|&(r, _)| r).sum::<f64>() / n;
    let ss_tot: f64 = pairs.iter().map(|&(r, _)| (r - ref_mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };
    Some(ErrorMetrics {
        n: pairs.len(),
        coverage: if window_cells > 0 { pairs.len() as f64 / window_cells as f64 } else { 0.0 },
        mae,
        rmse: (ss_res / n).sqrt(),
        r2,
        mean_error,
        error_std,
        p90_abs_error: percentile_sorted(&abs, 90.0),
    })
}

/// Pairs whose error lies within `threshold` standard deviations of the
/// mean error. A zero spread keeps everything.
pub fn zscore_filter(pairs: &[(f64, f64)], threshold: f64) -> Vec<(f64, f64)> {
    if pairs.is_empty() {
        return Vec::new();
    }
    let errors: Vec<f64> = pairs.iter().map(|&(r, p)| p - r).collect();
    let (m, sd) = (mean(&errors), std_dev(&errors));
    if sd == 0.0 {
        return pairs.to_vec();
    }
    pairs
        .iter()
        .copied()
        .filter(|&(r, p)| ((p - r - m) / sd).abs() <= threshold)
        .collect()
}

/// (reference, prediction) for cells valid in both, finite, and within
/// the optional error cap.
pub fn valid_pairs(reference: &Grid, prediction: &Grid, max_abs_error: Option<f64>) -> Result<Vec<(f64, f64)>> {
    reference.ensure_same_georef(prediction, "paired validation")?;
    Ok(reference
        .data
        .iter()
        .zip(&prediction.data)
        .filter(|&(&r, &p)| !reference.is_nodata_value(r) && !prediction.is_nodata_value(p))
        .map(|(&r, &p)| (f64::from(r), f64::from(p)))
        .filter(|(r, p)| r.is_finite() && p.is_finite())
        .filter(|(r, p)| max_abs_error.map_or(true, |cap| (p - r).abs() <= cap))
        .collect())
}

/// Metrics side by side with and without outlier rejection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuousValidation {
    pub unfiltered: ErrorMetrics,
    pub filtered: ErrorMetrics,
    pub outliers_removed: usize,
}

/// One CSV row per variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRow {
    pub unit: String,
    pub variant: &'static str,
    pub n: usize,
    pub coverage: f64,
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub mean_error: f64,
    pub error_std: f64,
    pub p90_abs_error: f64,
}

impl ContinuousValidation {
    pub fn rows(&self, unit: &str) -> Vec<MetricsRow> {
        [("unfiltered", &self.unfiltered), ("zscore_filtered", &self.filtered)]
            .into_iter()
            .map(|(variant, m)| MetricsRow {
                unit: unit.to_string(),
                variant,
                n: m.n,
                coverage: m.coverage,
                mae: m.mae,
                rmse: m.rmse,
                r2: m.r2,
                mean_error: m.mean_error,
                error_std: m.error_std,
                p90_abs_error: m.p90_abs_error,
            })
            .collect()
    }
}

fn validate_pairs(pairs: &[(f64, f64)], window_cells: usize, config: &ValidationConfig) -> Result<ContinuousValidation> {
    let unfiltered = error_metrics(pairs, window_cells)
        .ok_or_else(|| Error::NoOverlap { subject: "valid cells of the compared grids".into() })?;
    let kept = zscore_filter(pairs, config.zscore_threshold);
    let filtered = error_metrics(&kept, window_cells).unwrap_or(unfiltered);
    Ok(ContinuousValidation {
        unfiltered,
        filtered,
        outliers_removed: pairs.len() - kept.len(),
    })
}

/// Continuous validation of two grids (bilinear onto the reference).
pub fn continuous_validation(reference: &Grid, prediction: &Grid, config: &ValidationConfig) -> Result<ContinuousValidation> {
    let (r, p) = validation_pair(reference, prediction, config.margin_cells, Resampling::Bilinear)?;
    let pairs = valid_pairs(&r, &p, config.max_abs_error)?;
    validate_pairs(&pairs, r.data.len(), config)
}

// ── Masked statistics ────────────────────────────────────────────────────────

/// Distribution of each source inside one shade mask. Each source is
/// masked by its own shade grid, so the populations need not be paired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskedStat {
    pub mask: String,
    pub reference_count: usize,
    pub reference_mean: f64,
    pub reference_median: f64,
    pub reference_std: f64,
    pub reference_min: f64,
    pub reference_max: f64,
    pub prediction_count: usize,
    pub prediction_mean: f64,
    pub prediction_median: f64,
    pub prediction_std: f64,
    pub prediction_min: f64,
    pub prediction_max: f64,
    /// prediction mean - reference mean.
    pub mean_error: f64,
}

fn masked_stat(mask: &str, r: Summary, p: Summary) -> MaskedStat {
    MaskedStat {
        mask: mask.to_string(),
        reference_count: r.count,
        reference_mean: r.mean,
        reference_median: r.median,
        reference_std: r.std,
        reference_min: r.min,
        reference_max: r.max,
        prediction_count: p.count,
        prediction_mean: p.mean,
        prediction_median: p.median,
        prediction_std: p.std,
        prediction_min: p.min,
        prediction_max: p.max,
        mean_error: p.mean - r.mean,
    }
}

/// Statistics of a continuous layer over the whole window, all shade,
/// and each shade class. Masks empty in either source are left out.
pub fn masked_statistics(
    reference: &Grid,
    prediction: &Grid,
    reference_shade: &Grid,
    prediction_shade: &Grid,
    config: &ValidationConfig,
) -> Result<Vec<MaskedStat>> {
    let (r, rest) = validation_stack(
        reference,
        &[
            (prediction, Resampling::Bilinear),
            (reference_shade, Resampling::Nearest),
            (prediction_shade, Resampling::Nearest),
        ],
        config.margin_cells,
    )?;
    let [p, rs, ps]: [Grid; 3] = rest
        .try_into()
        .map_err(|_| Error::InvalidParameter("validation stack size".into()))?;
    let table = &config.shade_classes;
    let (r_cls, p_cls) = (table.classify_grid(&rs), table.classify_grid(&ps));
    let both_valid: Vec<bool> = r
        .data
        .iter()
        .zip(&p.data)
        .map(|(&a, &b)| !r.is_nodata_value(a) && !p.is_nodata_value(b))
        .collect();

    let mut masks: Vec<(String, Vec<usize>)> = vec![("shade".to_string(), table.shade_labels())];
    masks.extend(table.classes.iter().enumerate().map(|(i, c)| (c.name.clone(), vec![i])));

    let mut out = Vec::new();
    let all = |g: &Grid| {
        summarize(
            g.data
                .iter()
                .zip(&both_valid)
                .filter(|(_, ok)| **ok)
                .map(|(&v, _)| f64::from(v)),
        )
    };
    if let (Some(rs), Some(ps)) = (all(&r), all(&p)) {
        out.push(masked_stat("whole_area", rs, ps));
    }
    for (name, labels) in masks {
        let pick = |g: &Grid, cls: &[Option<usize>]| {
            summarize(
                g.data
                    .iter()
                    .zip(cls)
                    .zip(&both_valid)
                    .filter(|((_, c), ok)| **ok && c.is_some_and(|l| labels.contains(&l)))
                    .map(|((&v, _), _)| f64::from(v)),
            )
        };
        match (pick(&r, &r_cls), pick(&p, &p_cls)) {
            (Some(rs), Some(ps)) => out.push(masked_stat(&name, rs, ps)),
            _ => debug!(mask = %name, "mask empty in one source"),
        }
    }
    Ok(out)
}

// ── Building height ──────────────────────────────────────────────────────────

/// Height above terrain: DSM - DEM, the DEM resampled onto the DSM.
pub fn building_heights(dsm: &Grid, dem: &Grid) -> Result<Grid> {
    let spec = GridSpec::of(dsm);
    if spec.matches(dem) {
        return height_above_ground(dsm, dem);
    }
    height_above_ground(dsm, &resample(dem, &spec, Resampling::Bilinear)?)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildingHeightValidation {
    pub metrics: ContinuousValidation,
    pub reference_valid_pct: f64,
    pub prediction_valid_pct: f64,
}

/// Compare building heights derived from two DSM/DEM pairs.
pub fn building_height_validation(
    reference_dsm: &Grid,
    reference_dem: &Grid,
    prediction_dsm: &Grid,
    prediction_dem: &Grid,
    config: &ValidationConfig,
) -> Result<BuildingHeightValidation> {
    let reference = building_heights(reference_dsm, reference_dem)?;
    let prediction = building_heights(prediction_dsm, prediction_dem)?;
    let (r, p) = validation_pair(&reference, &prediction, config.margin_cells, Resampling::Bilinear)?;
    let pct = |g: &Grid| g.valid_count() as f64 / g.data.len().max(1) as f64 * 100.0;
    let pairs = valid_pairs(&r, &p, config.max_abs_error)?;
    Ok(BuildingHeightValidation {
        metrics: validate_pairs(&pairs, r.data.len(), config)?,
        reference_valid_pct: pct(&r),
        prediction_valid_pct: pct(&p),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{Crs, GeoTransform};
    use crate::grid::tests::metric_grid;
    use approx::assert_abs_diff_eq;

    fn no_margin() -> ValidationConfig {
        ValidationConfig { margin_cells: 0, ..Default::default() }
    }

    fn shade_fixture() -> Grid {
        let mut g = metric_grid(6, 6, 1.0);
        for c in 0..6 {
            g.set(0, c, 0.0);
            g.set(1, c, 0.03);
        }
        g.set(5, 5, 0.5);
        g
    }

    #[test]
    fn classify_with_tolerance() {
        let t = ShadeClassTable::default();
        assert_eq!(t.classify(0.0), Some(0));
        assert_eq!(t.classify(0.0304), Some(1));
        assert_eq!(t.classify(0.031), None);
        assert_eq!(t.classify(0.9996), Some(2));
        assert_eq!(t.classify(0.5), None);
    }

    #[test]
    fn identical_inputs_agree_perfectly() {
        let g = shade_fixture();
        let acc = shade_accuracy(&g, &g, &no_margin()).unwrap();
        assert!(acc.matrix.is_diagonal());
        assert_eq!(acc.kappa, Some(1.0));
        assert_eq!(acc.overall_accuracy, Some(1.0));
        assert_eq!(acc.valid_cells, 35, "0.5 is outside every class");

        let mut t = metric_grid(6, 6, 0.0);
        for (i, v) in t.data.iter_mut().enumerate() {
            *v = 20.0 + i as f32 * 0.25;
        }
        let m = continuous_validation(&t, &t, &no_margin()).unwrap();
        assert_eq!(m.unfiltered.mae, 0.0);
        assert_eq!(m.unfiltered.rmse, 0.0);
        assert_eq!(m.unfiltered.r2, 1.0);
        assert_eq!(m.unfiltered.n, 36);
        assert_eq!(m.unfiltered.coverage, 1.0);
    }

    #[test]
    fn single_class_agreement_is_still_kappa_one() {
        let g = metric_grid(4, 4, 1.0);
        let acc = shade_accuracy(&g, &g, &no_margin()).unwrap();
        assert_eq!(acc.kappa, Some(1.0));
    }

    #[test]
    fn kappa_and_class_accuracy_by_hand() {
        let cm = ConfusionMatrix {
            labels: vec!["a".into(), "b".into()],
            counts: vec![vec![20, 5], vec![10, 15]],
        };
        assert_abs_diff_eq!(cm.overall_accuracy().unwrap(), 0.7);
        assert_abs_diff_eq!(cm.kappa().unwrap(), 0.4, epsilon = 1e-12);
        let a = &cm.class_accuracy()[0];
        assert_abs_diff_eq!(a.users_accuracy.unwrap(), 20.0 / 30.0);
        assert_abs_diff_eq!(a.producers_accuracy.unwrap(), 0.8);
        assert_abs_diff_eq!(a.weight, 0.5);
        assert_abs_diff_eq!(a.weighted_producers_accuracy.unwrap(), 0.4);
    }

    #[test]
    fn empty_class_has_no_accuracy() {
        let cm = ConfusionMatrix::from_labels(
            vec!["x".into(), "y".into(), "z".into()],
            &[Some(0), Some(0), None],
            &[Some(0), Some(1), Some(2)],
        );
        assert_eq!(cm.total(), 2);
        let z = &cm.class_accuracy()[2];
        assert_eq!(z.users_accuracy, None);
        assert_eq!(z.producers_accuracy, None);
        assert_eq!(z.weight, 0.0);
    }

    #[test]
    fn zscore_filter_drops_the_outlier_only() {
        let pairs: Vec<(f64, f64)> = (0..20)
            .map(|i| {
                let r = i as f64;
                let e = if i == 19 { 100.0 } else if i % 2 == 0 { 0.5 } else { -0.5 };
                (r, r + e)
            })
            .collect();
        let kept = zscore_filter(&pairs, 3.0);
        assert_eq!(kept.len(), 19);
        let m = error_metrics(&kept, 20).unwrap();
        assert_abs_diff_eq!(m.mae, 0.5);
        assert_abs_diff_eq!(m.rmse, 0.5);
        assert_abs_diff_eq!(m.coverage, 0.95);
        let raw = error_metrics(&pairs, 20).unwrap();
        assert!(raw.rmse > 20.0);
        assert_abs_diff_eq!(raw.p90_abs_error, 0.5);
    }

    #[test]
    fn metrics_use_only_cells_valid_in_both() {
        let mut a = metric_grid(4, 1, 10.0);
        let mut b = metric_grid(4, 1, 12.0);
        a.set(0, 0, a.nodata);
        b.set(0, 1, f32::NAN);
        let v = continuous_validation(&a, &b, &no_margin()).unwrap();
        assert_eq!(v.unfiltered.n, 2);
        assert_abs_diff_eq!(v.unfiltered.coverage, 0.5);
        assert_abs_diff_eq!(v.unfiltered.mean_error, 2.0);
        assert_eq!(v.unfiltered.r2, 0.0);
        assert_eq!(v.rows("utci_12").len(), 2);
    }

    #[test]
    fn margin_trims_aligned_and_overlapping_windows() {
        let a = metric_grid(30, 30, 1.0);
        let (r, p) = validation_pair(&a, &a, DEFAULT_MARGIN_CELLS, Resampling::Nearest).unwrap();
        assert_eq!((r.width, r.height, p.width), (10, 10, 10));

        let shifted = Grid::new(30, 30, GeoTransform::north_up(5.0, 30.0, 1.0), Crs::Epsg(28992), -9999.0, 1.0);
        let (r, p) = validation_pair(&a, &shifted, DEFAULT_MARGIN_CELLS, Resampling::Nearest).unwrap();
        assert_eq!((r.width, r.height), (5, 10));
        assert!(r.same_georef(&p));
        assert_eq!(r.transform.origin_x, 15.0);
    }

    #[test]
    fn disjoint_grids_do_not_validate() {
        let a = metric_grid(30, 30, 1.0);
        let far = Grid::new(30, 30, GeoTransform::north_up(500.0, 30.0, 1.0), Crs::Epsg(28992), -9999.0, 1.0);
        assert!(matches!(
            continuous_validation(&a, &far, &ValidationConfig::default()),
            Err(Error::NoOverlap { .. })
        ));
    }

    #[test]
    fn building_height_from_surface_models() {
        let dem = metric_grid(5, 5, 2.0);
        let mut local_dsm = metric_grid(5, 5, 2.0);
        let mut global_dsm = metric_grid(5, 5, 2.0);
        local_dsm.set(2, 2, 14.0);
        global_dsm.set(2, 2, 11.0);
        global_dsm.set(0, 0, global_dsm.nodata);
        let h = building_heights(&local_dsm, &dem).unwrap();
        assert_eq!(h.get(2, 2), 12.0);
        assert_eq!(h.get(1, 1), 0.0);

        let v = building_height_validation(&local_dsm, &dem, &global_dsm, &dem, &no_margin()).unwrap();
        assert_eq!(v.metrics.unfiltered.n, 24);
        assert_abs_diff_eq!(v.metrics.unfiltered.mae, 3.0 / 24.0);
        assert_abs_diff_eq!(v.prediction_valid_pct, 96.0);
        assert_abs_diff_eq!(v.reference_valid_pct, 100.0);

        let capped = ValidationConfig { max_abs_error: Some(1.0), ..no_margin() };
        let v = building_height_validation(&local_dsm, &dem, &global_dsm, &dem, &capped).unwrap();
        assert_eq!(v.metrics.unfiltered.n, 23);
        assert_eq!(v.metrics.unfiltered.mae, 0.0);
    }

    #[test]
    fn masked_statistics_split_by_shade() {
        let shade = shade_fixture();
        let mut utci = metric_grid(6, 6, 40.0);
        for c in 0..6 {
            utci.set(0, c, 30.0);
            utci.set(1, c, 32.0);
        }
        let warmer = utci.map_valid(|v| v + 1.0);
        let stats = masked_statistics(&utci, &warmer, &shade, &shade, &no_margin()).unwrap();
        let names: Vec<&str> = stats.iter().map(|s| s.mask.as_str()).collect();
        assert_eq!(names, ["whole_area", "shade", "building_shade", "tree_shade", "no_shade"]);
        let b = &stats[2];
        assert_eq!(b.reference_count, 6);
        assert_abs_diff_eq!(b.reference_mean, 30.0);
        assert_abs_diff_eq!(b.mean_error, 1.0);
        assert_eq!(stats[1].reference_count, 12);
        assert_eq!(stats[4].reference_count, 23);
    }

    #[test]
    fn config_validation() {
        assert!(ValidationConfig::default().validate().is_ok());
        let bad = ValidationConfig { zscore_threshold: 0.0, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
