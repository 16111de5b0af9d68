//! Descriptive statistics over cell populations.
//! Accumulation is in f64; grids can hold tens of millions of cells.

use serde::Serialize;

/// Summary of a set of finite values. Standard deviation is the
/// population form (divide by n).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub range: f64,
}

/// Summary of the finite values in `values`; `None` when there are none.
pub fn summarize<I: IntoIterator<Item = f64>>(values: I) -> Option<Summary> {
    let mut v: Vec<f64> = values.into_iter().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    let std = (v.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
    let (min, max) = (v[0], v[v.len() - 1]);
    Some(Summary {
        count: v.len(),
        min,
        max,
        mean,
        median: percentile_sorted(&v, 50.0),
        std,
        range: max - min,
    })
}

/// Linearly interpolated percentile (`p` in 0..=100) of sorted values.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let t = rank - lo as f64;
            sorted[lo] * (1.0 - t) + sorted[hi] * t
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|&v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}
