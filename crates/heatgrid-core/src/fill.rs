//! Inverse-distance-weighted gap filling.
//!
//! Every nodata cell takes the weighted mean of its `neighbours` nearest
//! valid cells, weight = 1 / d^power with d in cell units. Valid cells are
//! copied through untouched, so a grid without holes comes back identical.

#[cfg(feature = "threading")]
use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::grid::Grid;

pub const DEFAULT_IDW_NEIGHBOURS: usize = 8;
pub const DEFAULT_IDW_POWER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillParams {
    /// Valid cells consulted per hole.
    pub neighbours: usize,
    pub power: f64,
    /// Holes farther than this (cells) from any valid cell stay nodata.
    pub max_distance: Option<f64>,
}

impl Default for FillParams {
    fn default() -> Self {
        Self {
            neighbours: DEFAULT_IDW_NEIGHBOURS,
            power: DEFAULT_IDW_POWER,
            max_distance: None,
        }
    }
}

impl FillParams {
    pub fn validate(&self) -> Result<()> {
        if self.neighbours == 0 {
            return Err(Error::InvalidParameter("IDW neighbours must be >= 1".into()));
        }
        if !(self.power > 0.0) {
            return Err(Error::InvalidParameter(format!("IDW power must be > 0, got {}", self.power)));
        }
        if let Some(d) = self.max_distance {
            if !(d > 0.0) {
                return Err(Error::InvalidParameter(format!("IDW max_distance must be > 0, got {d}")));
            }
        }
        Ok(())
    }
}

type ValidCell = GeomWithData<[f64; 2], f32>;

/// Fill the nodata cells of `grid`. Returns a new grid; `grid` is untouched.
pub fn fill_gaps(grid: &Grid, params: &FillParams) -> Result<Grid> {
    params.validate()?;

    let mut out = grid.clone();
    let holes: Vec<(usize, usize)> = (0..grid.height)
        .flat_map(|r| (0..grid.width).map(move |c| (r, c)))
        .filter(|&(r, c)| !grid.is_valid(r, c))
        .collect();
    if holes.is_empty() {
        return Ok(out);
    }

    let valid: Vec<ValidCell> = (0..grid.height)
        .flat_map(|r| (0..grid.width).map(move |c| (r, c)))
        .filter_map(|(r, c)| grid.value(r, c).map(|v| ValidCell::new([c as f64, r as f64], v)))
        .collect();
    if valid.is_empty() {
        warn!(cells = holes.len(), "grid has no valid cells; nothing to interpolate from");
        return Ok(out);
    }
    let tree = RTree::bulk_load(valid);

    let interpolate = |&(r, c): &(usize, usize)| idw_at(&tree, [c as f64, r as f64], params);

    #[cfg(feature = "threading")]
    let filled: Vec<Option<f32>> = holes.par_iter().map(interpolate).collect();
    #[cfg(not(feature = "threading"))]
    let filled: Vec<Option<f32>> = holes.iter().map(interpolate).collect();

    let mut left = 0usize;
    for (&(r, c), v) in holes.iter().zip(filled) {
        match v {
            Some(v) => out.set(r, c, v),
            None => left += 1,
        }
    }
    debug!(holes = holes.len(), unfilled = left, "IDW fill");
    Ok(out)
}

fn idw_at(tree: &RTree<ValidCell>, at: [f64; 2], params: &FillParams) -> Option<f32> {
    let max_d2 = params.max_distance.map(|d| d * d);
    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for n in tree.nearest_neighbor_iter(&at).take(params.neighbours) {
        let p = n.geom();
        let d2 = (p[0] - at[0]).powi(2) + (p[1] - at[1]).powi(2);
        if max_d2.is_some_and(|m| d2 > m) {
            break;
        }
        if d2 == 0.0 {
            return Some(n.data);
        }
        let w = d2.sqrt().powf(-params.power);
        num += w * n.data as f64;
        den += w;
    }
    (den > 0.0).then(|| (num / den) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::tests::metric_grid;
    use approx::assert_relative_eq;

    #[test]
    fn grid_without_holes_is_returned_unchanged() {
        let mut g = metric_grid(6, 5, 0.0);
        for (i, v) in g.data.iter_mut().enumerate() {
            *v = (i as f32).sin() * 10.0;
        }
        let filled = fill_gaps(&g, &FillParams::default()).unwrap();
        assert_eq!(filled, g);
    }

    #[test]
    fn constant_surface_fills_with_the_constant() {
        let mut g = metric_grid(10, 10, 42.0);
        for (r, c) in [(4, 4), (4, 5), (5, 4), (5, 5)] {
            g.set(r, c, g.nodata);
        }
        let filled = fill_gaps(&g, &FillParams::default()).unwrap();
        assert_eq!(filled.nodata_count(), 0);
        for v in &filled.data {
            assert_relative_eq!(*v, 42.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn hole_between_two_values_is_weighted_by_distance() {
        // [10, nd, nd, 40]: the first hole is closer to 10.
        let mut g = metric_grid(4, 1, 0.0);
        g.data = vec![10.0, g.nodata, g.nodata, 40.0];
        let params = FillParams { neighbours: 2, ..Default::default() };
        let filled = fill_gaps(&g, &params).unwrap();
        // d = 1 and 2, p = 2: (10*1 + 40*0.25) / 1.25 = 16
        assert_relative_eq!(filled.get(0, 1), 16.0, epsilon = 1e-4);
        assert_relative_eq!(filled.get(0, 2), 34.0, epsilon = 1e-4);
        assert_eq!(filled.get(0, 0), 10.0);
        assert_eq!(filled.get(0, 3), 40.0);
    }

    #[test]
    fn max_distance_leaves_far_holes_empty() {
        let mut g = metric_grid(9, 1, -9999.0);
        g.set(0, 0, 5.0);
        let params = FillParams { max_distance: Some(2.0), ..Default::default() };
        let filled = fill_gaps(&g, &params).unwrap();
        assert_eq!(filled.get(0, 1), 5.0);
        assert_eq!(filled.get(0, 2), 5.0);
        assert!(!filled.is_valid(0, 3));
        assert!(!g.is_valid(0, 1), "input must not be modified");
    }

    #[test]
    fn nan_holes_are_filled_too() {
        let mut g = metric_grid(3, 1, 7.0);
        g.set(0, 1, f32::NAN);
        let filled = fill_gaps(&g, &FillParams::default()).unwrap();
        assert_relative_eq!(filled.get(0, 1), 7.0);
    }

    #[test]
    fn all_nodata_grid_stays_empty() {
        let g = metric_grid(3, 3, -9999.0);
        let filled = fill_gaps(&g, &FillParams::default()).unwrap();
        assert_eq!(filled.valid_count(), 0);
    }

    #[test]
    fn zero_neighbours_is_rejected() {
        let g = metric_grid(2, 2, 1.0);
        let params = FillParams { neighbours: 0, ..Default::default() };
        assert!(matches!(fill_gaps(&g, &params), Err(Error::InvalidParameter(_))));
    }
}
