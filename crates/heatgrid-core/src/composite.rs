//! Cell-wise layer compositing on aligned grids.
//!
//! `overlay` and `stack` need identical georeferencing (anything else is an
//! alignment bug and fails with `IncompatibleGrid`). `mosaic` joins tiles
//! that share a CRS and resolution into their union extent.

use tracing::debug;

use crate::error::{Error, Result};
use crate::geo::{Bounds, GeoTransform};
use crate::grid::Grid;

/// Overlay wins wherever it is valid, otherwise the base value is kept.
/// The output carries the base grid's nodata sentinel.
pub fn overlay(base: &Grid, top: &Grid) -> Result<Grid> {
    base.ensure_same_georef(top, "overlay composite")?;
    let mut out = base.clone();
    for (i, &t) in top.data.iter().enumerate() {
        if !top.is_nodata_value(t) {
            out.data[i] = t;
        } else if base.is_nodata_value(base.data[i]) {
            out.data[i] = base.nodata;
        }
    }
    Ok(out)
}

/// Surface model from terrain plus heights: base + overlay where the
/// overlay is a positive height, base elsewhere.
pub fn stack(base: &Grid, heights: &Grid) -> Result<Grid> {
    base.ensure_same_georef(heights, "stack composite")?;
    let mut out = base.clone();
    for (i, &h) in heights.data.iter().enumerate() {
        let b = base.data[i];
        if base.is_nodata_value(b) {
            out.data[i] = base.nodata;
        } else if !heights.is_nodata_value(h) && h > 0.0 {
            out.data[i] = b + h;
        }
    }
    Ok(out)
}

/// Surface minus terrain where both are valid, nodata elsewhere.
pub fn height_above_ground(surface: &Grid, terrain: &Grid) -> Result<Grid> {
    surface.ensure_same_georef(terrain, "height above ground")?;
    let mut out = surface.empty_like();
    for (i, (&s, &t)) in surface.data.iter().zip(&terrain.data).enumerate() {
        if !surface.is_nodata_value(s) && !terrain.is_nodata_value(t) {
            out.data[i] = s - t;
        }
    }
    Ok(out)
}

/// Merge tiles onto their union extent; earlier tiles win where several
/// are valid. Cells that no tile covers are nodata (first tile's sentinel).
pub fn mosaic(tiles: &[Grid]) -> Result<Grid> {
    let first = tiles
        .first()
        .ok_or_else(|| Error::InvalidParameter("mosaic needs at least one grid".into()))?;
    if !first.transform.is_north_up() {
        return Err(Error::IncompatibleGrid("mosaic requires north-up grids".into()));
    }
    let (res_x, res_y) = first.transform.resolution();
    let mut extent: Bounds = first.bounds();
    for (i, t) in tiles.iter().enumerate().skip(1) {
        let (rx, ry) = t.transform.resolution();
        if t.crs != first.crs || (rx - res_x).abs() > 1e-9 || (ry - res_y).abs() > 1e-9 || !t.transform.is_north_up() {
            return Err(Error::IncompatibleGrid(format!(
                "mosaic tile {i}: {} at {rx}x{ry} does not match {} at {res_x}x{res_y}",
                t.crs, first.crs
            )));
        }
        extent = extent.union(&t.bounds());
    }

    let width = (extent.width() / res_x).round() as usize;
    let height = (extent.height() / res_y).round() as usize;
    let transform = GeoTransform {
        origin_x: extent.min_x,
        origin_y: extent.max_y,
        ..first.transform
    };
    let mut out = Grid::empty(width, height, transform, first.crs, first.nodata);

    for t in tiles {
        let col_off = ((t.transform.origin_x - extent.min_x) / res_x).round() as usize;
        let row_off = ((extent.max_y - t.transform.origin_y) / res_y).round() as usize;
        for r in 0..t.height {
            let orow = row_off + r;
            if orow >= height {
                break;
            }
            for c in 0..t.width {
                let ocol = col_off + c;
                if ocol >= width {
                    break;
                }
                if out.is_valid(orow, ocol) {
                    continue;
                }
                if let Some(v) = t.value(r, c) {
                    out.set(orow, ocol, v);
                }
            }
        }
    }
    debug!(tiles = tiles.len(), width, height, "mosaic");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Crs;
    use crate::grid::tests::metric_grid;

    #[test]
    fn overlay_precedence() {
        let base = metric_grid(1, 1, 5.0);
        let hole = metric_grid(1, 1, -9999.0);
        assert_eq!(overlay(&base, &hole).unwrap().data, vec![5.0]);
        let nine = metric_grid(1, 1, 9.0);
        assert_eq!(overlay(&base, &nine).unwrap().data, vec![9.0]);
    }

    #[test]
    fn overlay_keeps_nodata_where_both_are_missing() {
        let mut base = metric_grid(2, 1, 1.0);
        base.set(0, 1, f32::NAN);
        let top = metric_grid(2, 1, -9999.0);
        let out = overlay(&base, &top).unwrap();
        assert_eq!(out.get(0, 0), 1.0);
        assert_eq!(out.get(0, 1), -9999.0);
        assert_eq!(out.valid_count(), 1);
    }

    #[test]
    fn overlay_zero_is_a_valid_value() {
        let base = metric_grid(1, 1, 5.0);
        let zero = metric_grid(1, 1, 0.0);
        assert_eq!(overlay(&base, &zero).unwrap().data, vec![0.0]);
    }

    #[test]
    fn mismatched_grids_are_rejected() {
        let a = metric_grid(2, 2, 1.0);
        let b = metric_grid(3, 2, 1.0);
        assert!(matches!(overlay(&a, &b), Err(Error::IncompatibleGrid(_))));
        let mut c = metric_grid(2, 2, 1.0);
        c.crs = Crs::Epsg(32631);
        assert!(matches!(stack(&a, &c), Err(Error::IncompatibleGrid(_))));
    }

    #[test]
    fn stack_adds_positive_heights_only() {
        let dem = metric_grid(3, 1, 2.0);
        let mut heights = metric_grid(3, 1, 0.0);
        heights.set(0, 0, 10.0);
        heights.set(0, 2, -9999.0);
        let dsm = stack(&dem, &heights).unwrap();
        assert_eq!(dsm.data, vec![12.0, 2.0, 2.0]);
    }

    #[test]
    fn height_above_ground_needs_both_surfaces() {
        let mut dsm = metric_grid(3, 1, 14.0);
        let mut dem = metric_grid(3, 1, 2.0);
        dsm.set(0, 1, -9999.0);
        dem.set(0, 2, f32::NAN);
        let h = height_above_ground(&dsm, &dem).unwrap();
        assert_eq!(h.get(0, 0), 12.0);
        assert_eq!(h.valid_count(), 1);
    }

    #[test]
    fn mosaic_takes_union_and_first_valid_wins() {
        // Two 2x2 tiles offset by one column: union is 3x2.
        let a = Grid::new(2, 2, GeoTransform::north_up(0.0, 2.0, 1.0), Crs::Epsg(28992), -9999.0, 1.0);
        let mut b = Grid::new(2, 2, GeoTransform::north_up(1.0, 2.0, 1.0), Crs::Epsg(28992), -9999.0, 2.0);
        b.set(0, 1, -9999.0);
        let m = mosaic(&[a, b]).unwrap();
        assert_eq!((m.width, m.height), (3, 2));
        assert_eq!(m.data, vec![1.0, 1.0, -9999.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn mosaic_fills_gaps_from_later_tiles() {
        let mut a = metric_grid(2, 1, 1.0);
        a.set(0, 0, -9999.0);
        let b = metric_grid(2, 1, 3.0);
        let m = mosaic(&[a, b]).unwrap();
        assert_eq!(m.data, vec![3.0, 1.0]);
    }

    #[test]
    fn mosaic_rejects_mixed_resolution() {
        let a = metric_grid(2, 2, 1.0);
        let b = Grid::new(1, 1, GeoTransform::north_up(0.0, 2.0, 2.0), Crs::Epsg(28992), -9999.0, 1.0);
        assert!(matches!(mosaic(&[a, b]), Err(Error::IncompatibleGrid(_))));
        assert!(matches!(mosaic(&[]), Err(Error::InvalidParameter(_))));
    }
}
