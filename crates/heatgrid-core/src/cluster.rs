//! Density-based clustering of point-cloud returns in the horizontal plane.
//!
//! DBSCAN over (x, y) only; z rides along as a member attribute. A point is
//! a core point when at least `min_samples` points, itself included, lie
//! within `eps` (inclusive). Clusters then pass a footprint filter: convex
//! hull area above `min_area_m2`, and optionally an elongation limit on the
//! minimum rotated bounding rectangle to reject hedges and walls.

use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pointcloud::PointCloud;

pub const DEFAULT_EPS: f64 = 1.0;
pub const DEFAULT_MIN_SAMPLES: usize = 50;
pub const DEFAULT_MIN_AREA_M2: f64 = 4.0;
pub const DEFAULT_MAX_ASPECT_RATIO: f64 = 7.0;

/// Fewer members than this have no polygonal footprint.
const MIN_HULL_POINTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    /// Neighbourhood radius in map units.
    pub eps: f64,
    /// Minimum neighbourhood size, the point itself included.
    pub min_samples: usize,
    /// Minimum convex-hull footprint.
    pub min_area_m2: f64,
    /// Longest/shortest side limit of the minimum rotated rectangle.
    pub max_aspect_ratio: Option<f64>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            min_samples: DEFAULT_MIN_SAMPLES,
            min_area_m2: DEFAULT_MIN_AREA_M2,
            max_aspect_ratio: Some(DEFAULT_MAX_ASPECT_RATIO),
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.eps > 0.0) {
            return Err(Error::InvalidParameter(format!("eps must be > 0, got {}", self.eps)));
        }
        if self.min_samples == 0 {
            return Err(Error::InvalidParameter("min_samples must be >= 1".into()));
        }
        if !(self.min_area_m2 >= 0.0) {
            return Err(Error::InvalidParameter(format!("min_area_m2 must be >= 0, got {}", self.min_area_m2)));
        }
        if let Some(r) = self.max_aspect_ratio {
            if !(r >= 1.0) {
                return Err(Error::InvalidParameter(format!("max_aspect_ratio must be >= 1, got {r}")));
            }
        }
        Ok(())
    }
}

// ── DBSCAN ───────────────────────────────────────────────────────────────────

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// Cluster label per input point; `None` is noise. Labels are dense from 0
/// in order of discovery.
pub fn dbscan(xy: &[[f64; 2]], eps: f64, min_samples: usize) -> Vec<Option<usize>> {
    let tree: RTree<IndexedPoint> =
        RTree::bulk_load(xy.iter().enumerate().map(|(i, p)| IndexedPoint::new(*p, i)).collect());
    let eps2 = eps * eps;
    let neighbours = |i: usize| -> Vec<usize> {
        tree.locate_within_distance(xy[i], eps2).map(|n| n.data).collect()
    };

    let mut labels: Vec<Option<usize>> = vec![None; xy.len()];
    let mut visited = vec![false; xy.len()];
    let mut next_label = 0usize;

    for seed in 0..xy.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let seed_nb = neighbours(seed);
        if seed_nb.len() < min_samples {
            continue;
        }
        let label = next_label;
        next_label += 1;
        labels[seed] = Some(label);

        let mut frontier = seed_nb;
        while let Some(j) = frontier.pop() {
            if labels[j].is_none() {
                labels[j] = Some(label);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let nb = neighbours(j);
            if nb.len() >= min_samples {
                frontier.extend(nb.into_iter().filter(|&k| !visited[k] || labels[k].is_none()));
            }
        }
    }
    labels
}

// ── Footprint geometry ───────────────────────────────────────────────────────

fn cross(o: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Convex hull, counter-clockwise, without collinear points
/// (Andrew's monotone chain).
pub fn convex_hull(points: &[[f64; 2]]) -> Vec<[f64; 2]> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }
    let mut hull: Vec<[f64; 2]> = Vec::with_capacity(pts.len() * 2);
    for pass in 0..2 {
        let start = hull.len();
        let iter: Box<dyn Iterator<Item = &[f64; 2]>> =
            if pass == 0 { Box::new(pts.iter()) } else { Box::new(pts.iter().rev()) };
        for &p in iter {
            while hull.len() >= start + 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
                hull.pop();
            }
            hull.push(p);
        }
        hull.pop();
    }
    hull
}

/// Shoelace area of a simple polygon.
pub fn polygon_area(ring: &[[f64; 2]]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let twice: f64 = (0..n)
        .map(|i| {
            let (a, b) = (ring[i], ring[(i + 1) % n]);
            a[0] * b[1] - b[0] * a[1]
        })
        .sum();
    twice.abs() / 2.0
}

/// Side lengths (long, short) of the minimum-area rectangle enclosing a
/// convex hull. One rectangle side is always collinear with a hull edge.
pub fn min_rotated_rect(hull: &[[f64; 2]]) -> Option<(f64, f64)> {
    let n = hull.len();
    if n < 3 {
        return None;
    }
    let mut best: Option<(f64, f64, f64)> = None;
    for i in 0..n {
        let (a, b) = (hull[i], hull[(i + 1) % n]);
        let len = (b[0] - a[0]).hypot(b[1] - a[1]);
        if len == 0.0 {
            continue;
        }
        let (ux, uy) = ((b[0] - a[0]) / len, (b[1] - a[1]) / len);
        let (mut lo_u, mut hi_u, mut lo_v, mut hi_v) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for p in hull {
            let u = p[0] * ux + p[1] * uy;
            let v = -p[0] * uy + p[1] * ux;
            lo_u = lo_u.min(u);
            hi_u = hi_u.max(u);
            lo_v = lo_v.min(v);
            hi_v = hi_v.max(v);
        }
        let (w, h) = (hi_u - lo_u, hi_v - lo_v);
        if best.map_or(true, |(area, _, _)| w * h < area) {
            best = Some((w * h, w.max(h), w.min(h)));
        }
    }
    best.map(|(_, long, short)| (long, short))
}

// ── Cluster extraction ───────────────────────────────────────────────────────

/// One retained object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: usize,
    pub member_count: usize,
    /// Convex-hull footprint in squared map units.
    pub footprint_area: f64,
    /// Representative height.
    pub max_z: f64,
    pub mean_z: f64,
    pub centroid_x: f64,
    pub centroid_y: f64,
    /// Long/short side of the minimum rotated rectangle (infinite when flat).
    pub aspect_ratio: f64,
    /// Indices into the source cloud.
    #[serde(skip)]
    pub members: Vec<usize>,
}

/// Outcome of a clustering pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterReport {
    pub clusters: Vec<Cluster>,
    pub noise_points: usize,
    /// Density clusters dropped by the footprint filters.
    pub rejected_clusters: usize,
}

/// Segment `cloud` into objects. Pure: the cloud is not modified.
pub fn extract_clusters(cloud: &PointCloud, params: &ClusterParams) -> Result<ClusterReport> {
    params.validate()?;
    let xy: Vec<[f64; 2]> = cloud.points.iter().map(|p| [p.x, p.y]).collect();
    let labels = dbscan(&xy, params.eps, params.min_samples);

    let n_labels = labels.iter().flatten().max().map_or(0, |m| m + 1);
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_labels];
    let mut noise_points = 0usize;
    for (i, l) in labels.iter().enumerate() {
        match l {
            Some(l) => members[*l].push(i),
            None => noise_points += 1,
        }
    }

    let mut report = ClusterReport { noise_points, ..Default::default() };
    for (label, idx) in members.into_iter().enumerate() {
        if idx.len() < MIN_HULL_POINTS {
            report.rejected_clusters += 1;
            continue;
        }
        let pts: Vec<[f64; 2]> = idx.iter().map(|&i| xy[i]).collect();
        let hull = convex_hull(&pts);
        let area = polygon_area(&hull);
        if area <= params.min_area_m2 {
            debug!(label, area, "cluster below minimum footprint");
            report.rejected_clusters += 1;
            continue;
        }
        let aspect_ratio = match min_rotated_rect(&hull) {
            Some((long, short)) if short > 0.0 => long / short,
            _ => f64::INFINITY,
        };
        if params.max_aspect_ratio.is_some_and(|max| aspect_ratio > max) {
            debug!(label, aspect_ratio, "cluster too elongated");
            report.rejected_clusters += 1;
            continue;
        }
        let n = idx.len() as f64;
        let zs = idx.iter().map(|&i| cloud.points[i].z);
        report.clusters.push(Cluster {
            id: report.clusters.len(),
            member_count: idx.len(),
            footprint_area: area,
            max_z: zs.clone().fold(f64::NEG_INFINITY, f64::max),
            mean_z: zs.sum::<f64>() / n,
            centroid_x: pts.iter().map(|p| p[0]).sum::<f64>() / n,
            centroid_y: pts.iter().map(|p| p[1]).sum::<f64>() / n,
            aspect_ratio,
            members: idx,
        });
    }
    Ok(report)
}

/// Points belonging to retained clusters, in source order.
pub fn retain_cluster_points(cloud: &PointCloud, report: &ClusterReport) -> PointCloud {
    let mut keep = vec![false; cloud.points.len()];
    for c in &report.clusters {
        for &i in &c.members {
            keep[i] = true;
        }
    }
    let points = cloud
        .points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect();
    PointCloud { points, crs: cloud.crs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Crs;
    use crate::pointcloud::Point3;
    use approx::assert_abs_diff_eq;

    /// `n` points on a sunflower spiral inside radius `r` around (cx, cy).
    fn disc(cx: f64, cy: f64, r: f64, n: usize, z: f64) -> Vec<Point3> {
        let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
        (0..n)
            .map(|i| {
                let rad = r * ((i as f64 + 0.5) / n as f64).sqrt();
                let th = i as f64 * golden;
                Point3::new(cx + rad * th.cos(), cy + rad * th.sin(), z + i as f64 * 0.01)
            })
            .collect()
    }

    #[test]
    fn tight_blob_is_one_cluster() {
        let xy: Vec<[f64; 2]> = disc(10.0, 10.0, 0.5, 100, 0.0).iter().map(|p| [p.x, p.y]).collect();
        let labels = dbscan(&xy, 1.0, 50);
        assert!(labels.iter().all(|l| *l == Some(0)), "every point in cluster 0");
    }

    #[test]
    fn scattered_points_are_all_noise() {
        let xy: Vec<[f64; 2]> = (0..10).map(|i| [i as f64 * 5.0, (i % 3) as f64 * 7.0]).collect();
        let labels = dbscan(&xy, 1.0, 50);
        assert!(labels.iter().all(Option::is_none));
        let cloud = PointCloud::new(xy.iter().map(|p| Point3::new(p[0], p[1], 1.0)).collect(), Crs::Unknown);
        let report = extract_clusters(&cloud, &ClusterParams::default()).unwrap();
        assert!(report.clusters.is_empty());
        assert_eq!(report.noise_points, 10);
    }

    #[test]
    fn min_samples_counts_the_point_itself() {
        let xy = [[0.0, 0.0], [0.5, 0.0], [1.0, 0.0]];
        assert!(dbscan(&xy, 0.5, 3).iter().all(|l| *l == Some(0)), "middle point has 3 incl. itself");
        assert!(dbscan(&xy, 0.5, 4).iter().all(Option::is_none));
    }

    #[test]
    fn border_points_join_but_do_not_expand() {
        // Row of cores ending at x=0; 0.9 is a border point, 1.8 only reaches the border.
        let mut xy: Vec<[f64; 2]> = (0..5).map(|i| [-0.2 * i as f64, 0.0]).collect();
        xy.push([0.9, 0.0]);
        xy.push([1.8, 0.0]);
        let labels = dbscan(&xy, 1.0, 4);
        assert!(labels[..5].iter().all(|l| *l == Some(0)));
        assert_eq!(labels[5], Some(0));
        assert_eq!(labels[6], None);
    }

    #[test]
    fn two_canopies_and_noise_are_separated() {
        let mut points = disc(0.0, 0.0, 2.0, 300, 10.0);
        points.extend(disc(20.0, 0.0, 1.5, 200, 6.0));
        points.push(Point3::new(50.0, 50.0, 30.0));
        let cloud = PointCloud::new(points, Crs::Epsg(28992));
        let report = extract_clusters(&cloud, &ClusterParams::default()).unwrap();
        assert_eq!(report.clusters.len(), 2);
        assert_eq!(report.noise_points, 1);
        let big = &report.clusters[0];
        assert_eq!(big.member_count, 300);
        assert!(big.footprint_area > 10.0 && big.footprint_area < std::f64::consts::PI * 4.0);
        assert!(big.max_z >= 12.0 && big.max_z < 13.1);
        assert!(big.aspect_ratio < 1.5);
        assert_abs_diff_eq!(big.centroid_x, 0.0, epsilon = 0.1);

        let kept = retain_cluster_points(&cloud, &report);
        assert_eq!(kept.len(), 500);
    }

    #[test]
    fn small_footprint_is_discarded() {
        let cloud = PointCloud::new(disc(0.0, 0.0, 0.5, 100, 1.0), Crs::Unknown);
        let report = extract_clusters(&cloud, &ClusterParams::default()).unwrap();
        assert!(report.clusters.is_empty());
        assert_eq!(report.rejected_clusters, 1);
        assert_eq!(report.noise_points, 0);
    }

    #[test]
    fn hedge_is_rejected_by_elongation() {
        let hedge: Vec<Point3> = (0..400)
            .map(|i| Point3::new((i / 4) as f64 * 0.2, (i % 4) as f64 * 0.25, 2.0))
            .collect();
        let cloud = PointCloud::new(hedge, Crs::Unknown);
        let params = ClusterParams { min_samples: 5, ..Default::default() };
        assert!(extract_clusters(&cloud, &params).unwrap().clusters.is_empty());
        let lenient = ClusterParams { max_aspect_ratio: None, ..params };
        assert_eq!(extract_clusters(&cloud, &lenient).unwrap().clusters.len(), 1);
    }

    #[test]
    fn hull_area_and_rectangle_of_square() {
        let pts = [[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [1.0, 1.0], [1.0, 0.0]];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert_abs_diff_eq!(polygon_area(&hull), 4.0);
        let (long, short) = min_rotated_rect(&hull).unwrap();
        assert_abs_diff_eq!(long, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(short, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let cloud = PointCloud::new(vec![], Crs::Unknown);
        let bad = ClusterParams { eps: 0.0, ..Default::default() };
        assert!(matches!(extract_clusters(&cloud, &bad), Err(Error::InvalidParameter(_))));
    }
}
