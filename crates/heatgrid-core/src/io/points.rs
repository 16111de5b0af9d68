//! Delimited-text point-cloud reader (`x,y,z[,classification]` with a
//! header row). LAS/LAZ decoding happens upstream of this crate.

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use crate::geo::Crs;
use crate::pointcloud::{Point3, PointCloud};

#[derive(Debug, Deserialize)]
struct PointRecord {
    x: f64,
    y: f64,
    z: f64,
    #[serde(default)]
    classification: Option<u8>,
}

pub fn read_points(path: &Path, crs: Crs) -> Result<PointCloud> {
    let reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    collect_points(reader, crs)
}

fn collect_points<R: std::io::Read>(mut reader: csv::Reader<R>, crs: Crs) -> Result<PointCloud> {
    let mut points = Vec::new();
    for record in reader.deserialize() {
        let r: PointRecord = record?;
        points.push(Point3 { x: r.x, y: r.y, z: r.z, classification: r.classification });
    }
    Ok(PointCloud { points, crs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_with_and_without_classification() {
        let text = "x, y, z, classification\n1.0, 2.0, 3.5, 5\n4.0, 5.0, 6.0,\n";
        let reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(text.as_bytes());
        let cloud = collect_points(reader, Crs::Epsg(28992)).unwrap();
        assert_eq!(cloud.points.len(), 2);
        assert_eq!(cloud.points[0].classification, Some(5));
        assert_eq!(cloud.points[1].classification, None);
        assert_eq!(cloud.points[1].z, 6.0);
    }

    #[test]
    fn reads_xyz_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.csv");
        std::fs::write(&path, "x,y,z\n0.5,0.5,3\n0.6,0.4,7\n").unwrap();
        let cloud = read_points(&path, Crs::Epsg(32631)).unwrap();
        assert_eq!(cloud.points.len(), 2);
        assert_eq!(cloud.crs, Crs::Epsg(32631));
        assert!(cloud.points.iter().all(|p| p.classification.is_none()));
    }
}
