//! Model-input preparation.
//!
//! Raw sources (terrain, buildings, a vegetation point cloud, land cover)
//! are brought onto one target grid derived from the DEM: cropped to the
//! AOI, at the configured resolution, origin snapped to whole units. The
//! stages run in order:
//!
//! 1. target grid from DEM + AOI
//! 2. DEM resampled (bilinear) and gap filled
//! 3. buildings rasterized or resampled (nearest), holes filled
//! 4. DSM = DEM stacked with building heights
//! 5. canopy heights from clustered vegetation returns
//! 6. land cover resampled (nearest)
//!
//! Every output shares the target georeferencing; a final alignment check
//! logs anything that would make the set unfit for the model.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::align::{align_to, check_alignment, snap_origin, GridSpec, Layer, Resampling};
use crate::cluster::{extract_clusters, retain_cluster_points, ClusterReport};
use crate::composite::stack;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::fill::fill_gaps;
use crate::geo::GeoTransform;
use crate::grid::Grid;
use crate::io::vector::FeatureSet;
use crate::io::RasterStore;
use crate::pointcloud::{grid_max_z, PointCloud, CLASS_HIGH_VEGETATION};
use crate::rasterize::{aoi_in_crs, rasterize, Aoi, RasterizeParams};

pub const DEM_FILE: &str = "DEM.tif";
pub const DSM_FILE: &str = "DSM.tif";
pub const BUILDINGS_FILE: &str = "Buildings.tif";
pub const CDSM_FILE: &str = "CDSM.tif";
pub const LANDCOVER_FILE: &str = "Landcover.tif";

/// Building heights as footprints or as an existing raster.
#[derive(Debug, Clone, Copy)]
pub enum BuildingSource<'a> {
    Footprints(&'a FeatureSet),
    Heights(&'a Grid),
}

#[derive(Debug, Clone, Copy)]
pub struct InputSources<'a> {
    pub dem: &'a Grid,
    pub buildings: Option<BuildingSource<'a>>,
    /// Classified returns use class 5 only; unclassified clouds are used whole.
    pub vegetation: Option<&'a PointCloud>,
    pub landcover: Option<&'a Grid>,
}

/// Aligned model inputs.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    pub dem: Grid,
    pub dsm: Grid,
    pub buildings: Option<Grid>,
    /// Vegetation height above ground, 0 where there is none.
    pub canopy: Option<Grid>,
    pub landcover: Option<Grid>,
    pub clusters: Option<ClusterReport>,
}

impl ModelInputs {
    pub fn layers(&self) -> Vec<(&'static str, &Grid)> {
        let mut out = vec![(DEM_FILE, &self.dem), (DSM_FILE, &self.dsm)];
        let optional = [
            (BUILDINGS_FILE, self.buildings.as_ref()),
            (CDSM_FILE, self.canopy.as_ref()),
            (LANDCOVER_FILE, self.landcover.as_ref()),
        ];
        out.extend(optional.into_iter().filter_map(|(name, g)| g.map(|g| (name, g))));
        out
    }

    /// Write every layer into `dir`.
    pub fn write(&self, store: &dyn RasterStore, dir: &Path) -> Result<Vec<PathBuf>> {
        self.layers()
            .into_iter()
            .map(|(name, g)| {
                let path = dir.join(name);
                store.write(g, &path)?;
                Ok(path)
            })
            .collect()
    }
}

/// DEM extent clipped to the AOI, at `resolution`, origin on whole units.
pub fn target_grid(dem: &Grid, aoi: Option<&Aoi>, resolution: f64) -> Result<GridSpec> {
    if !(resolution > 0.0) {
        return Err(Error::InvalidParameter(format!("resolution must be > 0, got {resolution}")));
    }
    let extent = match aoi {
        Some(aoi) => {
            let aoi = aoi_in_crs(aoi, dem.crs)?;
            dem.bounds()
                .intersection(&aoi.bounds)
                .ok_or_else(|| Error::NoOverlap { subject: "area of interest".into() })?
        }
        None => dem.bounds(),
    };
    let width = (extent.width() / resolution + 1e-9).floor() as usize;
    let height = (extent.height() / resolution + 1e-9).floor() as usize;
    if width == 0 || height == 0 {
        return Err(Error::InvalidParameter(format!(
            "extent {extent:?} is smaller than one {resolution}-unit cell"
        )));
    }
    Ok(snap_origin(&GridSpec {
        width,
        height,
        transform: GeoTransform::north_up(extent.min_x, extent.max_y, resolution),
        crs: dem.crs,
    }))
}

fn align_one(name: &str, grid: &Grid, spec: &GridSpec, method: Resampling) -> Result<Grid> {
    align_to(spec, &[Layer::new(name, grid.clone(), method)])?
        .pop()
        .ok_or_else(|| Error::InvalidParameter(format!("alignment of {name} produced no grid")))
}

/// Vegetation height above ground from the highest clustered return per
/// cell. Cells without vegetation or terrain are 0.
fn canopy_heights(cloud: &PointCloud, dem: &Grid, config: &PipelineConfig) -> Result<(Grid, ClusterReport)> {
    let spec = GridSpec::of(dem);
    let cloud = cloud.reprojected(spec.crs)?;
    let classified = cloud.points.iter().any(|p| p.classification.is_some());
    let vegetation = if classified { cloud.filter_classes(&[CLASS_HIGH_VEGETATION]) } else { cloud };
    let vegetation = vegetation.filter_bounds(&spec.bounds());

    let report = extract_clusters(&vegetation, &config.cluster)?;
    let kept = retain_cluster_points(&vegetation, &report);
    let top = grid_max_z(&kept, config.resolution, Some(&spec.bounds()))?;
    let top = align_one("canopy", &top, &spec, Resampling::Nearest)?;

    let mut canopy = dem.empty_like();
    for (i, out) in canopy.data.iter_mut().enumerate() {
        let (t, g) = (top.data[i], dem.data[i]);
        *out = if top.is_nodata_value(t) || dem.is_nodata_value(g) { 0.0 } else { (t - g).max(0.0) };
    }
    info!(
        clusters = report.clusters.len(),
        noise = report.noise_points,
        rejected = report.rejected_clusters,
        "vegetation clusters"
    );
    Ok((canopy, report))
}

/// Prepare every model input onto one grid.
pub fn prepare_model_inputs(sources: &InputSources<'_>, aoi: Option<&Aoi>, config: &PipelineConfig) -> Result<ModelInputs> {
    config.validate()?;
    let spec = target_grid(sources.dem, aoi, config.resolution)?;
    info!(width = spec.width, height = spec.height, crs = %spec.crs, "target grid");

    let dem = fill_gaps(&align_one("dem", sources.dem, &spec, Resampling::Bilinear)?, &config.fill)?;

    let buildings = match sources.buildings {
        Some(BuildingSource::Footprints(fs)) => {
            let params = RasterizeParams { resolution: config.resolution, ..Default::default() };
            let burned = rasterize(fs, Some(&Aoi::new(spec.bounds(), spec.crs)), &params)?;
            Some(align_one("buildings", &burned, &spec, Resampling::Nearest)?)
        }
        Some(BuildingSource::Heights(g)) => {
            Some(fill_gaps(&align_one("buildings", g, &spec, Resampling::Nearest)?, &config.fill)?)
        }
        None => None,
    };
    let dsm = match &buildings {
        Some(b) => stack(&dem, b)?,
        None => dem.clone(),
    };

    let (canopy, clusters) = match sources.vegetation {
        Some(cloud) => {
            let (c, r) = canopy_heights(cloud, &dem, config)?;
            (Some(c), Some(r))
        }
        None => (None, None),
    };

    let landcover = sources
        .landcover
        .map(|g| align_one("landcover", g, &spec, Resampling::Nearest))
        .transpose()?;

    let inputs = ModelInputs { dem, dsm, buildings, canopy, landcover, clusters };
    let named: Vec<(String, &Grid)> = inputs.layers().into_iter().map(|(n, g)| (n.to_string(), g)).collect();
    for issue in check_alignment(&named, config.resolution) {
        warn!(%issue, "model input alignment");
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::tests::MemStore;
    use crate::geo::{Bounds, Crs};
    use crate::grid::tests::metric_grid;
    use crate::io::vector::parse_feature_collection;
    use crate::pointcloud::Point3;
    use approx::assert_abs_diff_eq;

    fn canopy_cloud() -> PointCloud {
        // 3 m square canopy at 0.25 m spacing plus two isolated returns.
        let mut points = Vec::new();
        for i in 0..=12 {
            for j in 0..=12 {
                let mut p = Point3::new(2.0 + i as f64 * 0.25, 2.0 + j as f64 * 0.25, 8.0);
                p.classification = Some(CLASS_HIGH_VEGETATION);
                points.push(p);
            }
        }
        for (x, y) in [(15.5, 15.5), (17.5, 2.5)] {
            points.push(Point3 { x, y, z: 30.0, classification: Some(CLASS_HIGH_VEGETATION) });
        }
        points.push(Point3 { x: 10.5, y: 10.5, z: 50.0, classification: Some(6) });
        PointCloud::new(points, Crs::Epsg(28992))
    }

    fn config() -> PipelineConfig {
        let mut c = PipelineConfig::default();
        c.cluster.min_samples = 20;
        c
    }

    #[test]
    fn target_grid_clips_and_snaps() {
        let dem = metric_grid(20, 20, 0.0);
        let aoi = Aoi::new(Bounds::new(2.4, 3.0, 12.6, 15.2), Crs::Epsg(28992));
        let spec = target_grid(&dem, Some(&aoi), 1.0).unwrap();
        assert_eq!((spec.width, spec.height), (10, 12));
        assert_eq!((spec.transform.origin_x, spec.transform.origin_y), (2.0, 15.0));

        let far = Aoi::new(Bounds::new(100.0, 100.0, 110.0, 110.0), Crs::Epsg(28992));
        assert!(matches!(target_grid(&dem, Some(&far), 1.0), Err(Error::NoOverlap { .. })));
    }

    #[test]
    fn prepares_aligned_inputs_from_rasters_and_points() {
        let mut dem = metric_grid(20, 20, 2.0);
        dem.set(10, 10, dem.nodata);
        let mut heights = metric_grid(20, 20, 0.0);
        for r in 0..4 {
            for c in 12..16 {
                heights.set(r, c, 10.0);
            }
        }
        heights.set(0, 0, heights.nodata);
        let mut landcover = Grid::new(40, 40, GeoTransform::north_up(0.0, 20.0, 0.5), Crs::Epsg(28992), 255.0, 5.0);
        landcover.set(0, 0, 1.0);
        let cloud = canopy_cloud();

        let sources = InputSources {
            dem: &dem,
            buildings: Some(BuildingSource::Heights(&heights)),
            vegetation: Some(&cloud),
            landcover: Some(&landcover),
        };
        let inputs = prepare_model_inputs(&sources, None, &config()).unwrap();

        assert_eq!(inputs.dem.valid_count(), 400, "DEM hole is filled");
        assert_abs_diff_eq!(inputs.dem.get(10, 10), 2.0, epsilon = 1e-5);
        assert_eq!(inputs.dsm.get(1, 13), 12.0);
        assert_eq!(inputs.dsm.get(10, 5), 2.0);

        let canopy = inputs.canopy.as_ref().unwrap();
        assert_eq!(canopy.get(16, 3), 6.0);
        assert_eq!(canopy.get(4, 15), 0.0, "isolated return is noise");
        assert_eq!(canopy.get(9, 10), 0.0, "building class is not vegetation");
        let report = inputs.clusters.as_ref().unwrap();
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.noise_points, 2);

        let lc = inputs.landcover.as_ref().unwrap();
        assert_eq!((lc.width, lc.height), (20, 20));
        assert!(inputs.layers().iter().all(|(_, g)| g.same_georef(&inputs.dem)));
    }

    #[test]
    fn footprints_are_burned_onto_the_target_grid() {
        let fs = parse_feature_collection(
            r#"{ "type": "FeatureCollection",
                 "crs": { "type": "name", "properties": { "name": "EPSG:28992" } },
                 "features": [ { "type": "Feature", "properties": { "hoogte": 9 },
                   "geometry": { "type": "Polygon", "coordinates": [[[4,4],[8,4],[8,8],[4,8],[4,4]]] } } ] }"#,
        )
        .unwrap();
        let dem = metric_grid(12, 12, 1.0);
        let sources = InputSources {
            dem: &dem,
            buildings: Some(BuildingSource::Footprints(&fs)),
            vegetation: None,
            landcover: None,
        };
        let inputs = prepare_model_inputs(&sources, None, &config()).unwrap();
        let b = inputs.buildings.as_ref().unwrap();
        assert!(b.same_georef(&dem));
        // Cell (row 5, col 5) has its centre at (5.5, 6.5).
        assert_eq!(b.get(5, 5), 9.0);
        assert_eq!(b.get(0, 0), 0.0);
        assert_eq!(inputs.dsm.get(5, 5), 10.0);
        assert_eq!(inputs.layers().len(), 3);

        let store = MemStore::default();
        let dir = tempfile::tempdir().unwrap();
        let written = inputs.write(&store, dir.path()).unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(store.get(&dir.path().join(DSM_FILE)).unwrap().get(5, 5), 10.0);
    }

    #[test]
    fn invalid_config_fails_before_work() {
        let dem = metric_grid(4, 4, 1.0);
        let sources = InputSources { dem: &dem, buildings: None, vegetation: None, landcover: None };
        let mut c = PipelineConfig::default();
        c.resolution = 0.0;
        assert!(matches!(prepare_model_inputs(&sources, None, &c), Err(Error::InvalidParameter(_))));
    }
}
