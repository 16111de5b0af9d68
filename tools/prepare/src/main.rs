//! Model-input preparation: inspect, align, rasterize, grid and cluster
//! point clouds, fill gaps and composite layers.
//! Output rasters are GeoTIFF; tables are CSV.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use heatgrid_core::align::{align_layers, check_alignment, inspect, Layer, Resampling};
use heatgrid_core::cluster::{extract_clusters, retain_cluster_points};
use heatgrid_core::composite::{mosaic, overlay, stack};
use heatgrid_core::fill::fill_gaps;
use heatgrid_core::geo::Crs;
use heatgrid_core::io::points::read_points;
use heatgrid_core::io::table::write_table;
use heatgrid_core::io::vector::read_features;
use heatgrid_core::io::{read_grid, write_grid, GeoTiffStore};
use heatgrid_core::pipeline::{prepare_model_inputs, BuildingSource, InputSources};
use heatgrid_core::pointcloud::grid_max_z;
use heatgrid_core::rasterize::{rasterize, Aoi, RasterizeParams};
use heatgrid_core::{Grid, PipelineConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "prepare", about = "Prepare aligned microclimate model inputs")]
struct Args {
    /// Pipeline configuration JSON; missing keys use defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output cell size (overrides the config).
    #[arg(short, long, global = true)]
    resolution: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print CRS, resolution, origin, shape and extent of each raster as JSON.
    Inspect { inputs: Vec<PathBuf> },
    /// Check rasters against the first one and the configured resolution.
    Check { inputs: Vec<PathBuf> },
    /// Resample every input onto the first; each input is PATH[:METHOD].
    Align {
        #[arg(required = true)]
        inputs: Vec<String>,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
    /// Burn a GeoJSON height attribute into a raster.
    Rasterize {
        input: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        /// GeoJSON whose envelope crops the output.
        #[arg(long)]
        aoi: Option<PathBuf>,
    },
    /// Highest point per cell of a x,y,z[,classification] CSV.
    GridPoints {
        input: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        #[arg(long, value_parser = parse_crs)]
        crs: Crs,
        /// Keep only these classification codes.
        #[arg(long, value_delimiter = ',')]
        classes: Vec<u8>,
    },
    /// Density clustering of point-cloud objects (tree canopies).
    Clusters {
        input: PathBuf,
        /// Cluster table (CSV).
        #[arg(short, long)]
        out: PathBuf,
        #[arg(long, value_parser = parse_crs)]
        crs: Crs,
        #[arg(long, value_delimiter = ',')]
        classes: Vec<u8>,
        /// Also grid the retained cluster points (highest z per cell).
        #[arg(long)]
        grid_out: Option<PathBuf>,
    },
    /// Fill nodata cells by inverse-distance weighting.
    Fill {
        input: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Composite an overlay onto an aligned base grid.
    Composite {
        base: PathBuf,
        overlay: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = CompositeMode::Overlay)]
        mode: CompositeMode,
    },
    /// Merge tiles onto their union extent; earlier tiles win.
    Mosaic {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Build DEM, DSM, CDSM and land cover on one grid.
    ModelInputs {
        #[arg(long)]
        dem: PathBuf,
        /// Building footprints (GeoJSON).
        #[arg(long, conflicts_with = "building_heights")]
        footprints: Option<PathBuf>,
        /// Building height raster.
        #[arg(long)]
        building_heights: Option<PathBuf>,
        /// Vegetation point cloud (CSV).
        #[arg(long, requires = "points_crs")]
        vegetation: Option<PathBuf>,
        #[arg(long, value_parser = parse_crs)]
        points_crs: Option<Crs>,
        #[arg(long)]
        landcover: Option<PathBuf>,
        #[arg(long)]
        aoi: Option<PathBuf>,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CompositeMode {
    /// Overlay wins wherever it is valid.
    Overlay,
    /// Base plus positive overlay heights.
    Stack,
}

fn parse_crs(s: &str) -> std::result::Result<Crs, String> {
    s.parse().map_err(|e| format!("{e}"))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn load(path: &Path) -> Result<Grid> {
    read_grid(path).with_context(|| format!("reading {}", path.display()))
}

fn save(grid: &Grid, path: &Path) -> Result<()> {
    write_grid(grid, path).with_context(|| format!("writing {}", path.display()))?;
    eprintln!("  -> {}", path.display());
    Ok(())
}

fn load_aoi(path: Option<&Path>) -> Result<Option<Aoi>> {
    path.map(|p| -> Result<Aoi> {
        let fs = read_features(p).with_context(|| format!("reading AOI {}", p.display()))?;
        Ok(Aoi::from_features(&fs)?)
    })
    .transpose()
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(p) => PipelineConfig::from_json_file(p).with_context(|| format!("loading config {}", p.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(r) = args.resolution {
        config.resolution = r;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// `path` or `path:method`; nearest by default.
fn parse_layer_arg(arg: &str) -> Result<(PathBuf, Resampling)> {
    match arg.rsplit_once(':') {
        Some((path, method)) if !method.contains(['/', '\\']) && !path.is_empty() => {
            Ok((PathBuf::from(path), method.parse().with_context(|| format!("in `{arg}`"))?))
        }
        _ => Ok((PathBuf::from(arg), Resampling::Nearest)),
    }
}

fn named(paths: &[PathBuf]) -> Result<Vec<(String, Grid)>> {
    paths.iter().map(|p| Ok((p.display().to_string(), load(p)?))).collect()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args)?;

    match &args.command {
        Command::Inspect { inputs } => {
            let grids = named(inputs)?;
            let refs: Vec<(String, &Grid)> = grids.iter().map(|(n, g)| (n.clone(), g)).collect();
            println!("{}", serde_json::to_string_pretty(&inspect(&refs))?);
        }
        Command::Check { inputs } => {
            let grids = named(inputs)?;
            let refs: Vec<(String, &Grid)> = grids.iter().map(|(n, g)| (n.clone(), g)).collect();
            let issues = check_alignment(&refs, config.resolution);
            for issue in &issues {
                eprintln!("[prepare] {issue}");
            }
            if !issues.is_empty() {
                bail!("{} alignment issue(s)", issues.len());
            }
            eprintln!("[prepare] {} grids aligned", refs.len());
        }
        Command::Align { inputs, out_dir } => {
            let mut layers = Vec::with_capacity(inputs.len());
            for arg in inputs {
                let (path, method) = parse_layer_arg(arg)?;
                layers.push(Layer::new(path.display().to_string(), load(&path)?, method));
            }
            eprintln!("[prepare] Aligning {} layers onto {}", layers.len(), layers[0].name);
            let aligned = align_layers(&layers).context("alignment failed")?;
            for (layer, grid) in layers.iter().zip(&aligned) {
                let name = Path::new(&layer.name).file_name().context("input without a file name")?;
                save(grid, &out_dir.join(name))?;
            }
        }
        Command::Rasterize { input, out, aoi } => {
            let features = read_features(input).with_context(|| format!("reading {}", input.display()))?;
            let aoi = load_aoi(aoi.as_deref())?;
            let params = RasterizeParams { resolution: config.resolution, ..Default::default() };
            let grid = rasterize(&features, aoi.as_ref(), &params)?;
            eprintln!("[prepare] {} features -> {}x{} grid", features.features.len(), grid.width, grid.height);
            save(&grid, out)?;
        }
        Command::GridPoints { input, out, crs, classes } => {
            let mut cloud = read_points(input, *crs).with_context(|| format!("reading {}", input.display()))?;
            if !classes.is_empty() {
                cloud = cloud.filter_classes(classes);
            }
            eprintln!("[prepare] Gridding {} points at {} m", cloud.len(), config.resolution);
            save(&grid_max_z(&cloud, config.resolution, None)?, out)?;
        }
        Command::Clusters { input, out, crs, classes, grid_out } => {
            let mut cloud = read_points(input, *crs).with_context(|| format!("reading {}", input.display()))?;
            if !classes.is_empty() {
                cloud = cloud.filter_classes(classes);
            }
            let report = extract_clusters(&cloud, &config.cluster)?;
            eprintln!(
                "[prepare] {} clusters, {} noise points, {} rejected",
                report.clusters.len(),
                report.noise_points,
                report.rejected_clusters
            );
            write_table(out, &report.clusters).with_context(|| format!("writing {}", out.display()))?;
            if let Some(path) = grid_out {
                let kept = retain_cluster_points(&cloud, &report);
                if kept.is_empty() {
                    bail!("no cluster survived filtering; nothing to grid");
                }
                save(&grid_max_z(&kept, config.resolution, cloud.bounds().as_ref())?, path)?;
            }
        }
        Command::Fill { input, out } => {
            let grid = load(input)?;
            let holes = grid.nodata_count();
            let filled = fill_gaps(&grid, &config.fill)?;
            eprintln!("[prepare] Filled {} of {holes} nodata cells", holes - filled.nodata_count());
            save(&filled, out)?;
        }
        Command::Composite { base, overlay: top, out, mode } => {
            let (b, t) = (load(base)?, load(top)?);
            let grid = match mode {
                CompositeMode::Overlay => overlay(&b, &t)?,
                CompositeMode::Stack => stack(&b, &t)?,
            };
            save(&grid, out)?;
        }
        Command::Mosaic { inputs, out } => {
            let tiles = inputs.iter().map(|p| load(p)).collect::<Result<Vec<_>>>()?;
            let grid = mosaic(&tiles)?;
            eprintln!("[prepare] {} tiles -> {}x{}", tiles.len(), grid.width, grid.height);
            save(&grid, out)?;
        }
        Command::ModelInputs { dem, footprints, building_heights, vegetation, points_crs, landcover, aoi, out_dir } => {
            let dem = load(dem)?;
            let features = footprints
                .as_deref()
                .map(|p| read_features(p).with_context(|| format!("reading {}", p.display())))
                .transpose()?;
            let heights = building_heights.as_deref().map(load).transpose()?;
            let cloud = match (vegetation, points_crs) {
                (Some(p), Some(crs)) => Some(read_points(p, *crs).with_context(|| format!("reading {}", p.display()))?),
                _ => None,
            };
            let landcover = landcover.as_deref().map(load).transpose()?;
            let aoi = load_aoi(aoi.as_deref())?;

            let buildings = match (&features, &heights) {
                (Some(fs), _) => Some(BuildingSource::Footprints(fs)),
                (None, Some(g)) => Some(BuildingSource::Heights(g)),
                (None, None) => None,
            };
            let sources = InputSources {
                dem: &dem,
                buildings,
                vegetation: cloud.as_ref(),
                landcover: landcover.as_ref(),
            };
            let inputs = prepare_model_inputs(&sources, aoi.as_ref(), &config)?;
            let written = inputs.write(&GeoTiffStore, out_dir).context("writing model inputs")?;
            for p in &written {
                eprintln!("  -> {}", p.display());
            }
            if let Some(report) = &inputs.clusters {
                write_table(&out_dir.join("vegetation_clusters.csv"), &report.clusters)?;
            }
            eprintln!("[prepare] {} model inputs in {}", written.len(), out_dir.display());
        }
    }
    Ok(())
}
