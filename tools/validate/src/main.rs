//! Accuracy of one data source against a reference: shade class agreement,
//! continuous error metrics (UTCI, Tmrt) and building height.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use heatgrid_core::accuracy::{
    building_height_validation, continuous_validation, masked_statistics, shade_accuracy, ConfusionMatrix,
};
use heatgrid_core::io::read_grid;
use heatgrid_core::io::table::write_table;
use heatgrid_core::{Grid, PipelineConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "validate", about = "Validate a data source against a reference")]
struct Args {
    /// Pipeline configuration JSON; missing keys use defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cells trimmed from every edge of the overlap (overrides the config).
    #[arg(short, long, global = true)]
    margin: Option<usize>,

    /// Outlier threshold in standard deviations (overrides the config).
    #[arg(short, long, global = true)]
    zscore: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Confusion matrix, per-class accuracy and kappa of two shadow grids.
    Shade {
        reference: PathBuf,
        prediction: PathBuf,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
    /// MAE, RMSE and R² of two continuous grids, optionally per shade mask.
    Continuous {
        reference: PathBuf,
        prediction: PathBuf,
        #[arg(long, requires = "prediction_shade")]
        reference_shade: Option<PathBuf>,
        #[arg(long, requires = "reference_shade")]
        prediction_shade: Option<PathBuf>,
        /// Label written into the unit column.
        #[arg(short, long, default_value = "layer")]
        label: String,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
    /// Building height (DSM - DEM) of two sources.
    BuildingHeight {
        #[arg(long)]
        reference_dsm: PathBuf,
        #[arg(long)]
        reference_dem: PathBuf,
        #[arg(long)]
        prediction_dsm: PathBuf,
        #[arg(long)]
        prediction_dem: PathBuf,
        /// Ignore pairs whose absolute error exceeds this (metres).
        #[arg(long)]
        max_abs_error: Option<f64>,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
}

// ── Output rows ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct MatrixCell<'a> {
    reference: &'a str,
    prediction: &'a str,
    count: u64,
}

#[derive(Serialize)]
struct ShadeSummary {
    valid_cells: u64,
    window_cells: usize,
    overall_accuracy: Option<f64>,
    kappa: Option<f64>,
}

#[derive(Serialize)]
struct HeightSummary {
    reference_valid_pct: f64,
    prediction_valid_pct: f64,
    outliers_removed: usize,
}

fn matrix_cells(m: &ConfusionMatrix) -> Vec<MatrixCell<'_>> {
    let mut cells = Vec::with_capacity(m.labels.len() * m.labels.len());
    for (i, row) in m.counts.iter().enumerate() {
        for (j, &count) in row.iter().enumerate() {
            cells.push(MatrixCell { reference: &m.labels[i], prediction: &m.labels[j], count });
        }
    }
    cells
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn load(path: &Path) -> Result<Grid> {
    read_grid(path).with_context(|| format!("reading {}", path.display()))
}

fn save<T: Serialize>(dir: &Path, name: &str, rows: &[T]) -> Result<()> {
    let path = dir.join(name);
    write_table(&path, rows).with_context(|| format!("writing {}", path.display()))?;
    eprintln!("  -> {}", path.display());
    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(p) => PipelineConfig::from_json_file(p).with_context(|| format!("loading config {}", p.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(m) = args.margin {
        config.validation.margin_cells = m;
    }
    if let Some(z) = args.zscore {
        config.validation.zscore_threshold = z;
    }
    if let Command::BuildingHeight { max_abs_error: Some(cap), .. } = &args.command {
        config.validation.max_abs_error = Some(*cap);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"))
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args)?;
    let vc = &config.validation;

    match &args.command {
        Command::Shade { reference, prediction, out_dir } => {
            let acc = shade_accuracy(&load(reference)?, &load(prediction)?, vc)?;
            eprintln!(
                "[validate] {} of {} cells classified; OA {}, kappa {}",
                acc.valid_cells,
                acc.window_cells,
                fmt_opt(acc.overall_accuracy),
                fmt_opt(acc.kappa)
            );
            save(out_dir, "confusion_matrix.csv", &matrix_cells(&acc.matrix))?;
            save(out_dir, "class_accuracy.csv", &acc.classes)?;
            let summary = ShadeSummary {
                valid_cells: acc.valid_cells,
                window_cells: acc.window_cells,
                overall_accuracy: acc.overall_accuracy,
                kappa: acc.kappa,
            };
            save(out_dir, "shade_summary.csv", &[summary])?;
        }
        Command::Continuous { reference, prediction, reference_shade, prediction_shade, label, out_dir } => {
            let (r, p) = (load(reference)?, load(prediction)?);
            let v = continuous_validation(&r, &p, vc)?;
            eprintln!(
                "[validate] {label}: n={} MAE {:.3} RMSE {:.3} R² {:.3} ({} outliers removed)",
                v.unfiltered.n, v.unfiltered.mae, v.unfiltered.rmse, v.unfiltered.r2, v.outliers_removed
            );
            save(out_dir, "metrics.csv", &v.rows(label))?;
            if let (Some(rs), Some(ps)) = (reference_shade, prediction_shade) {
                let stats = masked_statistics(&r, &p, &load(rs)?, &load(ps)?, vc)?;
                save(out_dir, "masked_statistics.csv", &stats)?;
            }
        }
        Command::BuildingHeight { reference_dsm, reference_dem, prediction_dsm, prediction_dem, out_dir, .. } => {
            let v = building_height_validation(
                &load(reference_dsm)?,
                &load(reference_dem)?,
                &load(prediction_dsm)?,
                &load(prediction_dem)?,
                vc,
            )?;
            eprintln!(
                "[validate] building height: valid {:.1}% / {:.1}%, MAE {:.2} m, R² {:.3}",
                v.reference_valid_pct, v.prediction_valid_pct, v.metrics.unfiltered.mae, v.metrics.unfiltered.r2
            );
            save(out_dir, "building_height_metrics.csv", &v.metrics.rows("building_height"))?;
            let summary = HeightSummary {
                reference_valid_pct: v.reference_valid_pct,
                prediction_valid_pct: v.prediction_valid_pct,
                outliers_removed: v.metrics.outliers_removed,
            };
            save(out_dir, "building_height_summary.csv", &[summary])?;
        }
    }
    Ok(())
}
