//! Scenario comparison over a folder of model runs: shade and thermal
//! statistics, baseline difference maps, UTCI derivation and
//! multi-resolution aggregation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use heatgrid_core::aggregate::aggregate_runs;
use heatgrid_core::compare::{difference_maps, layer_statistics, shade_changes, shade_statistics, StatsOptions};
use heatgrid_core::io::table::{read_table, write_table};
use heatgrid_core::io::GeoTiffStore;
use heatgrid_core::scenario::{BatchReport, CancelToken, LayerKind, OutputKind, ScenarioSet};
use heatgrid_core::utci::{backfill_from_rows, utci_for_runs, MetTable, VpdBackfill, VpdRow};
use heatgrid_core::PipelineConfig;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "compare", about = "Compare microclimate model runs against a baseline")]
struct Args {
    /// Pipeline configuration JSON; missing keys use defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Edge buffer in map units (overrides the config).
    #[arg(short, long, global = true)]
    edge_buffer: Option<f64>,

    /// Baseline run name (overrides the config).
    #[arg(short, long, global = true)]
    baseline: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shade areas per category and Tmrt statistics as CSV tables.
    Stats {
        /// Folder whose subfolders are model runs.
        runs: PathBuf,
        #[arg(short, long, default_value = "stats")]
        out_dir: PathBuf,
        /// Folder of derived UTCI runs to summarise as well.
        #[arg(long)]
        utci_root: Option<PathBuf>,
    },
    /// Difference maps of every run against the baseline.
    Diff {
        runs: PathBuf,
        #[arg(short, long, default_value = "shadow")]
        layer: String,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
    /// UTCI grids from Tmrt plus a meteorological forcing file.
    Utci {
        runs: PathBuf,
        #[arg(short, long)]
        met: PathBuf,
        /// CSV with `hour,vpd` rows for forcing files without vpd.
        #[arg(long)]
        vpd_backfill: Option<PathBuf>,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
    /// Resample every raster of every run to coarser resolutions.
    Aggregate {
        runs: PathBuf,
        #[arg(short, long)]
        out_dir: PathBuf,
    },
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(p) => PipelineConfig::from_json_file(p).with_context(|| format!("loading config {}", p.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(b) = args.edge_buffer {
        config.edge_buffer = b;
    }
    if let Some(name) = &args.baseline {
        config.baseline = Some(name.clone());
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn discover(root: &Path, config: &PipelineConfig) -> Result<ScenarioSet> {
    let set = ScenarioSet::discover(root, &config.naming).with_context(|| format!("scanning {}", root.display()))?;
    if set.runs.is_empty() {
        bail!("no run folders under {}", root.display());
    }
    for run in &set.runs {
        let missing = run.missing(&config.naming);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|k| k.to_string()).collect();
            eprintln!("  [warn] {} lacks {}", run.name, names.join(", "));
        }
    }
    Ok(set)
}

fn require_baseline(config: &PipelineConfig) -> Result<&str> {
    config.baseline.as_deref().context("this command needs --baseline <run>")
}

/// Write processed rows to `name` and skipped units next to it.
fn write_report<T: Serialize>(dir: &Path, name: &str, report: &BatchReport<T>) -> Result<()> {
    let path = dir.join(name);
    write_table(&path, &report.processed).with_context(|| format!("writing {}", path.display()))?;
    eprintln!("  -> {} ({} rows)", path.display(), report.processed.len());
    if !report.skipped.is_empty() {
        let stem = name.trim_end_matches(".csv");
        let path = dir.join(format!("{stem}_skipped.csv"));
        write_table(&path, &report.skipped).with_context(|| format!("writing {}", path.display()))?;
        eprintln!("  [warn] {} units skipped, see {}", report.skipped.len(), path.display());
    }
    Ok(())
}

fn load_backfill(path: Option<&Path>) -> Result<VpdBackfill> {
    match path {
        Some(p) => {
            let rows: Vec<VpdRow> = read_table(p).with_context(|| format!("reading {}", p.display()))?;
            Ok(backfill_from_rows(&rows))
        }
        None => Ok(VpdBackfill::new()),
    }
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
    let store = GeoTiffStore;
    let cancel = CancelToken::new();

    match &args.command {
        Command::Stats { runs, out_dir, utci_root } => {
            let set = discover(runs, &config)?;
            eprintln!("[compare] {} runs in {}", set.runs.len(), runs.display());
            let opts = StatsOptions { edge_buffer: config.edge_buffer, baseline: config.baseline.clone() };

            let shade = shade_statistics(&store, &set, &opts, &cancel)?;
            write_report(out_dir, "shade_statistics.csv", &shade)?;

            let mut kinds: Vec<OutputKind> = config.naming.hours.iter().map(|&h| OutputKind::Tmrt(h)).collect();
            kinds.push(OutputKind::TmrtAverage);
            let tmrt = layer_statistics(&store, &set, &kinds, &opts, &cancel)?;
            write_report(out_dir, "tmrt_statistics.csv", &tmrt)?;

            if let Some(base) = config.baseline.as_deref() {
                let change = shade_changes(&store, &set, base, config.edge_buffer, &cancel)?;
                write_report(out_dir, "shade_change.csv", &change)?;
            }

            if let Some(root) = utci_root {
                let utci_set = discover(root, &config)?;
                let kinds: Vec<OutputKind> = config.naming.hours.iter().map(|&h| OutputKind::Utci(h)).collect();
                // UTCI grids were cropped when they were derived.
                let opts = StatsOptions { edge_buffer: 0.0, ..opts };
                let utci = layer_statistics(&store, &utci_set, &kinds, &opts, &cancel)?;
                write_report(out_dir, "utci_statistics.csv", &utci)?;
            }
        }
        Command::Diff { runs, layer, out_dir } => {
            let layer: LayerKind = layer.parse()?;
            let baseline = require_baseline(&config)?;
            let set = discover(runs, &config)?;
            eprintln!("[compare] {:?} differences against `{baseline}`", layer);
            let report = difference_maps(&store, &set, layer, baseline, config.edge_buffer, out_dir, &cancel)?;
            write_report(out_dir, "differences.csv", &report)?;
        }
        Command::Utci { runs, met, vpd_backfill, out_dir } => {
            let set = discover(runs, &config)?;
            let table = MetTable::from_file(met).with_context(|| format!("reading {}", met.display()))?;
            let backfill = load_backfill(vpd_backfill.as_deref())?;
            eprintln!("[compare] UTCI for {} runs ({} backfilled hours)", set.runs.len(), backfill.len());
            let report = utci_for_runs(&store, &set, &table, &backfill, config.edge_buffer, out_dir, &cancel)?;
            write_report(out_dir, "utci.csv", &report)?;
        }
        Command::Aggregate { runs, out_dir } => {
            let set = ScenarioSet::discover(runs, &config.naming).with_context(|| format!("scanning {}", runs.display()))?;
            eprintln!(
                "[compare] Aggregating {} runs to {:?} m with {:?}",
                set.runs.len(),
                config.aggregation.resolutions,
                config.aggregation.methods
            );
            let report = aggregate_runs(&store, &set, &config.aggregation, out_dir, &cancel)?;
            write_report(out_dir, "aggregation.csv", &report)?;
        }
    }
    Ok(())
}
