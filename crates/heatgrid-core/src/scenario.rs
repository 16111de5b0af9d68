//! Scenario runs: folders of conventionally named model outputs.
//!
//! A run is resolved once into a manifest of present files so later stages
//! ask for an [`OutputKind`] instead of rebuilding file names. Batch helpers
//! fan out over runs, skip units that fail recoverably and report them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "threading")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_YEAR: u16 = 2023;
pub const DEFAULT_DAY_OF_YEAR: u16 = 189;
/// Hours of day the model writes instantaneous outputs for.
pub const DEFAULT_HOURS: [u8; 3] = [12, 15, 18];

// ── File naming ──────────────────────────────────────────────────────────────

/// Naming convention of one model campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileNaming {
    pub year: u16,
    pub day_of_year: u16,
    pub hours: Vec<u8>,
}

impl Default for FileNaming {
    fn default() -> Self {
        Self {
            year: DEFAULT_YEAR,
            day_of_year: DEFAULT_DAY_OF_YEAR,
            hours: DEFAULT_HOURS.to_vec(),
        }
    }
}

impl FileNaming {
    pub fn file_name(&self, kind: OutputKind) -> String {
        match kind {
            OutputKind::Shadow(h) => format!("Shadow_{}_{}_{:02}00D.tif", self.year, self.day_of_year, h),
            OutputKind::Tmrt(h) => format!("Tmrt_{}_{}_{:02}00D.tif", self.year, self.day_of_year, h),
            OutputKind::TmrtAverage => "Tmrt_average.tif".to_string(),
            OutputKind::Utci(h) => format!("UTCI_{h:02}.tif"),
        }
    }

    /// First configured hour; its grid defines a run's analysis window.
    pub fn reference_hour(&self) -> Result<u8> {
        self.hours
            .first()
            .copied()
            .ok_or_else(|| Error::InvalidParameter("file naming lists no hours".into()))
    }

    /// Every file a complete model run folder holds.
    pub fn expected(&self) -> Vec<OutputKind> {
        let mut kinds: Vec<OutputKind> = self.hours.iter().map(|&h| OutputKind::Shadow(h)).collect();
        kinds.extend(self.hours.iter().map(|&h| OutputKind::Tmrt(h)));
        kinds.push(OutputKind::TmrtAverage);
        kinds
    }

    /// Every file name this convention knows about, derived ones included.
    fn known(&self) -> Vec<OutputKind> {
        let mut kinds = self.expected();
        kinds.extend(self.hours.iter().map(|&h| OutputKind::Utci(h)));
        kinds
    }
}

/// One conventionally named grid inside a run folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutputKind {
    Shadow(u8),
    Tmrt(u8),
    TmrtAverage,
    Utci(u8),
}

impl OutputKind {
    pub fn hour(&self) -> Option<u8> {
        match self {
            OutputKind::Shadow(h) | OutputKind::Tmrt(h) | OutputKind::Utci(h) => Some(*h),
            OutputKind::TmrtAverage => None,
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Shadow(h) => write!(f, "shadow_{h}"),
            OutputKind::Tmrt(h) => write!(f, "tmrt_{h}"),
            OutputKind::TmrtAverage => f.write_str("tmrt_avg"),
            OutputKind::Utci(h) => write!(f, "utci_{h}"),
        }
    }
}

/// Time-series layer family, for operations that walk all hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Shadow,
    Tmrt,
    Utci,
}

impl LayerKind {
    pub fn at(&self, hour: u8) -> OutputKind {
        match self {
            LayerKind::Shadow => OutputKind::Shadow(hour),
            LayerKind::Tmrt => OutputKind::Tmrt(hour),
            LayerKind::Utci => OutputKind::Utci(hour),
        }
    }
}

impl std::str::FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "shadow" | "shade" => Ok(LayerKind::Shadow),
            "tmrt" => Ok(LayerKind::Tmrt),
            "utci" => Ok(LayerKind::Utci),
            other => Err(Error::InvalidParameter(format!("unknown layer kind '{other}'"))),
        }
    }
}

// ── Runs ─────────────────────────────────────────────────────────────────────

/// A run folder and the manifest of files found in it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioRun {
    pub name: String,
    pub dir: PathBuf,
    files: BTreeMap<OutputKind, PathBuf>,
}

impl ScenarioRun {
    pub fn open(dir: &Path, naming: &FileNaming) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidParameter(format!("run folder {} has no name", dir.display())))?;
        let files = naming
            .known()
            .into_iter()
            .filter_map(|k| {
                let p = dir.join(naming.file_name(k));
                p.is_file().then_some((k, p))
            })
            .collect();
        Ok(Self { name, dir: dir.to_path_buf(), files })
    }

    pub fn has(&self, kind: OutputKind) -> bool {
        self.files.contains_key(&kind)
    }

    /// Path of `kind`, or `MissingRunFile`.
    pub fn path(&self, kind: OutputKind) -> Result<&Path> {
        self.files.get(&kind).map(PathBuf::as_path).ok_or_else(|| Error::MissingRunFile {
            run: self.name.clone(),
            file: kind.to_string(),
        })
    }

    pub fn present(&self) -> impl Iterator<Item = OutputKind> + '_ {
        self.files.keys().copied()
    }

    pub fn missing(&self, naming: &FileNaming) -> Vec<OutputKind> {
        naming.expected().into_iter().filter(|k| !self.has(*k)).collect()
    }
}

/// All runs below one root folder, sorted by name.
#[derive(Debug, Clone)]
pub struct ScenarioSet {
    pub root: PathBuf,
    pub naming: FileNaming,
    pub runs: Vec<ScenarioRun>,
}

impl ScenarioSet {
    /// Every immediate subdirectory of `root` is a run.
    pub fn discover(root: &Path, naming: &FileNaming) -> Result<Self> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() {
                runs.push(ScenarioRun::open(&path, naming)?);
            }
        }
        runs.sort_by(|a, b| a.name.cmp(&b.name));
        info!(root = %root.display(), runs = runs.len(), "discovered scenario runs");
        Ok(Self { root: root.to_path_buf(), naming: naming.clone(), runs })
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioRun> {
        self.runs.iter().find(|r| r.name == name)
    }

    /// The named baseline; its absence is fatal.
    pub fn baseline(&self, name: &str) -> Result<&ScenarioRun> {
        self.get(name).ok_or_else(|| Error::MissingBaseline(name.to_string()))
    }

    /// Runs other than `baseline`.
    pub fn others<'a>(&'a self, baseline: &'a str) -> impl Iterator<Item = &'a ScenarioRun> + 'a {
        self.runs.iter().filter(move |r| r.name != baseline)
    }
}

// ── Batch execution ──────────────────────────────────────────────────────────

/// Cooperative cancellation, checked between scenario runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A unit of work left out of the results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedUnit {
    pub unit: String,
    pub reason: String,
}

/// Results of a batch plus the units that were skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport<T> {
    pub processed: Vec<T>,
    pub skipped: Vec<SkippedUnit>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self { processed: Vec::new(), skipped: Vec::new() }
    }
}

impl<T> BatchReport<T> {
    pub fn push(&mut self, item: T) {
        self.processed.push(item);
    }

    pub fn skip(&mut self, unit: impl Into<String>, reason: impl fmt::Display) {
        let unit = unit.into();
        let reason = reason.to_string();
        warn!(%unit, %reason, "skipped");
        self.skipped.push(SkippedUnit { unit, reason });
    }

    /// Record `result` for `unit`: success is kept, a recoverable error is
    /// skipped, anything else is returned.
    pub fn record(&mut self, unit: impl Into<String>, result: Result<T>) -> Result<()> {
        match result {
            Ok(v) => {
                self.push(v);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                self.skip(unit, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// As [`record`](Self::record) for a unit yielding several items.
    pub fn record_all(&mut self, unit: impl Into<String>, result: Result<Vec<T>>) -> Result<()> {
        match result {
            Ok(items) => {
                self.processed.extend(items);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                self.skip(unit, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn merge(&mut self, other: BatchReport<T>) {
        self.processed.extend(other.processed);
        self.skipped.extend(other.skipped);
    }
}

/// Run `f` over every run (in parallel with `threading`) and merge the
/// per-run reports in run order. A recoverable error skips its run; a
/// structural error aborts the batch.
pub fn for_each_run<T, F>(runs: &[&ScenarioRun], cancel: &CancelToken, f: F) -> Result<BatchReport<T>>
where
    T: Send,
    F: Fn(&ScenarioRun) -> Result<BatchReport<T>> + Sync,
{
    let one = |run: &&ScenarioRun| -> Option<Result<BatchReport<T>>> {
        if cancel.is_cancelled() {
            return None;
        }
        Some(f(run))
    };

    #[cfg(feature = "threading")]
    let outcomes: Vec<Option<Result<BatchReport<T>>>> = runs.par_iter().map(one).collect();
    #[cfg(not(feature = "threading"))]
    let outcomes: Vec<Option<Result<BatchReport<T>>>> = runs.iter().map(one).collect();

    let mut report = BatchReport::default();
    for (run, outcome) in runs.iter().zip(outcomes) {
        match outcome {
            None => report.skip(run.name.clone(), "cancelled"),
            Some(Ok(r)) => report.merge(r),
            Some(Err(e)) if e.is_recoverable() => report.skip(run.name.clone(), e),
            Some(Err(e)) => return Err(e),
        }
    }
    Ok(report)
}
