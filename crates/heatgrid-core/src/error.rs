//! Error taxonomy shared by every pipeline stage.
//!
//! Per-unit failures (one run, one time slot, one file) are recoverable and
//! collected into batch reports; everything else aborts the batch before
//! output is written.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Two inputs share no spatial extent.
    #[error("no spatial overlap between {subject} and the reference grid")]
    NoOverlap { subject: String },

    /// A vector source lacks every recognised value attribute.
    #[error("no value attribute found; looked for {candidates:?}")]
    MissingAttribute { candidates: Vec<String> },

    /// Edge buffer would consume the whole grid.
    #[error(
        "edge buffer {buffer} ({buffer_cells} cells) must be less than half of the smaller grid dimension ({min_dim} cells)"
    )]
    InvalidBuffer {
        buffer: f64,
        buffer_cells: usize,
        min_dim: usize,
    },

    /// An expected grid is absent from a scenario run folder.
    #[error("run `{run}` is missing {file}")]
    MissingRunFile { run: String, file: String },

    /// A baseline-relative operation named a run that does not exist.
    #[error("baseline run `{0}` not found")]
    MissingBaseline(String),

    /// Cell-wise operation on grids that do not share a georeferencing.
    #[error("incompatible grids: {0}")]
    IncompatibleGrid(String),

    #[error("unsupported coordinate reference system: {0}")]
    UnsupportedCrs(String),

    #[error("coordinate transform failed: {0}")]
    Projection(String),

    /// Meteorological input missing or outside the valid range of the comfort index.
    #[error("meteorological input: {0}")]
    Meteorology(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("malformed vector data: {0}")]
    Vector(String),

    #[error("malformed raster: {0}")]
    Raster(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl Error {
    /// True for failures scoped to a single unit of work.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MissingRunFile { .. }
                | Error::Meteorology(_)
                | Error::Raster(_)
                | Error::Io(_)
                | Error::Tiff(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
