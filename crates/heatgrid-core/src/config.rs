//! Pipeline configuration.
//!
//! Every tunable lives in [`PipelineConfig`], loadable from JSON. Missing
//! keys fall back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::accuracy::ValidationConfig;
use crate::aggregate::AggregationConfig;
use crate::cluster::ClusterParams;
use crate::error::{Error, Result};
use crate::fill::FillParams;
use crate::scenario::FileNaming;

pub use crate::cluster::{DEFAULT_EPS, DEFAULT_MIN_AREA_M2, DEFAULT_MIN_SAMPLES};
pub use crate::fill::{DEFAULT_IDW_NEIGHBOURS, DEFAULT_IDW_POWER};

/// Cell size of prepared model inputs, map units.
pub const DEFAULT_RESOLUTION: f64 = 1.0;
/// Trimmed from every edge of scenario grids before statistics, map units.
pub const DEFAULT_EDGE_BUFFER: f64 = 500.0;
pub const DEFAULT_ZSCORE_THRESHOLD: f64 = 3.0;
pub const DEFAULT_AGGREGATION_RESOLUTIONS: [f64; 5] = [5.0, 10.0, 15.0, 25.0, 30.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub resolution: f64,
    pub edge_buffer: f64,
    /// Run that every other run is compared against.
    pub baseline: Option<String>,
    pub cluster: ClusterParams,
    pub fill: FillParams,
    pub aggregation: AggregationConfig,
    pub validation: ValidationConfig,
    pub naming: FileNaming,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            edge_buffer: DEFAULT_EDGE_BUFFER,
            baseline: None,
            cluster: ClusterParams::default(),
            fill: FillParams::default(),
            aggregation: AggregationConfig::default(),
            validation: ValidationConfig::default(),
            naming: FileNaming::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Structural checks; run before any output is written.
    pub fn validate(&self) -> Result<()> {
        if !(self.resolution > 0.0) {
            return Err(Error::InvalidParameter(format!("resolution must be > 0, got {}", self.resolution)));
        }
        if !(self.edge_buffer >= 0.0) || !self.edge_buffer.is_finite() {
            return Err(Error::InvalidParameter(format!("edge buffer must be >= 0, got {}", self.edge_buffer)));
        }
        if self.baseline.as_deref().is_some_and(|b| b.trim().is_empty()) {
            return Err(Error::InvalidParameter("baseline run name is empty".into()));
        }
        if self.naming.hours.is_empty() {
            return Err(Error::InvalidParameter("file naming needs at least one hour".into()));
        }
        if let Some(h) = self.naming.hours.iter().find(|h| **h > 23) {
            return Err(Error::InvalidParameter(format!("hour {h} is not a time of day")));
        }
        self.cluster.validate()?;
        self.fill.validate()?;
        self.aggregation.validate()?;
        self.validation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.resolution, 1.0);
        assert_eq!(c.edge_buffer, 500.0);
        assert_eq!(c.baseline, None);
        assert_eq!(c.cluster.eps, 1.0);
        assert_eq!(c.cluster.min_samples, 50);
        assert_eq!(c.cluster.min_area_m2, 4.0);
        assert_eq!(c.validation.zscore_threshold, 3.0);
        assert_eq!(c.aggregation.resolutions, vec![5.0, 10.0, 15.0, 25.0, 30.0]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let c = PipelineConfig::from_json_str(
            r#"{ "edge_buffer": 100, "baseline": "local", "cluster": { "min_samples": 10 },
                 "aggregation": { "methods": ["average", "mode"] } }"#,
        )
        .unwrap();
        assert_eq!(c.edge_buffer, 100.0);
        assert_eq!(c.baseline.as_deref(), Some("local"));
        assert_eq!(c.cluster.min_samples, 10);
        assert_eq!(c.cluster.eps, DEFAULT_EPS);
        assert_eq!(c.aggregation.resolutions.len(), 5);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heatgrid.json");
        std::fs::write(&path, r#"{ "resolution": 0.5 }"#).unwrap();
        assert_eq!(PipelineConfig::from_json_file(&path).unwrap().resolution, 0.5);
        assert!(PipelineConfig::from_json_file(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut c = PipelineConfig::default();
        c.naming.hours.clear();
        assert!(c.validate().is_err());

        let c = PipelineConfig { edge_buffer: -1.0, ..Default::default() };
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.fill.neighbours = 0;
        assert!(matches!(c.validate(), Err(Error::InvalidParameter(_))));

        assert!(PipelineConfig::from_json_str(r#"{ "resolution": "one" }"#).is_err());
    }
}
