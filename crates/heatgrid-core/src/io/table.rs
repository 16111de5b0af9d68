//! CSV tables for non-spatial results: one serialized row per record.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut w = csv::Writer::from_path(path)?;
    for row in rows {
        w.serialize(row)?;
    }
    w.flush()?;
    Ok(())
}

/// Rows of a headed CSV file, matched to `T` by column name.
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut r = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let rows = r.deserialize().collect::<std::result::Result<Vec<T>, _>>()?;
    Ok(rows)
}
