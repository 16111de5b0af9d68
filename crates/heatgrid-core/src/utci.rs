//! Universal Thermal Climate Index from mean radiant temperature.
//!
//! Bröde's 6th-order polynomial approximation (UTCI_approx v0.002, 2009) in
//! air temperature, wind speed, Tmrt - Ta and vapour pressure. Meteorology
//! comes from a whitespace-separated forcing file with one row per hour;
//! the vapour pressure deficit column may be absent and is then taken from
//! a caller-supplied backfill series. No estimate from humidity is made.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compare::run_windows;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::io::RasterStore;
use crate::scenario::{for_each_run, BatchReport, CancelToken, OutputKind, ScenarioSet};

/// Column order of the forcing file.
pub const MET_COLUMNS: [&str; 25] = [
    "iy", "id", "it", "imin", "qn", "qh", "qe", "qs", "qf", "U", "RH", "Tair", "press", "rain", "kdown", "snow",
    "ldown", "fcld", "wuh", "xsmd", "lai", "kdiff", "kdir", "wdir", "vpd",
];
const COL_HOUR: usize = 2;
const COL_WIND: usize = 9;
const COL_RH: usize = 10;
const COL_TAIR: usize = 11;
const COL_VPD: usize = 24;
/// Missing-value marker of the forcing file.
pub const MET_MISSING: f64 = -999.0;

// Validity range of the approximation.
pub const AIR_TEMP_RANGE: (f64, f64) = (-50.0, 50.0);
pub const WIND_RANGE: (f64, f64) = (0.5, 17.0);
pub const VPD_RANGE: (f64, f64) = (0.0, 50.0);
/// Tmrt must lie within [Ta - 30, Ta + 70].
pub const TMRT_OFFSET_RANGE: (f64, f64) = (-30.0, 70.0);

// ── Polynomial ───────────────────────────────────────────────────────────────

/// (coefficient, Ta power, va power, ΔTmrt power, Pa power). The leading
/// `Ta` term is added separately.
#[rustfmt::skip]
const UTCI_TERMS: [(f64, u8, u8, u8, u8); 210] = [
    (6.07562052e-01, 0, 0, 0, 0),
    (-2.27712343e-02, 1, 0, 0, 0),
    (8.06470249e-04, 2, 0, 0, 0),
    (-1.54271372e-04, 3, 0, 0, 0),
    (-3.24651735e-06, 4, 0, 0, 0),
    (7.32602852e-08, 5, 0, 0, 0),
    (1.35959073e-09, 6, 0, 0, 0),
    (-2.25836520e+00, 0, 1, 0, 0),
    (8.80326035e-02, 1, 1, 0, 0),
    (2.16844454e-03, 2, 1, 0, 0),
    (-1.53347087e-05, 3, 1, 0, 0),
    (-5.72983704e-07, 4, 1, 0, 0),
    (-2.55090145e-09, 5, 1, 0, 0),
    (-7.51269505e-01, 0, 2, 0, 0),
    (-4.08350271e-03, 1, 2, 0, 0),
    (-5.21670675e-05, 2, 2, 0, 0),
    (1.94544667e-06, 3, 2, 0, 0),
    (1.14099531e-08, 4, 2, 0, 0),
    (1.58137256e-01, 0, 3, 0, 0),
    (-6.57263143e-05, 1, 3, 0, 0),
    (2.22697524e-07, 2, 3, 0, 0),
    (-4.16117031e-08, 3, 3, 0, 0),
    (-1.27762753e-02, 0, 4, 0, 0),
    (9.66891875e-06, 1, 4, 0, 0),
    (2.52785852e-09, 2, 4, 0, 0),
    (4.56306672e-04, 0, 5, 0, 0),
    (-1.74202546e-07, 1, 5, 0, 0),
    (-5.91491269e-06, 0, 6, 0, 0),
    (3.98374029e-01, 0, 0, 1, 0),
    (1.83945314e-04, 1, 0, 1, 0),
    (-1.73754510e-04, 2, 0, 1, 0),
    (-7.60781159e-07, 3, 0, 1, 0),
    (3.77830287e-08, 4, 0, 1, 0),
    (5.43079673e-10, 5, 0, 1, 0),
    (-2.00518269e-02, 0, 1, 1, 0),
    (8.92859837e-04, 1, 1, 1, 0),
    (3.45433048e-06, 2, 1, 1, 0),
    (-3.77925774e-07, 3, 1, 1, 0),
    (-1.69699377e-09, 4, 1, 1, 0),
    (1.69992415e-04, 0, 2, 1, 0),
    (-4.99204314e-05, 1, 2, 1, 0),
    (2.47417178e-07, 2, 2, 1, 0),
    (1.07596466e-08, 3, 2, 1, 0),
    (8.49242932e-05, 0, 3, 1, 0),
    (1.35191328e-06, 1, 3, 1, 0),
    (-6.21531254e-09, 2, 3, 1, 0),
    (-4.99410301e-06, 0, 4, 1, 0),
    (-1.89489258e-08, 1, 4, 1, 0),
    (8.15300114e-08, 0, 5, 1, 0),
    (7.55043090e-04, 0, 0, 2, 0),
    (-5.65095215e-05, 1, 0, 2, 0),
    (-4.52166564e-07, 2, 0, 2, 0),
    (2.46688878e-08, 3, 0, 2, 0),
    (2.42674348e-10, 4, 0, 2, 0),
    (1.54547250e-04, 0, 1, 2, 0),
    (5.24110970e-06, 1, 1, 2, 0),
    (-8.75874982e-08, 2, 1, 2, 0),
    (-1.50743064e-09, 3, 1, 2, 0),
    (-1.56236307e-05, 0, 2, 2, 0),
    (-1.33895614e-07, 1, 2, 2, 0),
    (2.49709824e-09, 2, 2, 2, 0),
    (6.51711721e-07, 0, 3, 2, 0),
    (1.94960053e-09, 1, 3, 2, 0),
    (-1.00361113e-08, 0, 4, 2, 0),
    (-1.21206673e-05, 0, 0, 3, 0),
    (-2.18203660e-07, 1, 0, 3, 0),
    (7.51269482e-09, 2, 0, 3, 0),
    (9.79063848e-11, 3, 0, 3, 0),
    (1.25006734e-06, 0, 1, 3, 0),
    (-1.81584736e-09, 1, 1, 3, 0),
    (-3.52197671e-10, 2, 1, 3, 0),
    (-3.36514630e-08, 0, 2, 3, 0),
    (1.35908359e-10, 1, 2, 3, 0),
    (4.17032620e-10, 0, 3, 3, 0),
    (-1.30369025e-09, 0, 0, 4, 0),
    (4.13908461e-10, 1, 0, 4, 0),
    (9.22652254e-12, 2, 0, 4, 0),
    (-5.08220384e-09, 0, 1, 4, 0),
    (-2.24730961e-11, 1, 1, 4, 0),
    (1.17139133e-10, 0, 2, 4, 0),
    (6.62154879e-10, 0, 0, 5, 0),
    (4.03863260e-13, 1, 0, 5, 0),
    (1.95087203e-12, 0, 1, 5, 0),
    (-4.73602469e-12, 0, 0, 6, 0),
    (5.12733497e+00, 0, 0, 0, 1),
    (-3.12788561e-01, 1, 0, 0, 1),
    (-1.96701861e-02, 2, 0, 0, 1),
    (9.99690870e-04, 3, 0, 0, 1),
    (9.51738512e-06, 4, 0, 0, 1),
    (-4.66426341e-07, 5, 0, 0, 1),
    (5.48050612e-01, 0, 1, 0, 1),
    (-3.30552823e-03, 1, 1, 0, 1),
    (-1.64119440e-03, 2, 1, 0, 1),
    (-5.16670694e-06, 3, 1, 0, 1),
    (9.52692432e-07, 4, 1, 0, 1),
    (-4.29223622e-02, 0, 2, 0, 1),
    (5.00845667e-03, 1, 2, 0, 1),
    (1.00601257e-06, 2, 2, 0, 1),
    (-1.81748644e-06, 3, 2, 0, 1),
    (-1.25813502e-03, 0, 3, 0, 1),
    (-1.79330391e-04, 1, 3, 0, 1),
    (2.34994441e-06, 2, 3, 0, 1),
    (1.29735808e-04, 0, 4, 0, 1),
    (1.29064870e-06, 1, 4, 0, 1),
    (-2.28558686e-06, 0, 5, 0, 1),
    (-3.69476348e-02, 0, 0, 1, 1),
    (1.62325322e-03, 1, 0, 1, 1),
    (-3.14279680e-05, 2, 0, 1, 1),
    (2.59835559e-06, 3, 0, 1, 1),
    (-4.77136523e-08, 4, 0, 1, 1),
    (8.64203390e-03, 0, 1, 1, 1),
    (-6.87405181e-04, 1, 1, 1, 1),
    (-9.13863872e-06, 2, 1, 1, 1),
    (5.15916806e-07, 3, 1, 1, 1),
    (-3.59217476e-05, 0, 2, 1, 1),
    (3.28696511e-05, 1, 2, 1, 1),
    (-7.10542454e-07, 2, 2, 1, 1),
    (-1.24382300e-05, 0, 3, 1, 1),
    (-7.38584400e-09, 1, 3, 1, 1),
    (2.20609296e-07, 0, 4, 1, 1),
    (-7.32469180e-04, 0, 0, 2, 1),
    (-1.87381964e-05, 1, 0, 2, 1),
    (4.80925239e-06, 2, 0, 2, 1),
    (-8.75492040e-08, 3, 0, 2, 1),
    (2.77862930e-05, 0, 1, 2, 1),
    (-5.06004592e-06, 1, 1, 2, 1),
    (1.14325367e-07, 2, 1, 2, 1),
    (2.53016723e-06, 0, 2, 2, 1),
    (-1.72857035e-08, 1, 2, 2, 1),
    (-3.95079398e-08, 0, 3, 2, 1),
    (-3.59413173e-07, 0, 0, 3, 1),
    (7.04388046e-07, 1, 0, 3, 1),
    (-1.89309167e-08, 2, 0, 3, 1),
    (-4.79768731e-07, 0, 1, 3, 1),
    (7.96079978e-09, 1, 1, 3, 1),
    (1.62897058e-09, 0, 2, 3, 1),
    (3.94367674e-08, 0, 0, 4, 1),
    (-1.18566247e-09, 1, 0, 4, 1),
    (3.34678041e-10, 0, 1, 4, 1),
    (-1.15606447e-10, 0, 0, 5, 1),
    (-2.80626406e+00, 0, 0, 0, 2),
    (5.48712484e-01, 1, 0, 0, 2),
    (-3.99428410e-03, 2, 0, 0, 2),
    (-9.54009191e-04, 3, 0, 0, 2),
    (1.93090978e-05, 4, 0, 0, 2),
    (-3.08806365e-01, 0, 1, 0, 2),
    (1.16952364e-02, 1, 1, 0, 2),
    (4.95271903e-04, 2, 1, 0, 2),
    (-1.90710882e-05, 3, 1, 0, 2),
    (2.10787756e-03, 0, 2, 0, 2),
    (-6.98445738e-04, 1, 2, 0, 2),
    (2.30109073e-05, 2, 2, 0, 2),
    (4.17856590e-04, 0, 3, 0, 2),
    (-1.27043871e-05, 1, 3, 0, 2),
    (-3.04620472e-06, 0, 4, 0, 2),
    (5.14507424e-02, 0, 0, 1, 2),
    (-4.32510997e-03, 1, 0, 1, 2),
    (8.99281156e-05, 2, 0, 1, 2),
    (-7.14663943e-07, 3, 0, 1, 2),
    (-2.66016305e-04, 0, 1, 1, 2),
    (2.63789586e-04, 1, 1, 1, 2),
    (-7.01199003e-06, 2, 1, 1, 2),
    (-1.06823306e-04, 0, 2, 1, 2),
    (3.61341136e-06, 1, 2, 1, 2),
    (2.29748967e-07, 0, 3, 1, 2),
    (3.04788893e-04, 0, 0, 2, 2),
    (-6.42070836e-05, 1, 0, 2, 2),
    (1.16257971e-06, 2, 0, 2, 2),
    (7.68023384e-06, 0, 1, 2, 2),
    (-5.47446896e-07, 1, 1, 2, 2),
    (-3.59937910e-08, 0, 2, 2, 2),
    (-4.36497725e-06, 0, 0, 3, 2),
    (1.68737969e-07, 1, 0, 3, 2),
    (2.67489271e-08, 0, 1, 3, 2),
    (3.23926897e-09, 0, 0, 4, 2),
    (-3.53874123e-02, 0, 0, 0, 3),
    (-2.21201190e-01, 1, 0, 0, 3),
    (1.55126038e-02, 2, 0, 0, 3),
    (-2.63917279e-04, 3, 0, 0, 3),
    (4.53433455e-02, 0, 1, 0, 3),
    (-4.32943862e-03, 1, 1, 0, 3),
    (1.45389826e-04, 2, 1, 0, 3),
    (2.17508610e-04, 0, 2, 0, 3),
    (-6.66724702e-05, 1, 2, 0, 3),
    (3.33217140e-05, 0, 3, 0, 3),
    (-2.26921615e-03, 0, 0, 1, 3),
    (3.80261982e-04, 1, 0, 1, 3),
    (-5.45314314e-09, 2, 0, 1, 3),
    (-7.96355448e-04, 0, 1, 1, 3),
    (2.53458034e-05, 1, 1, 1, 3),
    (-6.31223658e-06, 0, 2, 1, 3),
    (3.02122035e-04, 0, 0, 2, 3),
    (-4.77403547e-06, 1, 0, 2, 3),
    (1.73825715e-06, 0, 1, 2, 3),
    (-4.09087898e-07, 0, 0, 3, 3),
    (6.14155345e-01, 0, 0, 0, 4),
    (-6.16755931e-02, 1, 0, 0, 4),
    (1.33374846e-03, 2, 0, 0, 4),
    (3.55375387e-03, 0, 1, 0, 4),
    (-5.13027851e-04, 1, 1, 0, 4),
    (1.02449757e-04, 0, 2, 0, 4),
    (-1.48526421e-03, 0, 0, 1, 4),
    (-4.11469183e-05, 1, 0, 1, 4),
    (-6.80434415e-06, 0, 1, 1, 4),
    (-9.77675906e-06, 0, 0, 2, 4),
    (8.82773108e-02, 0, 0, 0, 5),
    (-3.01859306e-03, 1, 0, 0, 5),
    (1.04452989e-03, 0, 1, 0, 5),
    (2.47090539e-04, 0, 0, 1, 5),
    (1.48348065e-03, 0, 0, 0, 6),
];

/// Saturation vapour pressure over water (hPa), Magnus form.
pub fn saturation_vapour_pressure(t: f64) -> f64 {
    6.1078 * 10f64.powf(7.5 * t / (t + 237.3))
}

/// Actual vapour pressure (hPa) from air temperature and deficit.
pub fn vapour_pressure(t: f64, vpd: f64) -> f64 {
    saturation_vapour_pressure(t) - vpd
}

/// Powers 0..=6 of `x`.
fn powers(x: f64) -> [f64; 7] {
    let mut p = [1.0; 7];
    for i in 1..7 {
        p[i] = p[i - 1] * x;
    }
    p
}

/// UTCI as a polynomial in ΔTmrt for fixed Ta, va and vapour pressure.
/// `coeffs[k]` multiplies ΔTmrt^k; the Ta term is folded into `coeffs[0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct UtciPolynomial {
    coeffs: [f64; 7],
}

impl UtciPolynomial {
    fn new(ta: f64, ehpa: f64, va: f64) -> Self {
        let (ta_p, va_p, pa_p) = (powers(ta), powers(va), powers(ehpa / 10.0));
        let mut coeffs = [0.0; 7];
        coeffs[0] = ta;
        for &(c, i, j, k, l) in UTCI_TERMS.iter() {
            coeffs[k as usize] += c * ta_p[i as usize] * va_p[j as usize] * pa_p[l as usize];
        }
        Self { coeffs }
    }

    #[inline]
    fn eval(&self, d_tmrt: f64) -> f64 {
        self.coeffs.iter().rev().fold(0.0, |acc, &c| acc * d_tmrt + c)
    }
}

/// UTCI (°C) of a single set of inputs. No range checking.
pub fn utci(ta: f64, ehpa: f64, va: f64, tmrt: f64) -> f64 {
    UtciPolynomial::new(ta, ehpa, va).eval(tmrt - ta)
}

// ── Meteorology ──────────────────────────────────────────────────────────────

/// One hourly row of the forcing file. Missing values are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetRecord {
    pub hour: u8,
    pub air_temp: Option<f64>,
    pub wind_speed: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub vpd: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetTable {
    pub records: Vec<MetRecord>,
}

fn met_value(fields: &[&str], col: usize, line: usize) -> Result<Option<f64>> {
    let Some(raw) = fields.get(col) else {
        return Ok(None);
    };
    let v: f64 = raw
        .parse()
        .map_err(|_| Error::Meteorology(format!("line {line}: column {} is not a number: '{raw}'", MET_COLUMNS[col])))?;
    Ok((v != MET_MISSING && v.is_finite()).then_some(v))
}

impl MetTable {
    /// Parse forcing-file text. The first line is a header; blank lines
    /// are ignored. Rows may stop before the `vpd` column.
    pub fn parse(text: &str) -> Result<Self> {
        let mut records = Vec::new();
        for (i, line) in text.lines().enumerate().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() <= COL_TAIR {
                return Err(Error::Meteorology(format!(
                    "line {}: {} columns, need at least {}",
                    i + 1,
                    fields.len(),
                    COL_TAIR + 1
                )));
            }
            let hour = met_value(&fields, COL_HOUR, i + 1)?
                .filter(|h| (0.0..24.0).contains(h) && h.fract() == 0.0)
                .ok_or_else(|| Error::Meteorology(format!("line {}: invalid hour '{}'", i + 1, fields[COL_HOUR])))?;
            records.push(MetRecord {
                hour: hour as u8,
                air_temp: met_value(&fields, COL_TAIR, i + 1)?,
                wind_speed: met_value(&fields, COL_WIND, i + 1)?,
                relative_humidity: met_value(&fields, COL_RH, i + 1)?,
                vpd: met_value(&fields, COL_VPD, i + 1)?,
            });
        }
        debug!(rows = records.len(), "parsed meteorological forcing");
        Ok(Self { records })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// First row for `hour`.
    pub fn at_hour(&self, hour: u8) -> Result<&MetRecord> {
        self.records
            .iter()
            .find(|r| r.hour == hour)
            .ok_or_else(|| Error::Meteorology(format!("no meteorological data for hour {hour}")))
    }
}

/// Hour -> vapour pressure deficit (hPa) used where the forcing file has none.
pub type VpdBackfill = BTreeMap<u8, f64>;

/// Row for the backfill CSV (`hour,vpd`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VpdRow {
    pub hour: u8,
    pub vpd: f64,
}

pub fn backfill_from_rows(rows: &[VpdRow]) -> VpdBackfill {
    rows.iter().map(|r| (r.hour, r.vpd)).collect()
}

/// Checked inputs for one hour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetConditions {
    pub hour: u8,
    pub air_temp: f64,
    pub wind_speed: f64,
    pub vpd: f64,
    pub vapour_pressure: f64,
}

fn check_range(name: &str, v: f64, (lo, hi): (f64, f64)) -> Result<f64> {
    if (lo..=hi).contains(&v) {
        Ok(v)
    } else {
        Err(Error::Meteorology(format!("{name} {v} outside [{lo}, {hi}]")))
    }
}

impl MetConditions {
    pub fn for_hour(met: &MetTable, hour: u8, backfill: &VpdBackfill) -> Result<Self> {
        let row = met.at_hour(hour)?;
        let missing = |what: &str| Error::Meteorology(format!("{what} missing for hour {hour}"));
        let air_temp = check_range("air temperature", row.air_temp.ok_or_else(|| missing("Tair"))?, AIR_TEMP_RANGE)?;
        let wind_speed = check_range("wind speed", row.wind_speed.ok_or_else(|| missing("U"))?, WIND_RANGE)?;
        let vpd = row
            .vpd
            .or_else(|| backfill.get(&hour).copied())
            .ok_or_else(|| missing("vpd (no backfill given)"))?;
        let vpd = check_range("vapour pressure deficit", vpd, VPD_RANGE)?;
        Ok(Self {
            hour,
            air_temp,
            wind_speed,
            vpd,
            vapour_pressure: vapour_pressure(air_temp, vpd),
        })
    }
}

// ── Grids ────────────────────────────────────────────────────────────────────

/// UTCI of every valid Tmrt cell. Fails if any valid cell lies outside
/// the approximation's Tmrt range; nodata stays nodata.
pub fn utci_grid(tmrt: &Grid, met: &MetConditions) -> Result<Grid> {
    let (lo, hi) = (met.air_temp + TMRT_OFFSET_RANGE.0, met.air_temp + TMRT_OFFSET_RANGE.1);
    if let Some(bad) = tmrt.valid_values().map(f64::from).find(|v| !(lo..=hi).contains(v)) {
        return Err(Error::Meteorology(format!(
            "Tmrt {bad} outside [{lo}, {hi}] for air temperature {}",
            met.air_temp
        )));
    }
    let poly = UtciPolynomial::new(met.air_temp, met.vapour_pressure, met.wind_speed);
    Ok(tmrt.map_valid(|t| poly.eval(f64::from(t) - met.air_temp) as f32))
}

/// One written UTCI grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtciOutput {
    pub run: String,
    pub hour: u8,
    pub path: String,
    pub mean_utci: Option<f64>,
}

/// Convert each run's hourly Tmrt grids, cropped by `edge_buffer`, into
/// `<out_root>/<run>/UTCI_<HH>.tif`.
pub fn utci_for_runs(
    store: &dyn RasterStore,
    set: &ScenarioSet,
    met: &MetTable,
    backfill: &VpdBackfill,
    edge_buffer: f64,
    out_root: &Path,
    cancel: &CancelToken,
) -> Result<BatchReport<UtciOutput>> {
    let hours = set.naming.hours.clone();
    let tmrt_kinds: Vec<OutputKind> = hours.iter().map(|&h| OutputKind::Tmrt(h)).collect();

    let mut report = BatchReport::default();
    let (runs, windows) = run_windows(store, set, None, &tmrt_kinds, edge_buffer, &mut report)?;
    let batch = for_each_run(&runs, cancel, |run| {
        let window = windows[run.name.as_str()];
        let mut r = BatchReport::default();
        for &h in &hours {
            let out = (|| -> Result<UtciOutput> {
                let path = run.path(OutputKind::Tmrt(h))?;
                let conditions = MetConditions::for_hour(met, h, backfill)?;
                let tmrt = store.read(path)?.crop_to_bounds(&window)?;
                let utci = utci_grid(&tmrt, &conditions)?;
                let out_path = out_root.join(&run.name).join(set.naming.file_name(OutputKind::Utci(h)));
                store.write(&utci, &out_path)?;
                let n = utci.valid_count();
                let mean = (n > 0).then(|| utci.valid_values().map(f64::from).sum::<f64>() / n as f64);
                Ok(UtciOutput {
                    run: run.name.clone(),
                    hour: h,
                    path: out_path.display().to_string(),
                    mean_utci: mean,
                })
            })();
            r.record(format!("{}_{h}", run.name), out)?;
        }
        Ok(r)
    })?;
    report.merge(batch);
    info!(written = report.processed.len(), skipped = report.skipped.len(), "UTCI grids");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::tests::MemStore;
    use crate::grid::tests::metric_grid;
    use crate::scenario::FileNaming;
    use approx::assert_abs_diff_eq;

    const HEADER: &str = "%iy id it imin qn qh qe qs qf U RH Tair press rain kdown snow ldown fcld wuh xsmd lai kdiff kdir wdir vpd";

    fn met_line(hour: u8, wind: f64, tair: f64, vpd: Option<f64>) -> String {
        let mut s = format!(
            "2023 189 {hour} 0 -999 -999 -999 -999 -999 {wind} 45 {tair} 101.3 0 800 -999 -999 -999 -999 -999 -999 -999 -999 180"
        );
        if let Some(v) = vpd {
            s.push_str(&format!(" {v}"));
        }
        s
    }

    fn forcing() -> MetTable {
        let text = [
            HEADER.to_string(),
            met_line(12, 2.0, 30.0, Some(10.0)),
            met_line(15, 2.0, 30.0, None),
            met_line(18, 0.2, 25.0, Some(5.0)),
        ]
        .join("\n");
        MetTable::parse(&text).unwrap()
    }

    #[test]
    fn polynomial_matches_reference_values() {
        // Reference values from a direct evaluation of all 211 terms.
        assert_abs_diff_eq!(utci(30.0, vapour_pressure(30.0, 10.0), 2.0, 55.0), 37.89564574, epsilon = 1e-6);
        assert_abs_diff_eq!(utci(10.0, vapour_pressure(10.0, 3.0), 1.0, 30.0), 17.55233266, epsilon = 1e-6);
        assert_abs_diff_eq!(utci(20.0, vapour_pressure(20.0, 11.7), 0.5, 20.0), 19.84462987, epsilon = 1e-6);
    }

    #[test]
    fn saturation_pressure_at_30c() {
        assert_abs_diff_eq!(vapour_pressure(30.0, 10.0), 32.426348, epsilon = 1e-5);
    }

    #[test]
    fn parses_forcing_and_marks_missing_values() {
        let met = forcing();
        assert_eq!(met.records.len(), 3);
        let noon = met.at_hour(12).unwrap();
        assert_eq!(noon.air_temp, Some(30.0));
        assert_eq!(noon.wind_speed, Some(2.0));
        assert_eq!(noon.vpd, Some(10.0));
        assert_eq!(met.at_hour(15).unwrap().vpd, None);
        assert!(matches!(met.at_hour(9), Err(Error::Meteorology(_))));
    }

    #[test]
    fn missing_vpd_needs_backfill() {
        let met = forcing();
        assert!(matches!(MetConditions::for_hour(&met, 15, &VpdBackfill::new()), Err(Error::Meteorology(_))));
        let backfill = backfill_from_rows(&[VpdRow { hour: 15, vpd: 12.0 }]);
        let c = MetConditions::for_hour(&met, 15, &backfill).unwrap();
        assert_eq!(c.vpd, 12.0);
    }

    #[test]
    fn out_of_range_inputs_are_rejected() {
        let met = forcing();
        let err = MetConditions::for_hour(&met, 18, &VpdBackfill::new()).unwrap_err();
        assert!(err.to_string().contains("wind speed"), "got {err}");

        let ok = MetConditions::for_hour(&met, 12, &VpdBackfill::new()).unwrap();
        let mut tmrt = metric_grid(3, 3, 55.0);
        tmrt.set(1, 1, 120.0);
        assert!(matches!(utci_grid(&tmrt, &ok), Err(Error::Meteorology(_))));
    }

    #[test]
    fn utci_grid_keeps_nodata() {
        let met = forcing();
        let c = MetConditions::for_hour(&met, 12, &VpdBackfill::new()).unwrap();
        let mut tmrt = metric_grid(2, 1, 55.0);
        tmrt.set(0, 1, tmrt.nodata);
        let u = utci_grid(&tmrt, &c).unwrap();
        assert_abs_diff_eq!(u.get(0, 0), 37.895645, epsilon = 1e-3);
        assert!(!u.is_valid(0, 1));
    }

    #[test]
    fn short_rows_are_an_error() {
        let text = format!("{HEADER}\n2023 189 12 0 1");
        assert!(matches!(MetTable::parse(&text), Err(Error::Meteorology(_))));
    }

    #[test]
    fn runs_are_converted_hour_by_hour() {
        let store = MemStore::default();
        let tmp = tempfile::tempdir().unwrap();
        let naming = FileNaming::default();
        for run in ["local", "global"] {
            for &h in &naming.hours {
                let path = tmp.path().join("in").join(run).join(naming.file_name(OutputKind::Tmrt(h)));
                store.put(path, metric_grid(10, 10, 55.0));
            }
        }
        let set = ScenarioSet::discover(&tmp.path().join("in"), &naming).unwrap();
        let out = tmp.path().join("utci");
        let backfill = backfill_from_rows(&[VpdRow { hour: 15, vpd: 10.0 }]);
        let report = utci_for_runs(&store, &set, &forcing(), &backfill, 2.0, &out, &CancelToken::new()).unwrap();

        // 18:00 wind is out of range for both runs.
        assert_eq!(report.processed.len(), 4);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().all(|s| s.unit.ends_with("_18")));
        let g = store.get(&out.join("global").join("UTCI_15.tif")).unwrap();
        assert_eq!((g.width, g.height), (6, 6));
        assert_abs_diff_eq!(g.get(0, 0), 37.895645, epsilon = 1e-3);
    }
}
