//! AOM RF-power calibration tables.
//!
//! A calibration file is a header-less CSV:
//!
//! ```text
//! max_rf_power, frac_1, frac_2, ...
//! frequency_MHz, optical_power_at_frac_1, optical_power_at_frac_2, ...
//! ...
//! ```
//!
//! `max_rf_power` is the amplitude fraction that drives the AOM at full calibrated RF power.
//! A requested power fraction `frac` maps to the amplitude code
//! `round(16383 * max_rf_power * sqrt(frac))` (RF amplitude goes as the square root of RF power),
//! and to the optical power obtained by bilinear interpolation of the table.

use std::io::Read;
use std::path::Path;

use crate::error::*;
use crate::sequence::amplitude_code;

#[derive(Clone, Debug, PartialEq)]
pub struct RfCalibration {
    max_rf_power: f64,
    fracs: Vec<f64>,
    frequencies: Vec<f64>,
    /// `powers[i][j]`: optical power at `frequencies[i]` and `fracs[j]`
    powers: Vec<Vec<f64>>,
}

fn parse_row(record: &csv::StringRecord, line: usize) -> Result<Vec<f64>> {
    record
        .iter()
        .map(|field| {
            field.trim().parse::<f64>().map_err(|_| {
                Error::Calibration(format!("line {line}: cannot parse {field:?} as a number"))
            })
        })
        .collect()
}

fn strictly_increasing(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

/// Index `i` such that `axis[i] <= x <= axis[i + 1]`, and the fractional position inside.
fn locate(axis: &[f64], x: f64) -> Option<(usize, f64)> {
    let (first, last) = (*axis.first()?, *axis.last()?);
    if !(first..=last).contains(&x) {
        return None;
    }
    if axis.len() == 1 {
        return Some((0, 0.));
    }
    let i = axis
        .windows(2)
        .position(|w| x <= w[1])
        .unwrap_or(axis.len() - 2);
    let weight = (x - axis[i]) / (axis[i + 1] - axis[i]);
    Some((i, weight))
}

impl RfCalibration {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            rows.push(parse_row(&record, line + 1)?);
        }

        let mut rows = rows.into_iter();
        let header = rows
            .next()
            .ok_or_else(|| Error::Calibration("empty calibration file".to_string()))?;
        let (&max_rf_power, fracs) = header
            .split_first()
            .ok_or_else(|| Error::Calibration("empty header row".to_string()))?;
        let fracs = fracs.to_vec();
        if fracs.is_empty() || !strictly_increasing(&fracs) {
            return Err(Error::Calibration(
                "power fractions must be present and strictly increasing".to_string(),
            ));
        }

        let mut frequencies = Vec::new();
        let mut powers = Vec::new();
        for row in rows {
            if row.len() != fracs.len() + 1 {
                return Err(Error::Calibration(format!(
                    "row for {} MHz has {} powers, expected {}",
                    row[0],
                    row.len() - 1,
                    fracs.len()
                )));
            }
            frequencies.push(row[0]);
            powers.push(row[1..].to_vec());
        }
        if frequencies.is_empty() || !strictly_increasing(&frequencies) {
            return Err(Error::Calibration(
                "frequencies must be present and strictly increasing".to_string(),
            ));
        }

        Ok(Self {
            max_rf_power,
            fracs,
            frequencies,
            powers,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn max_rf_power(&self) -> f64 {
        self.max_rf_power
    }
    pub fn fracs(&self) -> &[f64] {
        &self.fracs
    }
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Returns the amplitude code and the interpolated optical power for the power fraction
    /// `frac` at `frequency_mhz`. Requests outside the calibrated grid are errors.
    pub fn interpolate(&self, frac: f64, frequency_mhz: f64) -> Result<(u16, f64)> {
        let (j, wf) = locate(&self.fracs, frac).ok_or_else(|| {
            Error::Calibration(format!("power fraction {frac} outside the calibrated range"))
        })?;
        let (i, wq) = locate(&self.frequencies, frequency_mhz).ok_or_else(|| {
            Error::Calibration(format!("frequency {frequency_mhz} MHz outside the calibrated range"))
        })?;

        let at = |i: usize, j: usize| {
            let i = i.min(self.frequencies.len() - 1);
            let j = j.min(self.fracs.len() - 1);
            self.powers[i][j]
        };
        let low = at(i, j) * (1. - wf) + at(i, j + 1) * wf;
        let high = at(i + 1, j) * (1. - wf) + at(i + 1, j + 1) * wf;
        let power = low * (1. - wq) + high * wq;

        let code = amplitude_code(self.max_rf_power * frac.sqrt(), "RF calibration")?;
        Ok((code, power))
    }
}

/// Loads the calibration at `path` and interpolates it; see [`RfCalibration::interpolate`].
pub fn interpolate_rf_power<P: AsRef<Path>>(
    path: P,
    frac: f64,
    frequency_mhz: f64,
) -> Result<(u16, f64)> {
    RfCalibration::from_path(path)?.interpolate(frac, frequency_mhz)
}
