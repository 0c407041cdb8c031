//! Python bindings of the pure algorithms, for offline analysis of saved timestamp data.

use numpy::PyArray1;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::count_rate;
use crate::error::Error;
use crate::{calibration, rf_fit, time_diff};

impl From<Error> for PyErr {
    fn from(err: Error) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

/// Trigger-relative arrival times per signal channel, as a dict of numpy arrays.
#[pyfunction]
pub fn time_diffs(
    py: Python,
    tstamp: Vec<f64>,
    tchannel: Vec<u8>,
    trig_chan: u8,
    signal_chans: Vec<u8>,
    sequence_length: f64,
) -> PyResult<PyObject> {
    let diffs =
        time_diff::compute_time_diffs(&tstamp, &tchannel, trig_chan, &signal_chans, sequence_length);
    let dict = PyDict::new(py);
    for (chan, values) in diffs {
        dict.set_item(chan, PyArray1::from_vec(py, values))?;
    }
    Ok(dict.to_object(py))
}

/// Removes the trailing zero padding of a raw converter buffer.
#[pyfunction]
pub fn strip_padding(py: Python, tstamp: Vec<i64>, tchannel: Vec<u8>) -> (PyObject, PyObject) {
    let (ts, tc) = count_rate::strip_padding(&tstamp, &tchannel);
    (
        PyArray1::from_slice(py, ts).to_object(py),
        PyArray1::from_slice(py, tc).to_object(py),
    )
}

/// Returns `(params, histogram, bin_edges)`; `params` is `(amplitude, frequency, phase, offset)`
/// or `None` without usable data.
#[pyfunction]
pub fn rf_correlation_fit(
    py: Python,
    diffs: Vec<f64>,
    no_bins: usize,
) -> (Option<(f64, f64, f64, f64)>, PyObject, PyObject) {
    let result = rf_fit::fit_rf_correlation(&diffs, no_bins);
    let params = result
        .fit
        .map(|fit| (fit.amplitude, fit.frequency, fit.phase, fit.offset));
    (
        params,
        PyArray1::from_vec(py, result.histogram).to_object(py),
        PyArray1::from_vec(py, result.bin_edges).to_object(py),
    )
}

#[pyfunction]
pub fn interpolate_rf_power(path: &str, frac: f64, frequency: f64) -> PyResult<(u16, f64)> {
    Ok(calibration::interpolate_rf_power(path, frac, frequency)?)
}

pub fn register(m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(time_diffs, m)?)?;
    m.add_function(wrap_pyfunction!(strip_padding, m)?)?;
    m.add_function(wrap_pyfunction!(rf_correlation_fit, m)?)?;
    m.add_function(wrap_pyfunction!(interpolate_rf_power, m)?)?;
    Ok(())
}
