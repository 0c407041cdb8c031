//! Hardware-independent core of the ion-trap timestamp control stack.
//!
//! - [`channel`] and [`reader`]: the eight converter inputs, their modes, and the reader mode
//!   state machine that decides which inputs are enabled.
//! - [`count_rate`]: padding removal and count-rate tallies for the counting loop.
//! - [`time_diff`]: trigger-relative arrival times and per-run fluorescence gating.
//! - [`rf_fit`]: histogram and sine fit of RF-correlation data.
//! - [`sequence`]: pulse-sequence sections, DDS RAM arrays and the sequencer program.
//! - [`calibration`]: AOM RF-power calibration tables.
//!
//! Hardware access lives in `iontrapctrl_backend`; everything here is deterministic and can be
//! exercised without instruments. With the `python` feature the pure algorithms are also
//! exported as a Python extension module.

pub mod calibration;
pub mod channel;
pub mod count_rate;
pub mod error;
pub mod reader;
pub mod rf_fit;
pub mod sequence;
pub mod time_diff;
pub mod utils;

#[cfg(feature = "python")]
pub mod python;

pub use calibration::*;
pub use channel::*;
pub use count_rate::*;
pub use error::*;
pub use reader::*;
pub use rf_fit::*;
pub use sequence::*;
pub use time_diff::*;
pub use utils::*;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn iontrap_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    python::register(m)?;
    Ok(())
}
