//! Errors of the control layer. Backend configuration errors and hardware faults are wrapped so
//! that callers match on a single type.

use crate::hardware::HardwareError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] iontrap_backend::Error),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Hardware control is currently held by {owner}")]
    HardwareBusy { owner: String },

    #[error("Oven pin {pin} could not be driven low: {source}")]
    OvenPinStuck { pin: u8, source: HardwareError },

    #[error("Timed out after {seconds} s waiting for {what}")]
    Timeout { what: String, seconds: f64 },

    #[error("Configuration: {0}")]
    Config(String),

    #[error("Worker thread panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
