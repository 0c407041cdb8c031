//! Error taxonomy shared by every module of the backend.
//!
//! Only configuration and safety faults are errors. "No data" outcomes (an empty timestamp
//! buffer, an empty RF-correlation histogram) are ordinary return values.

use crate::channel::ChannelMode;
use crate::reader::ReaderMode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Channel number {0} is outside the physical range 0-7")]
    ChannelOutOfRange(u8),

    #[error("Channels {first} and {second} are both assigned mode {mode}; at most one is allowed")]
    DuplicateMode {
        mode: ChannelMode,
        first: u8,
        second: u8,
    },

    #[error("Cannot enter {target} mode while the reader is in {current} mode")]
    ForbiddenTransition {
        current: ReaderMode,
        target: ReaderMode,
    },

    #[error("No channel is assigned mode {0}")]
    MissingChannel(ChannelMode),

    #[error("RAM array for DDS {device} holds {len} words, exceeding the {max}-word hardware limit")]
    RamOverflow {
        device: String,
        len: usize,
        max: usize,
    },

    #[error("DDS profile index {0} is out of range 0-7")]
    ProfileOutOfRange(u8),

    #[error("Amplitude {value} requested by {origin} is outside [0, 1]")]
    AmplitudeOutOfRange { origin: String, value: f64 },

    #[error("Trap depth {0} V is outside the permitted range of ±3 V")]
    TrapDepthOutOfRange(f64),

    #[error("Calibration: {0}")]
    Calibration(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
