//! Interfaces of the instruments driven by the control loops.
//!
//! Three collaborators are consumed:
//! - [`TimestampSource`]: the time-to-digital converter.
//! - [`PulseSequencer`]: the pulse-sequencer microcontroller and the DDS boards behind it.
//! - [`AnalogDigitalOut`]: digital lines (oven, shutter) and the trap-RF control voltage.
//!
//! All calls are blocking. Implementations use interior mutability so that one instrument can
//! be shared between the reader, the experiment runner and the command dispatcher through an
//! `Arc`.

use std::collections::BTreeSet;

use iontrap_backend::Pulse;

pub type HwResult<T> = std::result::Result<T, HardwareError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("{0} is busy")]
    Busy(String),

    #[error("I/O error on {device}: {msg}")]
    Io { device: String, msg: String },

    #[error("{device} did not answer within its timeout")]
    Timeout { device: String },

    #[error("{device} rejected the command: {msg}")]
    Rejected { device: String, msg: String },
}

impl HardwareError {
    /// Busy ports, I/O glitches and timeouts are worth retrying; a rejected command is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, HardwareError::Rejected { .. })
    }
}

/// One read of the converter's DMA buffer.
///
/// `tstamp` and `tchannel` may carry trailing `(0, 0)` padding beyond the `valid` genuine
/// entries; consumers strip it before use.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimestampBatch {
    pub tstamp: Vec<i64>,
    pub tchannel: Vec<u8>,
    pub valid: usize,
}

pub trait TimestampSource: Send + Sync {
    fn enable_channels(&self, channels: &BTreeSet<u8>) -> HwResult<()>;
    /// Events recorded since the previous read. With `reset` the hardware buffer is cleared.
    fn last_timestamps(&self, reset: bool) -> HwResult<TimestampBatch>;
    /// Seconds per clock tick
    fn timebase(&self) -> f64;
}

pub trait PulseSequencer: Send + Sync {
    /// Writes one single-tone profile register. `frequency` in MHz, `amplitude` as a fraction of
    /// full scale, `phase` in degrees.
    fn apply_profile(
        &self,
        board: u8,
        profile: u8,
        frequency: f64,
        amplitude: f64,
        phase: f64,
    ) -> HwResult<()>;
    /// Switches every DDS to its trapping frequency and amplitude
    fn enter_trapping_mode(&self) -> HwResult<()>;
    fn exit_trapping_mode(&self) -> HwResult<()>;
    fn write_ram(&self, board: u8, words: &[u16]) -> HwResult<()>;
    fn load_program(&self, pulses: &[Pulse], n_cycles: usize) -> HwResult<()>;
    fn start(&self) -> HwResult<()>;
    fn stop(&self) -> HwResult<()>;
    /// Level of the sequencer's run-complete line
    fn is_done(&self) -> HwResult<bool>;
}

pub trait AnalogDigitalOut: Send + Sync {
    fn set_digital_pin(&self, pin: u8, high: bool) -> HwResult<()>;
    /// Trap-RF control voltage in volts
    fn set_trap_depth(&self, voltage: f64) -> HwResult<()>;
}
