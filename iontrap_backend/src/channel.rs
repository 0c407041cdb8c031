//! Implements the model of one physical input of the time-to-digital converter. See
//! [`BaseChannel`] for implementation details.
//!
//! ## Modes
//! Every input is assigned a [`ChannelMode`] describing what is wired to it: a fast (PMT-style)
//! fluorescence detector, a single-photon detector, the RF-drive reference of the trap, the
//! run-start trigger of the pulse sequencer, or nothing at all (`idle`).
//!
//! ## Buffers
//! A channel keeps two time-difference buffers:
//! - `recent_time_diffs` holds the trigger-relative arrival times of the run processed last. It is
//!   refilled every processing cycle, and the caller either commits it with
//!   [`BaseChannel::commit_recent`] or drops it with [`BaseChannel::discard_recent`].
//! - `time_diffs` is the append-only accumulation of every committed run.
//!
//! The rolling `counts` buffer stores count-rate samples produced by the counting loop and is
//! bounded by the reader's window length.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Number of physical inputs on the time-to-digital converter.
pub const NUM_CHANNELS: u8 = 8;

/// What is electrically connected to a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    Idle,
    /// Fast fluorescence detector (PMT-style)
    SignalF,
    /// Single-photon detector
    SignalSp,
    /// RF-drive reference
    Trap,
    /// Run-start reference emitted by the pulse sequencer
    Trigger,
}

impl ChannelMode {
    pub fn is_signal(&self) -> bool {
        matches!(self, ChannelMode::SignalF | ChannelMode::SignalSp)
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ChannelMode::Idle => "idle",
                ChannelMode::SignalF => "signal-f",
                ChannelMode::SignalSp => "signal-sp",
                ChannelMode::Trap => "trap",
                ChannelMode::Trigger => "trigger",
            }
        )
    }
}

pub trait BaseChannel {
    // Field methods
    fn name(&self) -> &str;
    fn number(&self) -> u8;
    fn mode(&self) -> ChannelMode;
    fn initial_mode(&self) -> ChannelMode;
    fn active(&self) -> bool;
    fn recent_time_diffs(&self) -> &Vec<f64>;
    fn time_diffs(&self) -> &Vec<f64>;
    fn counts(&self) -> &VecDeque<f64>;
    // Mutable field references
    fn mode_(&mut self) -> &mut ChannelMode;
    fn active_(&mut self) -> &mut bool;
    fn recent_time_diffs_(&mut self) -> &mut Vec<f64>;
    fn time_diffs_(&mut self) -> &mut Vec<f64>;
    fn counts_(&mut self) -> &mut VecDeque<f64>;

    fn is_signal(&self) -> bool {
        self.mode().is_signal()
    }

    /// Reassigns the mode. The electrical enable flag follows the mode (`mode != idle`)
    /// until the next reader transition narrows it.
    fn set_mode(&mut self, mode: ChannelMode) {
        *self.mode_() = mode;
        *self.active_() = mode != ChannelMode::Idle;
    }

    fn set_active(&mut self, active: bool) {
        *self.active_() = active;
    }

    /// Appends a count-rate sample, dropping the oldest ones beyond `window` entries.
    fn push_count(&mut self, rate: f64, window: usize) {
        let counts = self.counts_();
        counts.push_back(rate);
        while counts.len() > window {
            counts.pop_front();
        }
    }

    fn trim_counts(&mut self, window: usize) {
        let counts = self.counts_();
        while counts.len() > window {
            counts.pop_front();
        }
    }

    fn clear_counts(&mut self) {
        self.counts_().clear();
    }

    /// Replaces the per-run buffer with the differences of the run processed last
    fn set_recent(&mut self, diffs: Vec<f64>) {
        *self.recent_time_diffs_() = diffs;
    }

    /// Accepts the last run: moves `recent_time_diffs` into `time_diffs`.
    fn commit_recent(&mut self) {
        let recent = std::mem::take(self.recent_time_diffs_());
        self.time_diffs_().extend(recent);
    }

    /// Rejects the last run without touching the accumulated differences.
    fn discard_recent(&mut self) {
        self.recent_time_diffs_().clear();
    }

    fn clear_time_diffs(&mut self) {
        self.recent_time_diffs_().clear();
        self.time_diffs_().clear();
    }
}

#[derive(Clone, Debug)]
pub struct Channel {
    name: String,
    number: u8,
    mode: ChannelMode,
    initial_mode: ChannelMode,
    active: bool,
    recent_time_diffs: Vec<f64>,
    time_diffs: Vec<f64>,
    counts: VecDeque<f64>,
}

impl BaseChannel for Channel {
    fn name(&self) -> &str {
        &self.name
    }
    fn number(&self) -> u8 {
        self.number
    }
    fn mode(&self) -> ChannelMode {
        self.mode
    }
    fn initial_mode(&self) -> ChannelMode {
        self.initial_mode
    }
    fn active(&self) -> bool {
        self.active
    }
    fn recent_time_diffs(&self) -> &Vec<f64> {
        &self.recent_time_diffs
    }
    fn time_diffs(&self) -> &Vec<f64> {
        &self.time_diffs
    }
    fn counts(&self) -> &VecDeque<f64> {
        &self.counts
    }
    fn mode_(&mut self) -> &mut ChannelMode {
        &mut self.mode
    }
    fn active_(&mut self) -> &mut bool {
        &mut self.active
    }
    fn recent_time_diffs_(&mut self) -> &mut Vec<f64> {
        &mut self.recent_time_diffs
    }
    fn time_diffs_(&mut self) -> &mut Vec<f64> {
        &mut self.time_diffs
    }
    fn counts_(&mut self) -> &mut VecDeque<f64> {
        &mut self.counts
    }
}

impl Channel {
    pub fn new(name: &str, number: u8, mode: ChannelMode) -> Self {
        Self {
            name: name.to_string(),
            number,
            mode,
            initial_mode: mode,
            active: mode != ChannelMode::Idle,
            recent_time_diffs: Vec::new(),
            time_diffs: Vec::new(),
            counts: VecDeque::new(),
        }
    }
}
