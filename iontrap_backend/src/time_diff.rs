//! Time-difference engine.
//!
//! Each pulse-sequence run emits exactly one pulse on the trigger channel when it starts. Detector
//! events only mean something relative to the start of the run they belong to, so the absolute
//! event stream is converted into trigger-relative arrival times:
//!
//! ```text
//! trigger     |                     |                     |
//! signal        x    x        x        x      x
//!             <-- sequence_length -->
//! ```
//!
//! Each signal event is attributed at most once, to the most recent trigger before it, and only
//! if it falls inside `[t_trig, t_trig + sequence_length)`. Signal events that precede every
//! trigger are dropped.
//!
//! The same walk, with an unbounded window and the RF reference as "trigger", yields the raw
//! offsets used by the RF-correlation fitter.
//!
//! [`RunGate`] classifies each trigger window as valid or invalid from its observed fluorescence,
//! separating runs where the ion was present and cooled from runs where it was not.

use indexmap::IndexMap;

/// Computes, for each channel of `signal_chans`, the elapsed time of its events since the last
/// `trig_chan` event, restricted to `sequence_length`.
///
/// The result has one entry per requested channel, in the order of `signal_chans`. Events are
/// expected in time order.
///
/// # Example
/// ```
/// use iontrap_backend::time_diff::compute_time_diffs;
///
/// let tstamp = [0., 3., 4., 5., 7., 8., 11.6, 12.];
/// let tchannel = [1, 2, 1, 3, 2, 1, 2, 1];
/// let diffs = compute_time_diffs(&tstamp, &tchannel, 1, &[2, 3], 4.);
/// assert_eq!(diffs[&3], vec![1.]);
/// assert_eq!(diffs[&2].len(), 3);
/// ```
pub fn compute_time_diffs(
    tstamp: &[f64],
    tchannel: &[u8],
    trig_chan: u8,
    signal_chans: &[u8],
    sequence_length: f64,
) -> IndexMap<u8, Vec<f64>> {
    let mut diffs: IndexMap<u8, Vec<f64>> =
        signal_chans.iter().map(|&chan| (chan, Vec::new())).collect();
    let mut last_trigger: Option<f64> = None;

    for (&t, chan) in tstamp.iter().zip(tchannel) {
        if *chan == trig_chan {
            last_trigger = Some(t);
            continue;
        }
        let (Some(trigger), Some(chan_diffs)) = (last_trigger, diffs.get_mut(chan)) else {
            continue;
        };
        let diff = t - trigger;
        if (0. ..sequence_length).contains(&diff) {
            chan_diffs.push(diff);
        }
    }
    diffs
}

/// Trigger-to-signal offsets without a window, pooled over all `signal_chans`.
pub fn raw_time_diffs(tstamp: &[f64], tchannel: &[u8], ref_chan: u8, signal_chans: &[u8]) -> Vec<f64> {
    compute_time_diffs(tstamp, tchannel, ref_chan, signal_chans, f64::INFINITY)
        .into_values()
        .flatten()
        .collect()
}

/// Outcome of classifying the trigger windows of one batch of runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunTally {
    pub valid: usize,
    pub total: usize,
}

impl RunTally {
    pub fn all_valid(&self) -> bool {
        self.valid == self.total
    }
}

/// Decides whether a trigger window shows enough fluorescence to keep.
///
/// The default acceptance is `observed_rate >= min_fraction * expected_rate`; a custom predicate
/// `(observed_rate, expected_rate) -> bool` can be supplied through [`RunGate::classify_with`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunGate {
    /// Expected detector count rate with an ion present, in counts per second
    pub expected_rate: f64,
    /// Length of the window opened by each trigger, in seconds
    pub window: f64,
    pub min_fraction: f64,
}

impl RunGate {
    pub const DEFAULT_MIN_FRACTION: f64 = 0.5;

    pub fn new(expected_rate: f64, window: f64) -> Self {
        Self {
            expected_rate,
            window,
            min_fraction: Self::DEFAULT_MIN_FRACTION,
        }
    }

    pub fn with_min_fraction(mut self, min_fraction: f64) -> Self {
        self.min_fraction = min_fraction;
        self
    }

    pub fn accepts(&self, observed_rate: f64) -> bool {
        observed_rate >= self.min_fraction * self.expected_rate
    }

    /// Classifies with the default threshold. See [`RunGate::classify_with`].
    pub fn classify(
        &self,
        tstamp: &[f64],
        tchannel: &[u8],
        trig_chan: u8,
        signal_chans: &[u8],
        cycles: usize,
    ) -> RunTally {
        self.classify_with(tstamp, tchannel, trig_chan, signal_chans, cycles, |observed, _| {
            self.accepts(observed)
        })
    }

    /// Walks every trigger window `[t_trig, min(t_trig + window, next trigger))`, computes its
    /// observed signal rate, and counts the windows accepted by `predicate`.
    ///
    /// `cycles` is the number of sequencer cycles the batch was expected to contain: cycles whose
    /// trigger never arrived are counted in `total` but never in `valid`.
    pub fn classify_with<P>(
        &self,
        tstamp: &[f64],
        tchannel: &[u8],
        trig_chan: u8,
        signal_chans: &[u8],
        cycles: usize,
        predicate: P,
    ) -> RunTally
    where
        P: Fn(f64, f64) -> bool,
    {
        let triggers: Vec<f64> = tstamp
            .iter()
            .zip(tchannel)
            .filter(|(_, &chan)| chan == trig_chan)
            .map(|(&t, _)| t)
            .collect();

        let mut valid = 0;
        for (i, &start) in triggers.iter().enumerate() {
            let mut end = start + self.window;
            if let Some(&next) = triggers.get(i + 1) {
                end = end.min(next);
            }
            let span = end - start;
            let observed = tstamp
                .iter()
                .zip(tchannel)
                .filter(|(&t, chan)| signal_chans.contains(chan) && t >= start && t < end)
                .count();
            let observed_rate = if span > 0. {
                observed as f64 / span
            } else {
                0.
            };
            if predicate(observed_rate, self.expected_rate) {
                valid += 1;
            }
        }
        RunTally {
            valid,
            total: std::cmp::max(cycles, triggers.len()),
        }
    }
}
