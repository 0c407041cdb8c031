//! Implements the hardware-independent state of a timestamp reader: the fixed set of eight
//! [`Channel`]s, the acquisition parameters, and the mode state machine which decides which
//! channels are electrically enabled.
//!
//! ## Modes
//! The reader is always in one of four [`ReaderMode`]s:
//!
//! | mode             | enabled channels                                     |
//! |------------------|------------------------------------------------------|
//! | `idle`           | none                                                 |
//! | `counting`       | `signal-f`, `signal-sp`                              |
//! | `rf_correlation` | `signal-f`, `trap`                                   |
//! | `experiment`     | every channel whose experiment mode is not `idle`    |
//!
//! All transitions are caller-initiated. The only forbidden ones are entering `counting` from
//! `experiment` or `rf_correlation`.
//!
//! ## Active channels
//! `active_channels` is never edited directly: every transition recomputes each channel's
//! `active` flag and re-derives the set from them, so that
//! `active_channels == {n | channels[n].active}` holds after every transition. The hardware layer
//! pushes the set returned by the transition to the converter before acquiring again.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use crate::channel::*;
use crate::count_rate::*;
use crate::error::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderMode {
    Idle,
    Counting,
    RfCorrelation,
    Experiment,
}

impl fmt::Display for ReaderMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ReaderMode::Idle => "idle",
                ReaderMode::Counting => "counting",
                ReaderMode::RfCorrelation => "rf_correlation",
                ReaderMode::Experiment => "experiment",
            }
        )
    }
}

/// Construction-time description of one input
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    pub mode: ChannelMode,
}

/// Standard assignment of the eight inputs during an experiment.
pub fn default_experiment_modes() -> IndexMap<u8, ChannelMode> {
    IndexMap::from([
        (0, ChannelMode::Trigger),
        (1, ChannelMode::SignalF),
        (2, ChannelMode::SignalF),
        (3, ChannelMode::SignalSp),
        (4, ChannelMode::SignalSp),
        (5, ChannelMode::Trap),
        (6, ChannelMode::Idle),
        (7, ChannelMode::Idle),
    ])
}

/// Checks channel numbers and the uniqueness of the `trap` and `trigger` assignments.
pub fn validate_modes<'a, I>(modes: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a u8, &'a ChannelMode)>,
{
    let mut trap: Option<u8> = None;
    let mut trigger: Option<u8> = None;
    for (&number, &mode) in modes {
        if number >= NUM_CHANNELS {
            return Err(Error::ChannelOutOfRange(number));
        }
        let slot = match mode {
            ChannelMode::Trap => &mut trap,
            ChannelMode::Trigger => &mut trigger,
            _ => continue,
        };
        if let Some(first) = *slot {
            return Err(Error::DuplicateMode {
                mode,
                first,
                second: number,
            });
        }
        *slot = Some(number);
    }
    Ok(())
}

/// Everything needed to put the reader back where it was, used around temporary acquisitions.
#[derive(Clone, Debug, PartialEq)]
pub struct ModeSnapshot {
    pub mode: ReaderMode,
    pub channel_modes: IndexMap<u8, ChannelMode>,
    pub active_channels: BTreeSet<u8>,
}

pub struct ReaderState {
    channels: IndexMap<u8, Channel>,
    rate: f64,
    n: usize,
    mode: ReaderMode,
    timebase: f64,
    active_channels: BTreeSet<u8>,
    times: VecDeque<f64>,
}

impl ReaderState {
    /// Builds the eight channels. Numbers missing from `specs` become unnamed `idle` channels.
    ///
    /// Fails on a channel number above 7, on more than one `trap` or `trigger` channel, or on a
    /// non-positive `rate`, `n` or `timebase`.
    pub fn new(
        specs: &IndexMap<u8, ChannelSpec>,
        rate: f64,
        n: usize,
        timebase: f64,
    ) -> Result<Self> {
        validate_modes(specs.iter().map(|(number, spec)| (number, &spec.mode)))?;
        if !(timebase > 0.) {
            return Err(Error::InvalidParameter(format!(
                "timebase must be positive, got {timebase}"
            )));
        }
        let channels = (0..NUM_CHANNELS)
            .map(|number| {
                let chan = match specs.get(&number) {
                    Some(spec) => Channel::new(&spec.name, number, spec.mode),
                    None => Channel::new(&format!("ch{number}"), number, ChannelMode::Idle),
                };
                (number, chan)
            })
            .collect();
        let mut state = Self {
            channels,
            rate: 1.,
            n: 1,
            mode: ReaderMode::Idle,
            timebase,
            active_channels: BTreeSet::new(),
            times: VecDeque::new(),
        };
        state.set_rate(rate)?;
        state.set_n(n)?;
        state.enter_idle();
        Ok(state)
    }

    // Field methods
    pub fn channels(&self) -> &IndexMap<u8, Channel> {
        &self.channels
    }
    pub fn chan(&self, number: u8) -> Result<&Channel> {
        self.channels
            .get(&number)
            .ok_or(Error::ChannelOutOfRange(number))
    }
    pub fn rate(&self) -> f64 {
        self.rate
    }
    pub fn n(&self) -> usize {
        self.n
    }
    pub fn mode(&self) -> ReaderMode {
        self.mode
    }
    pub fn timebase(&self) -> f64 {
        self.timebase
    }
    pub fn active_channels(&self) -> &BTreeSet<u8> {
        &self.active_channels
    }

    pub fn set_rate(&mut self, rate: f64) -> Result<()> {
        if !(rate > 0. && rate.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "sampling rate must be positive, got {rate}"
            )));
        }
        self.rate = rate;
        Ok(())
    }

    /// Changes the rolling-window length, trimming the histories to the new bound.
    pub fn set_n(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(Error::InvalidParameter(
                "rolling window length must be positive".to_string(),
            ));
        }
        self.n = n;
        while self.times.len() > n {
            self.times.pop_front();
        }
        self.channels.values_mut().for_each(|chan| chan.trim_counts(n));
        Ok(())
    }

    /// Channel numbers whose current mode is in `modes`, in channel order
    pub fn channels_with_modes(&self, modes: &[ChannelMode]) -> Vec<u8> {
        self.channels
            .values()
            .filter(|chan| modes.contains(&chan.mode()))
            .map(|chan| chan.number())
            .collect()
    }

    pub fn channel_with_mode(&self, mode: ChannelMode) -> Option<u8> {
        self.channels_with_modes(&[mode]).first().copied()
    }

    fn derive_active_channels(&mut self) -> &BTreeSet<u8> {
        self.active_channels = self
            .channels
            .values()
            .filter(|chan| chan.active())
            .map(|chan| chan.number())
            .collect();
        &self.active_channels
    }

    /// Enables exactly the channels whose mode is in `modes`.
    pub fn set_active_channels(&mut self, modes: &[ChannelMode]) -> &BTreeSet<u8> {
        for chan in self.channels.values_mut() {
            let active = modes.contains(&chan.mode());
            chan.set_active(active);
        }
        self.derive_active_channels()
    }

    pub fn enter_idle(&mut self) -> &BTreeSet<u8> {
        self.mode = ReaderMode::Idle;
        self.set_active_channels(&[])
    }

    /// Enables the signal channels and clears the time axis.
    pub fn enter_counting(&mut self) -> Result<&BTreeSet<u8>> {
        if matches!(
            self.mode,
            ReaderMode::Experiment | ReaderMode::RfCorrelation
        ) {
            return Err(Error::ForbiddenTransition {
                current: self.mode,
                target: ReaderMode::Counting,
            });
        }
        self.mode = ReaderMode::Counting;
        self.clear_counts();
        Ok(self.set_active_channels(&[ChannelMode::SignalF, ChannelMode::SignalSp]))
    }

    pub fn enter_rf_correlation(&mut self) -> &BTreeSet<u8> {
        self.mode = ReaderMode::RfCorrelation;
        self.set_active_channels(&[ChannelMode::SignalF, ChannelMode::Trap])
    }

    /// Applies a full per-channel assignment for the experiment; channels absent from `config`
    /// are set to `idle`. With `None` the [`default_experiment_modes`] are used.
    ///
    /// The assignment is validated before any channel is touched.
    pub fn enter_experiment(
        &mut self,
        config: Option<&IndexMap<u8, ChannelMode>>,
    ) -> Result<&BTreeSet<u8>> {
        let default_modes;
        let config = match config {
            Some(config) => config,
            None => {
                default_modes = default_experiment_modes();
                &default_modes
            }
        };
        validate_modes(config.iter())?;
        for chan in self.channels.values_mut() {
            let mode = config
                .get(&chan.number())
                .copied()
                .unwrap_or(ChannelMode::Idle);
            chan.set_mode(mode);
        }
        self.mode = ReaderMode::Experiment;
        Ok(self.derive_active_channels())
    }

    /// Restores every channel's construction-time mode. The reader returns to `idle`.
    pub fn exit_experiment(&mut self) -> &BTreeSet<u8> {
        for chan in self.channels.values_mut() {
            let initial = chan.initial_mode();
            chan.set_mode(initial);
        }
        self.mode = ReaderMode::Idle;
        self.derive_active_channels()
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        ModeSnapshot {
            mode: self.mode,
            channel_modes: self
                .channels
                .values()
                .map(|chan| (chan.number(), chan.mode()))
                .collect(),
            active_channels: self.active_channels.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &ModeSnapshot) -> &BTreeSet<u8> {
        for chan in self.channels.values_mut() {
            if let Some(&mode) = snapshot.channel_modes.get(&chan.number()) {
                *chan.mode_() = mode;
            }
            let active = snapshot.active_channels.contains(&chan.number());
            chan.set_active(active);
        }
        self.mode = snapshot.mode;
        self.derive_active_channels()
    }

    /// One count-rate sample: tallies the events of every active signal channel, appends the
    /// rates and `time` to the rolling histories, and returns the rates.
    pub fn record_counts(&mut self, time: f64, tchannel: &[u8]) -> IndexMap<u8, f64> {
        let signal_chans: Vec<u8> = self
            .channels
            .values()
            .filter(|chan| chan.active() && chan.is_signal())
            .map(|chan| chan.number())
            .collect();
        let tally = tally_counts(tchannel, &signal_chans, self.rate);
        let n = self.n;
        for (number, &rate) in tally.iter() {
            if let Some(chan) = self.channels.get_mut(number) {
                chan.push_count(rate, n);
            }
        }
        self.times.push_back(time);
        while self.times.len() > n {
            self.times.pop_front();
        }
        tally
    }

    pub fn count_snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            times: self.times.iter().copied().collect(),
            counts: self
                .channels
                .values()
                .filter(|chan| !chan.counts().is_empty())
                .map(|chan| (chan.number(), chan.counts().iter().copied().collect()))
                .collect(),
        }
    }

    pub fn clear_counts(&mut self) {
        self.times.clear();
        self.channels.values_mut().for_each(|chan| chan.clear_counts());
    }

    /// Replaces the per-run buffers of the listed channels; all other channels get an empty one.
    pub fn set_recent(&mut self, diffs: IndexMap<u8, Vec<f64>>) {
        let mut diffs = diffs;
        for chan in self.channels.values_mut() {
            let recent = diffs.swap_remove(&chan.number()).unwrap_or_default();
            chan.set_recent(recent);
        }
    }

    pub fn commit_recent(&mut self) {
        self.channels.values_mut().for_each(|chan| chan.commit_recent());
    }

    pub fn discard_recent(&mut self) {
        self.channels.values_mut().for_each(|chan| chan.discard_recent());
    }

    pub fn clear_time_diffs(&mut self) {
        self.channels
            .values_mut()
            .for_each(|chan| chan.clear_time_diffs());
    }

    pub fn time_diffs(&self) -> IndexMap<u8, Vec<f64>> {
        self.channels
            .values()
            .filter(|chan| chan.is_signal())
            .map(|chan| (chan.number(), chan.time_diffs().clone()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use crate::channel::*;
    use crate::reader::*;

    fn lab_specs() -> IndexMap<u8, ChannelSpec> {
        let spec = |name: &str, mode| ChannelSpec {
            name: name.to_string(),
            mode,
        };
        IndexMap::from([
            (0, spec("sequencer trigger", ChannelMode::Trigger)),
            (1, spec("PMT", ChannelMode::SignalF)),
            (2, spec("SPCM", ChannelMode::SignalSp)),
            (5, spec("RF pickup", ChannelMode::Trap)),
        ])
    }

    fn assert_consistent(state: &ReaderState) {
        let derived: BTreeSet<u8> = state
            .channels()
            .values()
            .filter(|chan| chan.active())
            .map(|chan| chan.number())
            .collect();
        assert_eq!(&derived, state.active_channels());
    }

    mod construction {
        use super::*;

        #[test]
        fn one_trap_and_one_trigger() {
            let state = ReaderState::new(&lab_specs(), 10., 100, 81e-12).unwrap();
            assert_eq!(state.channels().len(), 8);
            assert_eq!(state.mode(), ReaderMode::Idle);
            assert!(state.active_channels().is_empty());
            assert_eq!(state.chan(6).unwrap().mode(), ChannelMode::Idle);
        }

        #[test]
        fn two_trap_channels_fail() {
            let mut specs = lab_specs();
            specs.insert(
                6,
                ChannelSpec {
                    name: "second RF".to_string(),
                    mode: ChannelMode::Trap,
                },
            );
            let err = ReaderState::new(&specs, 10., 100, 81e-12).err().unwrap();
            assert!(matches!(
                err,
                Error::DuplicateMode {
                    mode: ChannelMode::Trap,
                    first: 5,
                    second: 6
                }
            ));
        }

        #[test]
        fn two_trigger_channels_fail() {
            let mut specs = lab_specs();
            specs.insert(
                7,
                ChannelSpec {
                    name: "second trigger".to_string(),
                    mode: ChannelMode::Trigger,
                },
            );
            assert!(matches!(
                ReaderState::new(&specs, 10., 100, 81e-12),
                Err(Error::DuplicateMode {
                    mode: ChannelMode::Trigger,
                    ..
                })
            ));
        }

        #[test]
        fn out_of_range_channel_fails() {
            let mut specs = lab_specs();
            specs.insert(
                8,
                ChannelSpec {
                    name: "ghost".to_string(),
                    mode: ChannelMode::SignalF,
                },
            );
            assert!(matches!(
                ReaderState::new(&specs, 10., 100, 81e-12),
                Err(Error::ChannelOutOfRange(8))
            ));
        }

        #[test]
        fn bad_parameters_fail() {
            assert!(ReaderState::new(&lab_specs(), 0., 100, 81e-12).is_err());
            assert!(ReaderState::new(&lab_specs(), 10., 0, 81e-12).is_err());
            assert!(ReaderState::new(&lab_specs(), 10., 100, 0.).is_err());
        }
    }

    mod transitions {
        use super::*;

        #[test]
        fn every_mode_keeps_active_set_consistent() {
            let mut state = ReaderState::new(&lab_specs(), 10., 100, 81e-12).unwrap();

            let active = state.enter_counting().unwrap().clone();
            assert_eq!(active, BTreeSet::from([1, 2]));
            assert_consistent(&state);

            state.enter_idle();
            assert!(state.active_channels().is_empty());
            assert_consistent(&state);

            let active = state.enter_rf_correlation().clone();
            assert_eq!(active, BTreeSet::from([1, 5]));
            assert_consistent(&state);

            let active = state.enter_experiment(None).unwrap().clone();
            assert_eq!(active, BTreeSet::from([0, 1, 2, 3, 4, 5]));
            assert_consistent(&state);

            let active = state.exit_experiment().clone();
            assert_eq!(active, BTreeSet::from([0, 1, 2, 5]));
            assert_consistent(&state);
        }

        #[test]
        fn counting_is_blocked_from_experiment_and_rf_correlation() {
            let mut state = ReaderState::new(&lab_specs(), 10., 100, 81e-12).unwrap();
            state.enter_experiment(None).unwrap();
            assert!(matches!(
                state.enter_counting(),
                Err(Error::ForbiddenTransition {
                    current: ReaderMode::Experiment,
                    target: ReaderMode::Counting
                })
            ));
            // The failed call leaves the state untouched
            assert_eq!(state.mode(), ReaderMode::Experiment);
            assert_consistent(&state);

            state.enter_rf_correlation();
            assert!(state.enter_counting().is_err());
            state.enter_idle();
            assert!(state.enter_counting().is_ok());
        }

        #[test]
        fn experiment_override_replaces_assignment() {
            let mut state = ReaderState::new(&lab_specs(), 10., 100, 81e-12).unwrap();
            let config = IndexMap::from([(3, ChannelMode::Trigger), (4, ChannelMode::SignalF)]);
            let active = state.enter_experiment(Some(&config)).unwrap().clone();
            assert_eq!(active, BTreeSet::from([3, 4]));
            assert_eq!(state.chan(1).unwrap().mode(), ChannelMode::Idle);

            let invalid = IndexMap::from([(3, ChannelMode::Trap), (4, ChannelMode::Trap)]);
            assert!(state.enter_experiment(Some(&invalid)).is_err());
            // Unchanged after the rejected assignment
            assert_eq!(state.chan(4).unwrap().mode(), ChannelMode::SignalF);

            state.exit_experiment();
            assert_eq!(state.chan(1).unwrap().mode(), ChannelMode::SignalF);
            assert_eq!(state.chan(3).unwrap().mode(), ChannelMode::Idle);
        }

        #[test]
        fn snapshot_round_trip() {
            let mut state = ReaderState::new(&lab_specs(), 10., 100, 81e-12).unwrap();
            state.enter_counting().unwrap();
            let snapshot = state.snapshot();
            state.enter_rf_correlation();
            state.restore(&snapshot);
            assert_eq!(state.mode(), ReaderMode::Counting);
            assert_eq!(state.active_channels(), &BTreeSet::from([1, 2]));
            assert_consistent(&state);
        }
    }

    mod counts {
        use super::*;

        #[test]
        fn histories_never_exceed_window() {
            let mut state = ReaderState::new(&lab_specs(), 10., 3, 81e-12).unwrap();
            state.enter_counting().unwrap();
            for i in 0..10 {
                let tally = state.record_counts(i as f64, &[1, 1, 2, 0, 5]);
                assert_eq!(tally[&1], 20.);
                assert_eq!(tally[&2], 10.);
                let snap = state.count_snapshot();
                assert!(snap.times.len() <= 3);
                assert!(snap.counts.values().all(|c| c.len() <= 3));
            }
            state.set_n(2).unwrap();
            assert_eq!(state.count_snapshot().times, vec![8., 9.]);
            state.clear_counts();
            assert!(state.count_snapshot().is_empty());
        }

        #[test]
        fn entering_counting_drops_stale_counts() {
            let mut state = ReaderState::new(&lab_specs(), 10., 10, 81e-12).unwrap();
            state.enter_counting().unwrap();
            state.record_counts(0., &[1, 1, 1]);
            state.enter_idle();
            state.enter_counting().unwrap();
            assert!(state.count_snapshot().is_empty());
            state.record_counts(1., &[1]);
            assert_eq!(state.count_snapshot().recent_mean(5), Some(10.));
        }

        #[test]
        fn recent_buffers_are_replaced_per_run() {
            let mut state = ReaderState::new(&lab_specs(), 10., 3, 81e-12).unwrap();
            state.set_recent(IndexMap::from([(1, vec![1., 2.])]));
            state.commit_recent();
            state.set_recent(IndexMap::from([(1, vec![3.])]));
            state.discard_recent();
            assert_eq!(state.time_diffs()[&1], vec![1., 2.]);
            state.clear_time_diffs();
            assert!(state.time_diffs()[&1].is_empty());
        }
    }
}
