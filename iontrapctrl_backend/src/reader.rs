//! Threaded front end of the time-to-digital converter.
//!
//! [`Reader`] couples the hardware-independent [`ReaderState`] with a [`TimestampSource`]. The
//! state and the hardware share a single lock: a mode transition pushes the new enabled-channel
//! set to the converter before releasing it, so an acquisition never reads from a channel set
//! that is mid-transition. Callers only ever receive copies of the buffers.
//!
//! The counting loop runs on its own thread and is stopped cooperatively: clearing the
//! `counting` flag takes effect at the next sampling boundary.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use iontrap_backend::*;

use crate::error::{Error, Result};
use crate::hardware::*;
use crate::utils::secs;

struct Shared {
    state: Mutex<ReaderState>,
    source: Arc<dyn TimestampSource>,
    last: Mutex<TimestampBatch>,
}

impl Shared {
    /// Reads and resets the converter buffer; returns the de-padded events and the caller's
    /// lock on the state.
    fn read(&self) -> Result<(parking_lot::MutexGuard<'_, ReaderState>, Vec<i64>, Vec<u8>)> {
        let state = self.state.lock();
        let batch = self.source.last_timestamps(true)?;
        let (tstamp, tchannel) = strip_padding(&batch.tstamp, &batch.tchannel);
        let (tstamp, tchannel) = (tstamp.to_vec(), tchannel.to_vec());
        *self.last.lock() = batch;
        Ok((state, tstamp, tchannel))
    }

    fn sample_cycle(&self) -> Result<(f64, IndexMap<u8, f64>)> {
        let (mut state, _tstamp, tchannel) = self.read()?;
        let now = unix_time();
        let tally = state.record_counts(now, &tchannel);
        Ok((now, tally))
    }

    fn transition<F>(&self, apply: F) -> Result<BTreeSet<u8>>
    where
        F: FnOnce(&mut ReaderState) -> iontrap_backend::Result<BTreeSet<u8>>,
    {
        let mut state = self.state.lock();
        let active = apply(&mut state)?;
        self.source.enable_channels(&active)?;
        log::debug!("Reader entered {} mode, channels {:?}", state.mode(), active);
        Ok(active)
    }
}

fn counting_loop(shared: Arc<Shared>, counting: Arc<AtomicBool>) {
    while counting.load(Ordering::SeqCst) {
        let start = Instant::now();
        if let Err(err) = shared.sample_cycle() {
            log::warn!("Count sampling failed: {err}");
        }
        let period = secs(1. / shared.state.lock().rate());
        if let Some(remaining) = period.checked_sub(start.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}

pub struct Reader {
    shared: Arc<Shared>,
    counting: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Reader {
    /// Builds the reader and disables every converter input.
    pub fn new(
        source: Arc<dyn TimestampSource>,
        specs: &IndexMap<u8, ChannelSpec>,
        rate: f64,
        n: usize,
    ) -> Result<Self> {
        let state = ReaderState::new(specs, rate, n, source.timebase())?;
        source.enable_channels(state.active_channels())?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                source,
                last: Mutex::new(TimestampBatch::default()),
            }),
            counting: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> ReaderMode {
        self.shared.state.lock().mode()
    }
    pub fn active_channels(&self) -> BTreeSet<u8> {
        self.shared.state.lock().active_channels().clone()
    }
    pub fn rate(&self) -> f64 {
        self.shared.state.lock().rate()
    }
    pub fn n(&self) -> usize {
        self.shared.state.lock().n()
    }
    pub fn timebase(&self) -> f64 {
        self.shared.state.lock().timebase()
    }
    pub fn is_counting(&self) -> bool {
        self.counting.load(Ordering::SeqCst)
    }

    pub fn set_rate(&self, rate: f64) -> Result<()> {
        Ok(self.shared.state.lock().set_rate(rate)?)
    }

    pub fn set_n(&self, n: usize) -> Result<()> {
        Ok(self.shared.state.lock().set_n(n)?)
    }

    /// Modes of every channel, in channel order
    pub fn channel_modes(&self) -> IndexMap<u8, ChannelMode> {
        self.shared.state.lock().snapshot().channel_modes
    }

    pub fn enter_idle(&self) -> Result<BTreeSet<u8>> {
        self.shared.transition(|state| Ok(state.enter_idle().clone()))
    }

    pub fn enter_counting(&self) -> Result<BTreeSet<u8>> {
        self.shared.transition(|state| state.enter_counting().cloned())
    }

    pub fn enter_rf_correlation(&self) -> Result<BTreeSet<u8>> {
        self.shared
            .transition(|state| Ok(state.enter_rf_correlation().clone()))
    }

    pub fn enter_experiment(
        &self,
        config: Option<&IndexMap<u8, ChannelMode>>,
    ) -> Result<BTreeSet<u8>> {
        self.shared
            .transition(|state| state.enter_experiment(config).cloned())
    }

    pub fn exit_experiment(&self) -> Result<BTreeSet<u8>> {
        self.shared
            .transition(|state| Ok(state.exit_experiment().clone()))
    }

    /// One count-rate sample, outside of the counting loop
    pub fn sample_cycle(&self) -> Result<(f64, IndexMap<u8, f64>)> {
        self.shared.sample_cycle()
    }

    fn spawn_counting_worker(&self) {
        self.counting.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let counting = self.counting.clone();
        *self.worker.lock() = Some(std::thread::spawn(move || counting_loop(shared, counting)));
    }

    /// Stops the loop thread without touching the buffers or the mode.
    fn halt_counting_worker(&self) {
        self.counting.store(false, Ordering::SeqCst);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Counting thread panicked");
            }
        }
    }

    /// Enters counting mode and samples at `rate` on a background thread until
    /// [`Reader::stop_counting`].
    pub fn start_counting(&self) -> Result<()> {
        if self.is_counting() {
            return Ok(());
        }
        self.enter_counting()?;
        self.spawn_counting_worker();
        log::info!("Counting started at {} Hz", self.rate());
        Ok(())
    }

    /// Stops the loop, clears the count history and returns to idle.
    ///
    /// Outside of counting mode nothing is touched, so a stray stop cannot disable the inputs
    /// of a running experiment or RF-correlation acquisition.
    pub fn stop_counting(&self) -> Result<()> {
        if !self.is_counting() && self.mode() != ReaderMode::Counting {
            log::debug!("Counting is not running; reader stays in {} mode", self.mode());
            return Ok(());
        }
        self.halt_counting_worker();
        self.shared.state.lock().clear_counts();
        self.enter_idle()?;
        log::info!("Counting stopped");
        Ok(())
    }

    /// Copy of the rolling count history
    pub fn get_counts(&self) -> CountSnapshot {
        self.shared.state.lock().count_snapshot()
    }

    /// The raw batch returned by the most recent read
    pub fn last_timestamps(&self) -> TimestampBatch {
        self.shared.last.lock().clone()
    }

    /// Discards whatever the converter has buffered.
    pub fn flush(&self) -> Result<()> {
        self.shared.read().map(|_| ())
    }

    /// Mean summed count rate of the enabled signal channels over `samples` samples.
    ///
    /// While the counting loop runs, its history is used instead of reading the converter.
    pub fn fluorescence(&self, samples: usize) -> Result<f64> {
        let samples = samples.max(1);
        let period = secs(1. / self.rate());
        if self.is_counting() {
            std::thread::sleep(period * samples as u32);
            return Ok(self.get_counts().recent_mean(samples).unwrap_or(0.));
        }
        let mut total = 0.;
        for _ in 0..samples {
            std::thread::sleep(period);
            let (state, _tstamp, tchannel) = self.shared.read()?;
            let signals: Vec<u8> = state
                .channels()
                .values()
                .filter(|chan| chan.active() && chan.is_signal())
                .map(|chan| chan.number())
                .collect();
            total += tally_counts(&tchannel, &signals, state.rate())
                .values()
                .sum::<f64>();
        }
        Ok(total / samples as f64)
    }

    /// Acquires `no_runs` buffers at `rate` with the `signal-f` and `trap` inputs enabled and
    /// fits the pooled RF-reference-to-photon delays.
    ///
    /// The mode, the enabled channels and the counting loop are restored afterwards on every
    /// path. Without usable data the result is empty.
    pub fn rf_correlation(&self, no_runs: usize, rate: f64, no_bins: usize) -> Result<RfCorrelation> {
        let was_counting = self.is_counting();
        if was_counting {
            self.halt_counting_worker();
        }
        let snapshot = self.shared.state.lock().snapshot();

        let pooled = self.acquire_rf_delays(no_runs, rate);

        let restored = self
            .shared
            .transition(|state| Ok(state.restore(&snapshot).clone()));
        if was_counting {
            self.spawn_counting_worker();
        }
        let pooled = pooled?;
        restored?;

        if pooled.is_empty() {
            log::info!("RF correlation: no usable data in {no_runs} runs");
            return Ok(RfCorrelation::default());
        }
        Ok(fit_rf_correlation(&pooled, no_bins))
    }

    fn acquire_rf_delays(&self, no_runs: usize, rate: f64) -> Result<Vec<f64>> {
        if !(rate > 0.) {
            return Err(Error::Config(format!("RF correlation rate must be positive, got {rate}")));
        }
        self.enter_rf_correlation()?;
        let (reference, detectors) = {
            let state = self.shared.state.lock();
            let reference = state
                .channel_with_mode(ChannelMode::Trap)
                .ok_or(iontrap_backend::Error::MissingChannel(ChannelMode::Trap))?;
            (reference, state.channels_with_modes(&[ChannelMode::SignalF]))
        };

        let period = secs(1. / rate);
        let mut pooled = Vec::new();
        for run in 0..no_runs {
            std::thread::sleep(period);
            match self.shared.read() {
                Ok((state, tstamp, tchannel)) => {
                    let seconds = ticks_to_seconds(&tstamp, state.timebase());
                    pooled.extend(raw_time_diffs(&seconds, &tchannel, reference, &detectors));
                }
                Err(err) => log::warn!("RF correlation run {run} failed: {err}"),
            }
        }
        Ok(pooled)
    }

    /// Processes the events of the batch of runs that just finished: computes the
    /// trigger-relative delays into every channel's per-run buffer and classifies the trigger
    /// windows with `gate`.
    ///
    /// The buffers stay pending until [`Reader::save_data`] or [`Reader::discard_data`].
    pub fn process_run(&self, sequence_length: f64, gate: &RunGate, cycles: usize) -> Result<RunTally> {
        let (mut state, tstamp, tchannel) = self.shared.read()?;
        let trigger = state
            .channel_with_mode(ChannelMode::Trigger)
            .ok_or(iontrap_backend::Error::MissingChannel(ChannelMode::Trigger))?;
        let signals: Vec<u8> = state
            .channels()
            .values()
            .filter(|chan| chan.active() && chan.is_signal())
            .map(|chan| chan.number())
            .collect();
        let seconds = ticks_to_seconds(&tstamp, state.timebase());
        let diffs = compute_time_diffs(&seconds, &tchannel, trigger, &signals, sequence_length);
        let tally = gate.classify(&seconds, &tchannel, trigger, &signals, cycles);
        state.set_recent(diffs);
        Ok(tally)
    }

    /// Accepts the last processed run
    pub fn save_data(&self) {
        self.shared.state.lock().commit_recent();
    }

    /// Rejects the last processed run
    pub fn discard_data(&self) {
        self.shared.state.lock().discard_recent();
    }

    pub fn clear_time_diffs(&self) {
        self.shared.state.lock().clear_time_diffs();
    }

    /// Accumulated delays of every signal channel
    pub fn time_diffs(&self) -> IndexMap<u8, Vec<f64>> {
        self.shared.state.lock().time_diffs()
    }

    /// Polling helper for tests and callers waiting on the counting loop
    pub fn wait_for_samples(&self, samples: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.get_counts().times.len() >= samples {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.halt_counting_worker();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimHardware;

    fn specs() -> IndexMap<u8, ChannelSpec> {
        let spec = |name: &str, mode| ChannelSpec {
            name: name.to_string(),
            mode,
        };
        IndexMap::from([
            (0, spec("trigger", ChannelMode::Trigger)),
            (1, spec("PMT", ChannelMode::SignalF)),
            (3, spec("SPCM", ChannelMode::SignalSp)),
            (5, spec("RF pickup", ChannelMode::Trap)),
        ])
    }

    fn reader(sim: &Arc<SimHardware>) -> Reader {
        Reader::new(sim.clone(), &specs(), 200., 5).unwrap()
    }

    #[test]
    fn transitions_reach_the_hardware() {
        let sim = Arc::new(SimHardware::new(0, 5));
        let reader = reader(&sim);
        assert!(sim.enabled_channels().is_empty());
        reader.enter_counting().unwrap();
        assert_eq!(sim.enabled_channels(), BTreeSet::from([1, 3]));
        reader.enter_rf_correlation().unwrap();
        assert_eq!(sim.enabled_channels(), BTreeSet::from([1, 5]));
        assert!(reader.enter_counting().is_err());
        assert_eq!(sim.enabled_channels(), BTreeSet::from([1, 5]));
        reader.enter_experiment(None).unwrap();
        assert_eq!(sim.enabled_channels(), BTreeSet::from([0, 1, 2, 3, 4, 5]));
        reader.exit_experiment().unwrap();
        assert_eq!(reader.mode(), ReaderMode::Idle);
    }

    #[test]
    fn sample_cycle_ignores_padding() {
        let sim = Arc::new(SimHardware::new(0, 5));
        sim.set_photons_per_read(3);
        let reader = reader(&sim);
        reader.enter_counting().unwrap();
        let (_, tally) = reader.sample_cycle().unwrap();
        assert_eq!(tally[&1], 3. * 200.);
        assert_eq!(tally[&3], 3. * 200.);
        // The raw batch still carries the DMA padding
        let raw = reader.last_timestamps();
        assert!(raw.tstamp.len() > raw.valid);
    }

    #[test]
    fn empty_reads_count_zero() {
        let sim = Arc::new(SimHardware::new(0, 5));
        sim.set_ion_present(false);
        let reader = reader(&sim);
        reader.enter_counting().unwrap();
        let (_, tally) = reader.sample_cycle().unwrap();
        assert_eq!(tally.len(), 2);
        assert!(tally.values().all(|&c| c == 0.));
    }

    #[test]
    fn stop_counting_leaves_other_modes_alone() {
        let sim = Arc::new(SimHardware::new(0, 5));
        let reader = reader(&sim);
        reader.enter_experiment(None).unwrap();
        reader.stop_counting().unwrap();
        assert_eq!(reader.mode(), ReaderMode::Experiment);
        assert_eq!(sim.enabled_channels(), BTreeSet::from([0, 1, 2, 3, 4, 5]));

        reader.exit_experiment().unwrap();
        reader.enter_counting().unwrap();
        reader.stop_counting().unwrap();
        assert_eq!(reader.mode(), ReaderMode::Idle);
        assert!(sim.enabled_channels().is_empty());
    }

    #[test]
    fn read_errors_do_not_stop_counting() {
        let sim = Arc::new(SimHardware::new(0, 5));
        sim.fail_next_reads(2);
        let reader = reader(&sim);
        reader.start_counting().unwrap();
        assert!(reader.wait_for_samples(2, Duration::from_secs(5)));
        reader.stop_counting().unwrap();
    }
}
