//! Top-level control loop of a pulsed experiment.
//!
//! ## States
//! [`ExperimentRunner`] moves through `idle`, `catching`, `loading`, `running` and `paused`:
//!
//! - **Ion presence** is established by the fallback chain check → catch → load loop. Catching
//!   puts the DDS boards in trapping mode and waits for fluorescence; loading additionally opens
//!   the oven and shutter at a shallow trap depth. Both restore the hardware on every exit path.
//! - **Running**: every iteration triggers the sequencer, sleeps for most of the calibrated run
//!   time, polls the run-complete line, then processes the batch. A batch is committed when the
//!   diagnostics pass and discarded otherwise.
//! - **Paused**: entered on a failed diagnostic, a sequencer timeout, a failed ion recovery or
//!   an operator request. The reader leaves experiment mode and the hardware token is released
//!   so that manual diagnostics can run; a resume re-establishes the ion first.
//!
//! ## Pulse accounting
//! Every processed batch adds its number of cycles to `n_total_pulses`; only the trigger
//! windows that passed the fluorescence gate add to `n_valid_pulses`.
//!
//! ## Hardware ownership
//! Catch, load and trap-depth commands require the [`ControlGuard`] of the runner's
//! [`ControlToken`]. The loop holds it while it runs.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use iontrap_backend::{validate_trap_depth, PulseSequence, ReaderMode, RunGate, TickTimer};

use crate::config::ExperimentConfig;
use crate::error::*;
use crate::hardware::*;
use crate::reader::Reader;
use crate::utils::*;
use crate::worker_cmd_chan::*;

/// Name under which the loop holds the hardware token
pub const EXPERIMENT_OWNER: &str = "experiment loop";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Catching,
    Loading,
    Running,
    Paused,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RunnerState::Idle => "idle",
                RunnerState::Catching => "catching",
                RunnerState::Loading => "loading",
                RunnerState::Running => "running",
                RunnerState::Paused => "paused",
            }
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PulseCounters {
    pub n_valid_pulses: usize,
    pub n_total_pulses: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExperimentSummary {
    /// Committed batches
    pub iterations: usize,
    pub discarded: usize,
    pub counters: PulseCounters,
    /// Calibrated run time in seconds
    pub run_time: f64,
    pub gated_fraction: f64,
    /// `true` when the loop ended on an operator stop rather than on its iteration count
    pub stopped: bool,
}

/// Read-only view of a runner, usable while the loop runs on another thread
#[derive(Clone)]
pub struct ExperimentMonitor {
    state: Arc<Mutex<RunnerState>>,
    counters: Arc<Mutex<PulseCounters>>,
}

impl ExperimentMonitor {
    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }
    pub fn counters(&self) -> PulseCounters {
        *self.counters.lock()
    }
}

enum RunOutcome {
    Committed,
    Discarded,
    TimedOut,
}

pub struct ExperimentRunner {
    reader: Arc<Reader>,
    sequencer: Arc<dyn PulseSequencer>,
    outputs: Arc<dyn AnalogDigitalOut>,
    token: ControlToken,
    config: ExperimentConfig,
    sequence: PulseSequence,
    state: Arc<Mutex<RunnerState>>,
    counters: Arc<Mutex<PulseCounters>>,
    run_time: Duration,
    pending_cmd: Option<WorkerCmd>,
}

impl ExperimentRunner {
    pub fn new(
        reader: Arc<Reader>,
        sequencer: Arc<dyn PulseSequencer>,
        outputs: Arc<dyn AnalogDigitalOut>,
        token: ControlToken,
        config: ExperimentConfig,
        sequence: PulseSequence,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            reader,
            sequencer,
            outputs,
            token,
            config,
            sequence,
            state: Arc::new(Mutex::new(RunnerState::Idle)),
            counters: Arc::new(Mutex::new(PulseCounters::default())),
            run_time: Duration::ZERO,
            pending_cmd: None,
        })
    }

    // Field methods
    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }
    pub fn counters(&self) -> PulseCounters {
        *self.counters.lock()
    }
    pub fn run_time(&self) -> Duration {
        self.run_time
    }
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }
    pub fn reader(&self) -> &Arc<Reader> {
        &self.reader
    }
    pub fn sequence_(&mut self) -> &mut PulseSequence {
        &mut self.sequence
    }
    pub fn monitor(&self) -> ExperimentMonitor {
        ExperimentMonitor {
            state: self.state.clone(),
            counters: self.counters.clone(),
        }
    }

    fn set_state(&self, state: RunnerState) {
        let mut current = self.state.lock();
        if *current != state {
            log::info!("Experiment state {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Puts the reader in a mode in which the detectors are enabled.
    fn prepare_detection(&self) -> Result<()> {
        match self.reader.mode() {
            ReaderMode::Counting | ReaderMode::Experiment => Ok(()),
            ReaderMode::RfCorrelation | ReaderMode::Idle => {
                self.reader.enter_idle()?;
                self.reader.enter_counting()?;
                Ok(())
            }
        }
    }

    fn fluorescence(&self) -> Result<f64> {
        self.reader.fluorescence(self.config.check_samples)
    }

    /// Polls fluorescence until `accept` holds or `timeout` elapses.
    fn wait_for_fluorescence<F>(&self, timeout: Duration, accept: F) -> Result<bool>
    where
        F: Fn(f64) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let counts = self.fluorescence()?;
            if accept(counts) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.config.poll_interval());
        }
    }

    /// Short fluorescence average against `pmt_threshold`
    pub fn check_ion(&self) -> Result<bool> {
        let counts = self.fluorescence()?;
        log::debug!("Ion check: {counts:.1} counts/s");
        Ok(counts >= self.config.pmt_threshold)
    }

    /// Always true: the lasers are not monitored yet
    pub fn laser_locked(&self) -> bool {
        true
    }

    /// Sets the trap-RF depth after checking the ±3 V limit.
    pub fn set_trap_depth(&self, guard: &ControlGuard, voltage: f64) -> Result<()> {
        self.token.check(guard)?;
        validate_trap_depth(voltage)?;
        self.outputs.set_trap_depth(voltage)?;
        Ok(())
    }

    /// Waits up to `timeout` for the fluorescence to exceed `catch_fraction` of the expected
    /// single-ion level with the DDS boards in trapping mode. Trapping mode is left on every
    /// path.
    pub fn catch(&self, guard: &ControlGuard, timeout: Duration) -> Result<bool> {
        self.token.check(guard)?;
        self.set_state(RunnerState::Catching);
        dds_write("enter trapping mode", || self.sequencer.enter_trapping_mode())?;

        let target = self.config.catch_fraction * self.config.expected_fluorescence;
        let caught = self.wait_for_fluorescence(timeout, |counts| counts > target);

        let cleanup = dds_write("exit trapping mode", || self.sequencer.exit_trapping_mode());
        let caught = caught?;
        log_cleanup("exit trapping mode", cleanup)?;
        log::info!("Catch {}", if caught { "succeeded" } else { "timed out" });
        Ok(caught)
    }

    /// Opens oven and shutter at the loading depth and waits for fluorescence above
    /// `pmt_threshold`. On success the trap goes to its operating depth.
    ///
    /// Both digital lines are driven low and trapping mode is left on every path, each step
    /// attempted even if an earlier one failed. An oven line that cannot be driven low is
    /// reported as [`Error::OvenPinStuck`] ahead of any other error.
    pub fn load(&self, guard: &ControlGuard, timeout: Duration) -> Result<bool> {
        self.token.check(guard)?;
        validate_trap_depth(self.config.loading_trap_depth)?;
        validate_trap_depth(self.config.operating_trap_depth)?;
        self.set_state(RunnerState::Loading);

        let loaded = self.open_oven_and_wait(guard, timeout);

        let oven = self.config.oven_pin;
        let oven_reset = log_cleanup("oven pin low", self.outputs.set_digital_pin(oven, false));
        let shutter_reset = log_cleanup(
            "shutter pin low",
            self.outputs.set_digital_pin(self.config.shutter_pin, false),
        );
        let trapping_exit = log_cleanup(
            "exit trapping mode",
            dds_write("exit trapping mode", || self.sequencer.exit_trapping_mode()),
        );

        if let Err(source) = oven_reset {
            return Err(Error::OvenPinStuck { pin: oven, source });
        }
        let loaded = loaded?;
        shutter_reset?;
        trapping_exit?;
        log::info!("Load {}", if loaded { "succeeded" } else { "timed out" });
        Ok(loaded)
    }

    fn open_oven_and_wait(&self, guard: &ControlGuard, timeout: Duration) -> Result<bool> {
        dds_write("enter trapping mode", || self.sequencer.enter_trapping_mode())?;
        self.outputs.set_digital_pin(self.config.oven_pin, true)?;
        self.outputs.set_digital_pin(self.config.shutter_pin, true)?;
        self.set_trap_depth(guard, self.config.loading_trap_depth)?;

        let threshold = self.config.pmt_threshold;
        if !self.wait_for_fluorescence(timeout, |counts| counts > threshold)? {
            return Ok(false);
        }
        self.set_trap_depth(guard, self.config.operating_trap_depth)?;
        Ok(true)
    }

    /// Accepts when the fluorescence is within `single_ion_tolerance` of the expected
    /// single-ion level, retrying with a fixed backoff.
    pub fn single_ion_check(&self) -> Result<bool> {
        let expected = self.config.expected_fluorescence;
        let tolerance = self.config.single_ion_tolerance;
        for attempt in 1..=self.config.single_ion_retries.max(1) {
            let counts = self.fluorescence()?;
            if (counts - expected).abs() <= tolerance * expected {
                return Ok(true);
            }
            log::info!(
                "Single-ion check {attempt}: {counts:.1} counts/s, expected {expected:.1} ± {:.0}%",
                tolerance * 100.
            );
            if attempt < self.config.single_ion_retries {
                std::thread::sleep(self.config.single_ion_backoff());
            }
        }
        Ok(false)
    }

    /// Releases the trap briefly to drop a stuck multi-ion or dark state.
    fn cycle_trap_depth(&self, guard: &ControlGuard) -> Result<()> {
        log::info!("Cycling trap depth to release the trap");
        self.set_trap_depth(guard, self.config.release_trap_depth)?;
        std::thread::sleep(self.config.release_time());
        self.set_trap_depth(guard, self.config.operating_trap_depth)
    }

    /// Up to `attempts` loads, each followed by a single-ion check. A failed check releases the
    /// trap before the next attempt.
    pub fn load_loop(&self, guard: &ControlGuard, attempts: usize) -> Result<bool> {
        for attempt in 1..=attempts {
            log::info!("Load attempt {attempt}/{attempts}");
            if !self.load(guard, self.config.load_timeout())? {
                continue;
            }
            if self.single_ion_check()? {
                return Ok(true);
            }
            self.cycle_trap_depth(guard)?;
        }
        Ok(false)
    }

    /// The check → catch → load-loop fallback chain
    pub fn ensure_ion(&self, guard: &ControlGuard) -> Result<bool> {
        self.prepare_detection()?;
        if self.check_ion()? {
            return Ok(true);
        }
        log::warn!("Ion lost, trying to catch it");
        if self.catch(guard, self.config.catch_timeout())? {
            return Ok(true);
        }
        log::warn!("Catch failed, loading a new ion");
        self.load_loop(guard, self.config.load_attempts)
    }

    /// Uploads the RAM arrays of the edited devices, the sequencer program and the configured
    /// profiles.
    pub fn flash(&mut self) -> Result<()> {
        let rebuilt = self.sequence.build_ram_arrays()?;
        for name in &rebuilt {
            let Some(device) = self.sequence.devices().get(name) else {
                continue;
            };
            let (board, ram) = (device.board(), device.ram());
            dds_write("RAM upload", || self.sequencer.write_ram(board, ram))?;
        }
        let pulses = self.sequence.pulses();
        let n_cycles = self.sequence.n_cycles();
        dds_write("program upload", || self.sequencer.load_program(&pulses, n_cycles))?;
        for p in &self.config.dds_profiles {
            p.validate()?;
            dds_write("profile", || {
                self.sequencer
                    .apply_profile(p.board, p.profile, p.frequency, p.amplitude, p.phase)
            })?;
        }
        log::info!(
            "Flashed {} RAM arrays, {} pulses x {} cycles",
            rebuilt.len(),
            pulses.len(),
            n_cycles
        );
        Ok(())
    }

    /// Triggers the sequencer and waits for its run-complete line. `None` on timeout.
    ///
    /// Commands arriving while waiting are kept for the next iteration boundary.
    fn trigger_and_wait(
        &mut self,
        pre_sleep: Duration,
        mut recvr: Option<&mut CmdRecvr>,
    ) -> Result<Option<Duration>> {
        let start = Instant::now();
        dds_write("sequencer start", || self.sequencer.start())?;
        std::thread::sleep(pre_sleep);
        let timeout = self.config.run_timeout();
        loop {
            if self.sequencer.is_done()? {
                return Ok(Some(start.elapsed()));
            }
            if let Some(cmd) = recvr.as_mut().and_then(|r| r.try_recv()) {
                self.pending_cmd = Some(cmd);
            }
            if start.elapsed() >= timeout {
                self.sequencer.stop()?;
                return Ok(None);
            }
            std::thread::sleep(self.config.poll_interval());
        }
    }

    /// Measures the time from trigger to run-complete once and discards the run's events.
    ///
    /// A single sample is taken; jitter of the completion signal therefore goes straight into
    /// the pre-sleep of every later iteration.
    pub fn calibrate_run_time(&mut self) -> Result<Duration> {
        let measured = self
            .trigger_and_wait(Duration::ZERO, None)?
            .ok_or_else(|| timeout("pulse sequencer run-complete", self.config.run_timeout()))?;
        self.reader.flush()?;
        self.run_time = measured;
        log::info!(
            "Calibrated run time: {:.3} ms (single sample)",
            measured.as_secs_f64() * 1e3
        );
        Ok(measured)
    }

    fn gate(&self) -> RunGate {
        RunGate::new(self.config.expected_run_rate, self.sequence.sequence_length())
            .with_min_fraction(self.config.gate_min_fraction)
    }

    fn run_once(&mut self, recvr: &mut CmdRecvr) -> Result<RunOutcome> {
        let pre_sleep = self.run_time.mul_f64(self.config.run_time_margin);
        if self.trigger_and_wait(pre_sleep, Some(recvr))?.is_none() {
            log::warn!("Pulse sequencer did not signal completion");
            self.reader.flush()?;
            return Ok(RunOutcome::TimedOut);
        }

        let tally = self.reader.process_run(
            self.sequence.sequence_length(),
            &self.gate(),
            self.sequence.n_cycles(),
        )?;
        {
            let mut counters = self.counters.lock();
            counters.n_total_pulses += tally.total;
            counters.n_valid_pulses += tally.valid;
        }

        if self.laser_locked() && self.check_ion()? {
            self.reader.save_data();
            Ok(RunOutcome::Committed)
        } else {
            log::warn!("Diagnostics failed, discarding run");
            self.reader.discard_data();
            Ok(RunOutcome::Discarded)
        }
    }

    /// Leaves trapping mode and enters experiment mode.
    fn enter_running(&mut self) -> Result<()> {
        dds_write("exit trapping mode", || self.sequencer.exit_trapping_mode())?;
        self.reader
            .enter_experiment(self.config.experiment_channels.as_ref())?;
        self.set_state(RunnerState::Running);
        Ok(())
    }

    /// Re-establishes the ion and re-enters experiment mode. Returns `false`, leaving the runner
    /// paused without the token, when the token is taken, no ion could be recovered or the
    /// hardware refused the switch.
    pub fn resume_experiment(&mut self, guard: &mut Option<ControlGuard>) -> bool {
        let fresh = match guard.take() {
            Some(held) => held,
            None => match self.token.acquire(EXPERIMENT_OWNER) {
                Ok(fresh) => fresh,
                Err(err) => {
                    log::warn!("Cannot resume: {err}");
                    return false;
                }
            },
        };
        let recovered = match self.ensure_ion(&fresh) {
            Ok(true) => self.enter_running().map(|()| true),
            other => other,
        };
        match recovered {
            Ok(true) => {
                *guard = Some(fresh);
                log::info!("Experiment resumed");
                true
            }
            Ok(false) => {
                log::warn!("Cannot resume: no ion");
                self.set_state(RunnerState::Paused);
                false
            }
            Err(err) => {
                log::error!("Cannot resume: {err}");
                if let Err(err) = self.reader.exit_experiment() {
                    log::error!("Could not leave experiment mode: {err}");
                }
                self.set_state(RunnerState::Paused);
                false
            }
        }
    }

    /// Leaves experiment mode, releases the hardware token and waits for `Resume` or `Stop`.
    /// Returns `true` once resumed, `false` on `Stop`.
    ///
    /// A `Stop` that arrived during the last run ends the pause at once; a parked `Pause` or
    /// `Resume` is dropped.
    pub fn pause_experiment(
        &mut self,
        recvr: &mut CmdRecvr,
        guard: &mut Option<ControlGuard>,
    ) -> bool {
        self.set_state(RunnerState::Paused);
        if let Err(err) = self.reader.exit_experiment() {
            log::error!("Could not leave experiment mode: {err}");
        }
        *guard = None;
        if self.pending_cmd.take() == Some(WorkerCmd::Stop) {
            return false;
        }
        loop {
            match recvr.recv_timeout(self.config.pause_poll()) {
                Some(WorkerCmd::Resume) => {
                    if self.resume_experiment(guard) {
                        return true;
                    }
                }
                Some(WorkerCmd::Stop) => return false,
                Some(WorkerCmd::Pause) | None => {}
            }
        }
    }

    fn experiment_loop(
        &mut self,
        iterations: Option<usize>,
        recvr: &mut CmdRecvr,
        guard: &mut Option<ControlGuard>,
        summary: &mut ExperimentSummary,
    ) -> Result<()> {
        let mut timer = TickTimer::new();
        while iterations.map_or(true, |n| summary.iterations < n) {
            let cmd = self.pending_cmd.take().or_else(|| recvr.try_recv());
            match cmd {
                Some(WorkerCmd::Stop) => {
                    summary.stopped = true;
                    return Ok(());
                }
                Some(WorkerCmd::Pause) => {
                    log::info!("Pause requested");
                    if !self.pause_experiment(recvr, guard) {
                        summary.stopped = true;
                        return Ok(());
                    }
                }
                Some(WorkerCmd::Resume) | None => {}
            }

            let outcome = match self.run_once(recvr) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::error!("Run failed: {err}");
                    self.reader.discard_data();
                    RunOutcome::Discarded
                }
            };
            match outcome {
                RunOutcome::Committed => {
                    summary.iterations += 1;
                    timer.tick_print(&format!("Iteration {}", summary.iterations));
                    continue;
                }
                RunOutcome::Discarded => summary.discarded += 1,
                RunOutcome::TimedOut => {}
            }
            if !self.pause_experiment(recvr, guard) {
                summary.stopped = true;
                return Ok(());
            }
        }
        Ok(())
    }

    fn run_session(
        &mut self,
        iterations: Option<usize>,
        recvr: &mut CmdRecvr,
        guard: &mut Option<ControlGuard>,
        summary: &mut ExperimentSummary,
    ) -> Result<()> {
        if self.reader.is_counting() {
            log::info!("Stopping the counting loop for the experiment");
            self.reader.stop_counting()?;
        }
        self.flash()?;
        let ready = match guard.as_ref() {
            Some(held) => self.ensure_ion(held).unwrap_or_else(|err| {
                log::error!("Ion check failed: {err}");
                false
            }),
            None => false,
        };
        if ready {
            self.enter_running()?;
        } else {
            log::warn!("No ion, experiment paused before the first run");
            if !self.pause_experiment(recvr, guard) {
                summary.stopped = true;
                return Ok(());
            }
        }
        self.reader.clear_time_diffs();
        loop {
            match self.calibrate_run_time() {
                Ok(run_time) => {
                    summary.run_time = run_time.as_secs_f64();
                    break;
                }
                Err(err @ Error::Timeout { .. }) => {
                    log::warn!("Run-time calibration failed: {err}");
                    if !self.pause_experiment(recvr, guard) {
                        summary.stopped = true;
                        return Ok(());
                    }
                }
                Err(err) => return Err(err),
            }
        }
        self.experiment_loop(iterations, recvr, guard, summary)
    }

    /// Runs the experiment for `iterations` committed batches, or until `Stop` with `None`.
    ///
    /// Only setup faults (flashing, channel configuration) end the call with an error; a
    /// sequencer that does not complete pauses the loop like any failed diagnostic. On return the reader is back in its construction-time modes, the token is
    /// released and the runner is idle.
    pub fn start_experiment(
        &mut self,
        iterations: Option<usize>,
        recvr: &mut CmdRecvr,
    ) -> Result<ExperimentSummary> {
        let mut guard = Some(self.token.acquire(EXPERIMENT_OWNER)?);
        let mut summary = ExperimentSummary {
            iterations: 0,
            discarded: 0,
            counters: PulseCounters::default(),
            run_time: 0.,
            gated_fraction: self.sequence.gated_fraction(),
            stopped: false,
        };
        log::info!("Starting experiment ({iterations:?} iterations)");

        let result = self.run_session(iterations, recvr, &mut guard, &mut summary);

        if let Err(err) = self.reader.exit_experiment() {
            log::error!("Could not leave experiment mode: {err}");
        }
        drop(guard);
        self.set_state(RunnerState::Idle);
        summary.counters = self.counters();
        result?;
        log::info!(
            "Experiment finished: {} committed, {} discarded, {}/{} valid pulses",
            summary.iterations,
            summary.discarded,
            summary.counters.n_valid_pulses,
            summary.counters.n_total_pulses
        );
        Ok(summary)
    }
}

/// An experiment running on its own thread
pub struct ExperimentHandle {
    cmd: CmdChan,
    monitor: ExperimentMonitor,
    worker: Option<JoinHandle<Result<ExperimentSummary>>>,
}

impl ExperimentHandle {
    pub fn spawn(mut runner: ExperimentRunner, iterations: Option<usize>) -> Self {
        let cmd = CmdChan::new();
        let mut recvr = cmd.new_recvr();
        let monitor = runner.monitor();
        let worker = std::thread::spawn(move || runner.start_experiment(iterations, &mut recvr));
        Self {
            cmd,
            monitor,
            worker: Some(worker),
        }
    }

    /// Sender side of the command channel, for dispatchers
    pub fn commands(&self) -> CmdChan {
        self.cmd.clone()
    }
    pub fn monitor(&self) -> &ExperimentMonitor {
        &self.monitor
    }

    pub fn pause(&self) {
        self.cmd.send(WorkerCmd::Pause);
    }
    pub fn resume(&self) {
        self.cmd.send(WorkerCmd::Resume);
    }
    pub fn stop(&self) {
        self.cmd.send(WorkerCmd::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    pub fn join(mut self) -> Result<ExperimentSummary> {
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| Error::WorkerPanicked)?,
            None => Err(Error::WorkerPanicked),
        }
    }
}

impl Drop for ExperimentHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cmd.send(WorkerCmd::Stop);
            if worker.join().is_err() {
                log::error!("Experiment thread panicked");
            }
        }
    }
}
