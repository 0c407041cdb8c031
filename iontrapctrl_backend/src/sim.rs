//! Simulated instruments for the demo binary and the tests.
//!
//! [`SimHardware`] implements every collaborator trait on one deterministic model:
//!
//! - Every converter read advances the clock by [`READ_TICKS`] and, while an ion is present,
//!   emits `photons_per_read` evenly spaced photons on each enabled detector input. With the
//!   RF reference enabled, reference edges arrive every [`RF_PERIOD_TICKS`].
//! - Starting the sequencer queues one trigger per cycle of the loaded program; the detectors
//!   see `events_per_cycle` photons per cycle unless the blink pattern marks the cycle dark.
//! - Reads are padded with [`PADDING`] zero words, as the real DMA buffer is.
//! - Opening the oven loads an ion after `load_after_reads` reads.
//! - Faults can be injected for reads, DDS writes, the trap-depth DAC and individual pins.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

use iontrap_backend::Pulse;

use crate::hardware::*;

pub const TIMEBASE: f64 = 1e-9;
pub const READ_TICKS: i64 = 1_000_000;
pub const RF_PERIOD_TICKS: i64 = 50;
pub const PADDING: usize = 16;

#[derive(Default)]
struct Faults {
    reads: usize,
    dds_writes: usize,
    trap_depth: bool,
    stuck_pins: BTreeSet<u8>,
    sequencer_hangs: bool,
}

struct SimState {
    enabled: BTreeSet<u8>,
    clock: i64,
    pending: Vec<(i64, u8)>,
    ion_present: bool,
    photons_per_read: usize,
    events_per_cycle: usize,
    blink: Vec<bool>,
    blink_pos: usize,
    load_after_reads: Option<usize>,
    reads_while_loading: usize,
    trapping: bool,
    pins: BTreeMap<u8, bool>,
    trap_depth: f64,
    trap_depth_history: Vec<f64>,
    profiles: Vec<(u8, u8, f64, f64, f64)>,
    ram: BTreeMap<u8, Vec<u16>>,
    program: Vec<Pulse>,
    n_cycles: usize,
    running: bool,
    polls_left: usize,
    done_after_polls: usize,
    runs_started: usize,
    dds_attempts: usize,
    faults: Faults,
}

pub struct SimHardware {
    trigger: u8,
    trap: u8,
    state: Mutex<SimState>,
}

fn io_error(device: &str, msg: &str) -> HardwareError {
    HardwareError::Io {
        device: device.to_string(),
        msg: msg.to_string(),
    }
}

impl SimHardware {
    /// `trigger` and `trap` are the inputs wired to the sequencer trigger and the RF pickup;
    /// every other enabled input is a detector.
    pub fn new(trigger: u8, trap: u8) -> Self {
        Self {
            trigger,
            trap,
            state: Mutex::new(SimState {
                enabled: BTreeSet::new(),
                clock: 1,
                pending: Vec::new(),
                ion_present: true,
                photons_per_read: 5,
                events_per_cycle: 4,
                blink: Vec::new(),
                blink_pos: 0,
                load_after_reads: None,
                reads_while_loading: 0,
                trapping: false,
                pins: BTreeMap::new(),
                trap_depth: 0.,
                trap_depth_history: Vec::new(),
                profiles: Vec::new(),
                ram: BTreeMap::new(),
                program: Vec::new(),
                n_cycles: 0,
                running: false,
                polls_left: 0,
                done_after_polls: 2,
                runs_started: 0,
                dds_attempts: 0,
                faults: Faults::default(),
            }),
        }
    }

    // Scenario setup
    pub fn set_ion_present(&self, present: bool) {
        self.state.lock().ion_present = present;
    }
    pub fn set_photons_per_read(&self, photons: usize) {
        self.state.lock().photons_per_read = photons;
    }
    pub fn set_events_per_cycle(&self, events: usize) {
        self.state.lock().events_per_cycle = events;
    }
    /// Bright/dark pattern of consecutive sequencer cycles, repeated
    pub fn set_blink_pattern(&self, pattern: &[bool]) {
        let mut state = self.state.lock();
        state.blink = pattern.to_vec();
        state.blink_pos = 0;
    }
    /// With the oven open, an ion appears after `reads` converter reads
    pub fn set_load_after_reads(&self, reads: Option<usize>) {
        self.state.lock().load_after_reads = reads;
    }
    pub fn set_done_after_polls(&self, polls: usize) {
        self.state.lock().done_after_polls = polls;
    }

    // Fault injection
    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().faults.reads = count;
    }
    pub fn fail_next_dds_writes(&self, count: usize) {
        self.state.lock().faults.dds_writes = count;
    }
    pub fn fail_trap_depth(&self, fail: bool) {
        self.state.lock().faults.trap_depth = fail;
    }
    pub fn stick_pin(&self, pin: u8) {
        self.state.lock().faults.stuck_pins.insert(pin);
    }
    pub fn hang_sequencer(&self, hang: bool) {
        self.state.lock().faults.sequencer_hangs = hang;
    }

    // Inspection
    pub fn enabled_channels(&self) -> BTreeSet<u8> {
        self.state.lock().enabled.clone()
    }
    pub fn pin(&self, pin: u8) -> bool {
        self.state.lock().pins.get(&pin).copied().unwrap_or(false)
    }
    pub fn any_pin_high(&self) -> bool {
        self.state.lock().pins.values().any(|&high| high)
    }
    pub fn trapping(&self) -> bool {
        self.state.lock().trapping
    }
    pub fn trap_depth(&self) -> f64 {
        self.state.lock().trap_depth
    }
    pub fn trap_depth_history(&self) -> Vec<f64> {
        self.state.lock().trap_depth_history.clone()
    }
    pub fn ram(&self, board: u8) -> Option<Vec<u16>> {
        self.state.lock().ram.get(&board).cloned()
    }
    pub fn profiles(&self) -> Vec<(u8, u8, f64, f64, f64)> {
        self.state.lock().profiles.clone()
    }
    pub fn runs_started(&self) -> usize {
        self.state.lock().runs_started
    }
    pub fn dds_attempts(&self) -> usize {
        self.state.lock().dds_attempts
    }

    fn detectors(&self, state: &SimState) -> Vec<u8> {
        state
            .enabled
            .iter()
            .copied()
            .filter(|&chan| chan != self.trigger && chan != self.trap)
            .collect()
    }

    fn dds_write<F>(&self, what: &str, write: F) -> HwResult<()>
    where
        F: FnOnce(&mut SimState),
    {
        let mut state = self.state.lock();
        state.dds_attempts += 1;
        if state.faults.dds_writes > 0 {
            state.faults.dds_writes -= 1;
            return Err(HardwareError::Busy(format!("DDS serial port ({what})")));
        }
        write(&mut *state);
        Ok(())
    }
}

impl TimestampSource for SimHardware {
    fn enable_channels(&self, channels: &BTreeSet<u8>) -> HwResult<()> {
        self.state.lock().enabled = channels.clone();
        Ok(())
    }

    fn last_timestamps(&self, reset: bool) -> HwResult<TimestampBatch> {
        let mut state = self.state.lock();
        if state.faults.reads > 0 {
            state.faults.reads -= 1;
            return Err(io_error("timestamp converter", "USB transfer failed"));
        }

        if state.pins.values().any(|&high| high) {
            if let Some(after) = state.load_after_reads {
                state.reads_while_loading += 1;
                if state.reads_while_loading >= after {
                    state.ion_present = true;
                }
            }
        }

        let mut events: Vec<(i64, u8)> = if reset {
            std::mem::take(&mut state.pending)
        } else {
            state.pending.clone()
        };
        let start = state.clock;
        if state.ion_present && state.photons_per_read > 0 {
            let spacing = READ_TICKS / (state.photons_per_read as i64 + 1);
            for chan in self.detectors(&state) {
                for j in 1..=state.photons_per_read as i64 {
                    events.push((start + j * spacing + chan as i64, chan));
                }
            }
        }
        if state.enabled.contains(&self.trap) {
            events.extend((0..READ_TICKS / RF_PERIOD_TICKS).map(|m| (start + m * RF_PERIOD_TICKS, self.trap)));
        }
        state.clock += READ_TICKS;

        events.sort_by_key(|&(t, _)| t);
        let valid = events.len();
        let mut tstamp: Vec<i64> = events.iter().map(|&(t, _)| t).collect();
        let mut tchannel: Vec<u8> = events.iter().map(|&(_, c)| c).collect();
        tstamp.extend(std::iter::repeat(0).take(PADDING));
        tchannel.extend(std::iter::repeat(0).take(PADDING));
        Ok(TimestampBatch {
            tstamp,
            tchannel,
            valid,
        })
    }

    fn timebase(&self) -> f64 {
        TIMEBASE
    }
}

impl PulseSequencer for SimHardware {
    fn apply_profile(
        &self,
        board: u8,
        profile: u8,
        frequency: f64,
        amplitude: f64,
        phase: f64,
    ) -> HwResult<()> {
        self.dds_write("profile", |state| {
            state.profiles.push((board, profile, frequency, amplitude, phase))
        })
    }

    fn enter_trapping_mode(&self) -> HwResult<()> {
        self.dds_write("trapping mode", |state| state.trapping = true)
    }

    fn exit_trapping_mode(&self) -> HwResult<()> {
        self.dds_write("trapping mode", |state| state.trapping = false)
    }

    fn write_ram(&self, board: u8, words: &[u16]) -> HwResult<()> {
        self.dds_write("RAM", |state| {
            state.ram.insert(board, words.to_vec());
        })
    }

    fn load_program(&self, pulses: &[Pulse], n_cycles: usize) -> HwResult<()> {
        self.dds_write("program", |state| {
            state.program = pulses.to_vec();
            state.n_cycles = n_cycles;
        })
    }

    fn start(&self) -> HwResult<()> {
        let mut state = self.state.lock();
        if state.program.is_empty() {
            return Err(HardwareError::Rejected {
                device: "pulse sequencer".to_string(),
                msg: "no program loaded".to_string(),
            });
        }
        let length: f64 = state.program.iter().map(|p| p.duration).sum();
        let period = std::cmp::max((length / TIMEBASE).round() as i64, 1);
        let detectors = self.detectors(&state);
        let trigger_enabled = state.enabled.contains(&self.trigger);
        let per_cycle = state.events_per_cycle as i64;

        for cycle in 0..state.n_cycles as i64 {
            let t0 = state.clock + 1 + cycle * period;
            if trigger_enabled {
                state.pending.push((t0, self.trigger));
            }
            let bright = if state.blink.is_empty() {
                state.ion_present
            } else {
                let bright = state.blink[state.blink_pos % state.blink.len()];
                state.blink_pos += 1;
                bright
            };
            if !bright {
                continue;
            }
            for &chan in &detectors {
                for j in 1..=per_cycle {
                    state.pending.push((t0 + j * period / (per_cycle + 1), chan));
                }
            }
        }
        state.clock += (state.n_cycles as i64 + 1) * period;
        state.running = true;
        state.polls_left = state.done_after_polls;
        state.runs_started += 1;
        Ok(())
    }

    fn stop(&self) -> HwResult<()> {
        self.state.lock().running = false;
        Ok(())
    }

    fn is_done(&self) -> HwResult<bool> {
        let mut state = self.state.lock();
        if state.faults.sequencer_hangs {
            return Ok(false);
        }
        if state.polls_left > 0 {
            state.polls_left -= 1;
            return Ok(false);
        }
        state.running = false;
        Ok(true)
    }
}

impl AnalogDigitalOut for SimHardware {
    fn set_digital_pin(&self, pin: u8, high: bool) -> HwResult<()> {
        let mut state = self.state.lock();
        if !high && state.faults.stuck_pins.contains(&pin) {
            return Err(io_error("digital output", &format!("line {pin} did not respond")));
        }
        state.pins.insert(pin, high);
        if high {
            state.reads_while_loading = 0;
        }
        Ok(())
    }

    fn set_trap_depth(&self, voltage: f64) -> HwResult<()> {
        let mut state = self.state.lock();
        if state.faults.trap_depth {
            return Err(io_error("trap DAC", "serial write failed"));
        }
        state.trap_depth = voltage;
        state.trap_depth_history.push(voltage);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_are_padded_and_sorted() {
        let sim = SimHardware::new(0, 5);
        sim.enable_channels(&BTreeSet::from([1, 3])).unwrap();
        let batch = sim.last_timestamps(true).unwrap();
        assert_eq!(batch.valid, 10);
        assert_eq!(batch.tstamp.len(), 10 + PADDING);
        assert!(batch.tstamp[..batch.valid].windows(2).all(|w| w[0] <= w[1]));
        assert!(batch.tstamp[batch.valid..].iter().all(|&t| t == 0));
    }

    #[test]
    fn runs_emit_one_trigger_per_cycle() {
        let sim = SimHardware::new(0, 5);
        sim.set_ion_present(false);
        sim.enable_channels(&BTreeSet::from([0, 1])).unwrap();
        sim.load_program(&[Pulse { bits: 1, duration: 1e-6 }], 3).unwrap();
        sim.set_blink_pattern(&[true, false]);
        sim.start().unwrap();
        let batch = sim.last_timestamps(true).unwrap();
        let triggers = batch.tchannel[..batch.valid].iter().filter(|&&c| c == 0).count();
        let photons = batch.tchannel[..batch.valid].iter().filter(|&&c| c == 1).count();
        assert_eq!(triggers, 3);
        assert_eq!(photons, 2 * 4);
    }

    #[test]
    fn oven_loads_an_ion() {
        let sim = SimHardware::new(0, 5);
        sim.set_ion_present(false);
        sim.set_load_after_reads(Some(2));
        sim.set_digital_pin(0, true).unwrap();
        sim.last_timestamps(true).unwrap();
        assert!(!sim.state.lock().ion_present);
        sim.last_timestamps(true).unwrap();
        assert!(sim.state.lock().ion_present);
    }

    #[test]
    fn stuck_pin_cannot_go_low() {
        let sim = SimHardware::new(0, 5);
        sim.stick_pin(0);
        sim.set_digital_pin(0, true).unwrap();
        assert!(sim.set_digital_pin(0, false).is_err());
        assert!(sim.pin(0));
    }
}
