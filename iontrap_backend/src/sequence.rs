//! Composes a pulse sequence out of named sections and turns it into what the hardware plays
//! back: one amplitude RAM array per DDS device, plus a list of TTL pulses for the sequencer.
//!
//! ## Main structures
//!
//! - [`Ramp`]: an amplitude shape ([`RampType`] plus an argument dictionary) evaluated over the
//!   normalized time of one section.
//! - [`Section`]: one step of the sequence, with a duration, the 16-bit TTL pattern held during
//!   it, a `gated` flag (detectors counted during this section) and one ramp per DDS device.
//! - [`DdsDevice`]: a DDS board in RAM-playback mode with its cached amplitude array.
//! - [`PulseSequence`]: the ordered sections and the devices they drive.
//!
//! ## RAM layout
//! Each device's array starts with its cooling word, followed by the samples of every section
//! at `time_step`. Devices without a ramp in a section play amplitude 0 during it. Arrays are
//! capped at [`RAM_LIMIT`] words.
//!
//! ## Incremental rebuilds
//! Editing a section marks only the devices whose ramps changed; changing the section list or
//! a duration marks every device. [`PulseSequence::build_ram_arrays`] rebuilds just the marked
//! devices.

use indexmap::IndexMap;
use maplit::hashmap;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use crate::error::*;

/// Maximum number of amplitude words a DDS board can store
pub const RAM_LIMIT: usize = 1020;
/// Amplitude code of a full-scale output (14-bit DAC)
pub const AMPLITUDE_FULL_SCALE: u16 = 16383;
/// Number of single-tone profiles per DDS board
pub const NUM_PROFILES: u8 = 8;

/// Argument dictionary of a ramp: argument name to value
pub type RampArgs = HashMap<String, f64>;

/// Supported amplitude shapes: `CONST`, `LINEAR`, `SINE2`
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RampType {
    CONST,
    LINEAR,
    SINE2,
}

impl fmt::Display for RampType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RampType::CONST => "CONST",
                RampType::LINEAR => "LINEAR",
                RampType::SINE2 => "SINE2",
            }
        )
    }
}

/// Amplitude shape over one section.
///
/// ## Expected fields
/// 1. `RampType::CONST`: `value`
/// 2. `RampType::LINEAR`: `start`, `end`
/// 3. `RampType::SINE2`: `start`, `end`. Follows `start + (end - start) sin^2(pi t / 2)`, a ramp
///    with zero slope at the start.
///
/// `t` runs over `[0, 1)` across the section.
#[derive(Clone, Debug, PartialEq)]
pub struct Ramp {
    pub ramp_type: RampType,
    pub args: RampArgs,
}

impl Ramp {
    /// Checks that `args` contains the keys required by `ramp_type`.
    ///
    /// ```
    /// use iontrap_backend::sequence::*;
    ///
    /// let mut args = RampArgs::new();
    /// args.insert("value".to_string(), 0.5);
    /// assert!(Ramp::new(RampType::CONST, args).is_ok());
    /// assert!(Ramp::new(RampType::LINEAR, RampArgs::new()).is_err());
    /// ```
    pub fn new(ramp_type: RampType, args: RampArgs) -> Result<Self> {
        let required: &[&str] = match ramp_type {
            RampType::CONST => &["value"],
            RampType::LINEAR | RampType::SINE2 => &["start", "end"],
        };
        if let Some(key) = required.iter().find(|key| !args.contains_key(**key)) {
            return Err(Error::InvalidParameter(format!(
                "ramp {ramp_type} expects key {key}"
            )));
        }
        Ok(Ramp { ramp_type, args })
    }

    pub fn new_const(value: f64) -> Ramp {
        Ramp {
            ramp_type: RampType::CONST,
            args: hashmap! {String::from("value") => value},
        }
    }

    pub fn new_linear(start: f64, end: f64) -> Ramp {
        Ramp {
            ramp_type: RampType::LINEAR,
            args: hashmap! {"start".to_string() => start, "end".to_string() => end},
        }
    }

    pub fn new_sine2(start: f64, end: f64) -> Ramp {
        Ramp {
            ramp_type: RampType::SINE2,
            args: hashmap! {"start".to_string() => start, "end".to_string() => end},
        }
    }

    fn arg(&self, key: &str) -> f64 {
        self.args.get(key).copied().unwrap_or(0.)
    }

    /// Replaces the normalized times in `t_arr` with amplitude fractions.
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>) {
        match self.ramp_type {
            RampType::CONST => t_arr.fill(self.arg("value")),
            RampType::LINEAR => {
                let (start, end) = (self.arg("start"), self.arg("end"));
                t_arr.map_inplace(|t| *t = start + (end - start) * *t);
            }
            RampType::SINE2 => {
                let (start, end) = (self.arg("start"), self.arg("end"));
                t_arr.map_inplace(|t| *t = start + (end - start) * (PI * *t / 2.).sin().powi(2));
            }
        }
    }
}

impl fmt::Display for Ramp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        args.sort();
        write!(f, "[{}, {{{}}}]", self.ramp_type, args.join(", "))
    }
}

/// Converts an amplitude fraction into a 14-bit code. Values outside `[0, 1]` are rejected.
pub fn amplitude_code(value: f64, origin: &str) -> Result<u16> {
    if !(0. ..=1.).contains(&value) {
        return Err(Error::AmplitudeOutOfRange {
            origin: origin.to_string(),
            value,
        });
    }
    Ok((value * AMPLITUDE_FULL_SCALE as f64).round() as u16)
}

pub fn validate_profile(profile: u8) -> Result<u8> {
    if profile >= NUM_PROFILES {
        return Err(Error::ProfileOutOfRange(profile));
    }
    Ok(profile)
}

/// Single-tone setting of one DDS profile register
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DdsProfile {
    pub board: u8,
    pub profile: u8,
    /// Output frequency in MHz
    pub frequency: f64,
    /// Amplitude fraction in `[0, 1]`
    pub amplitude: f64,
    /// Phase in degrees
    #[serde(default)]
    pub phase: f64,
}

impl DdsProfile {
    pub fn validate(&self) -> Result<()> {
        validate_profile(self.profile)?;
        amplitude_code(self.amplitude, &format!("profile {} of board {}", self.profile, self.board))?;
        if !(self.frequency > 0.) {
            return Err(Error::InvalidParameter(format!(
                "profile {} of board {} has non-positive frequency {}",
                self.profile, self.board, self.frequency
            )));
        }
        Ok(())
    }
}

/// One TTL step of the sequencer program
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Pulse {
    pub bits: u16,
    /// Seconds
    pub duration: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    pub name: String,
    pub duration: f64,
    pub bits: u16,
    pub gated: bool,
    pub ramps: IndexMap<String, Ramp>,
}

impl Section {
    pub fn new(name: &str, duration: f64, bits: u16) -> Self {
        Section {
            name: name.to_string(),
            duration,
            bits,
            gated: false,
            ramps: IndexMap::new(),
        }
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn with_ramp(mut self, device: &str, ramp: Ramp) -> Self {
        self.ramps.insert(device.to_string(), ramp);
        self
    }
}

#[derive(Clone, Debug)]
pub struct DdsDevice {
    name: String,
    board: u8,
    cooling_amplitude: f64,
    ram: Vec<u16>,
    edited: bool,
}

impl DdsDevice {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn board(&self) -> u8 {
        self.board
    }
    pub fn cooling_amplitude(&self) -> f64 {
        self.cooling_amplitude
    }
    pub fn ram(&self) -> &[u16] {
        &self.ram
    }
    pub fn edited(&self) -> bool {
        self.edited
    }
}

pub struct PulseSequence {
    time_step: f64,
    n_cycles: usize,
    sections: IndexMap<String, Section>,
    devices: IndexMap<String, DdsDevice>,
}

impl PulseSequence {
    /// `time_step` is the RAM playback step in seconds; `n_cycles` the number of times the
    /// sequencer repeats the program per trigger.
    pub fn new(time_step: f64, n_cycles: usize) -> Result<Self> {
        if !(time_step > 0.) {
            return Err(Error::InvalidParameter(format!(
                "RAM time step must be positive, got {time_step}"
            )));
        }
        if n_cycles == 0 {
            return Err(Error::InvalidParameter(
                "sequence must run at least one cycle".to_string(),
            ));
        }
        Ok(Self {
            time_step,
            n_cycles,
            sections: IndexMap::new(),
            devices: IndexMap::new(),
        })
    }

    // Field methods
    pub fn time_step(&self) -> f64 {
        self.time_step
    }
    pub fn n_cycles(&self) -> usize {
        self.n_cycles
    }
    pub fn sections(&self) -> &IndexMap<String, Section> {
        &self.sections
    }
    pub fn devices(&self) -> &IndexMap<String, DdsDevice> {
        &self.devices
    }

    pub fn add_device(&mut self, name: &str, board: u8, cooling_amplitude: f64) -> Result<()> {
        amplitude_code(cooling_amplitude, name)?;
        if self.devices.contains_key(name) {
            return Err(Error::InvalidParameter(format!("device {name} already exists")));
        }
        self.devices.insert(
            name.to_string(),
            DdsDevice {
                name: name.to_string(),
                board,
                cooling_amplitude,
                ram: Vec::new(),
                edited: true,
            },
        );
        Ok(())
    }

    pub fn ram(&self, device: &str) -> Option<&[u16]> {
        self.devices.get(device).map(|dev| dev.ram())
    }

    /// Devices whose RAM array is stale
    pub fn edited_devices(&self) -> Vec<String> {
        self.devices
            .values()
            .filter(|dev| dev.edited)
            .map(|dev| dev.name.clone())
            .collect()
    }

    fn mark_all(&mut self) {
        self.devices.values_mut().for_each(|dev| dev.edited = true);
    }

    fn check_section(&self, section: &Section) -> Result<()> {
        if !(section.duration > 0.) {
            return Err(Error::InvalidParameter(format!(
                "section {} has non-positive duration {}",
                section.name, section.duration
            )));
        }
        if let Some(device) = section.ramps.keys().find(|dev| !self.devices.contains_key(*dev)) {
            return Err(Error::InvalidParameter(format!(
                "section {} ramps unknown device {}",
                section.name, device
            )));
        }
        Ok(())
    }

    /// Appends a section. Every device is marked edited since the sample layout shifts.
    pub fn add_section(&mut self, section: Section) -> Result<()> {
        self.check_section(&section)?;
        if self.sections.contains_key(&section.name) {
            return Err(Error::InvalidParameter(format!(
                "section {} already exists",
                section.name
            )));
        }
        self.sections.insert(section.name.clone(), section);
        self.mark_all();
        Ok(())
    }

    pub fn remove_section(&mut self, name: &str) -> Option<Section> {
        let removed = self.sections.shift_remove(name);
        if removed.is_some() {
            self.mark_all();
        }
        removed
    }

    /// Edits a section in place. Only devices whose ramp differs afterwards are marked edited,
    /// unless the duration changed. A rejected edit leaves the section untouched.
    pub fn edit_section<F>(&mut self, name: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Section),
    {
        let before = self
            .sections
            .get(name)
            .ok_or_else(|| Error::InvalidParameter(format!("no section named {name}")))?
            .clone();
        let mut after = before.clone();
        edit(&mut after);
        after.name = before.name.clone();
        self.check_section(&after)?;

        if after.duration != before.duration {
            self.mark_all();
        } else {
            for (dev_name, dev) in self.devices.iter_mut() {
                if before.ramps.get(dev_name) != after.ramps.get(dev_name) {
                    dev.edited = true;
                }
            }
        }
        self.sections.insert(after.name.clone(), after);
        Ok(())
    }

    fn samples(&self, section: &Section) -> usize {
        std::cmp::max((section.duration / self.time_step).round() as usize, 1)
    }

    fn compile_device(&self, device: &DdsDevice) -> Result<Vec<u16>> {
        let mut ram = vec![amplitude_code(device.cooling_amplitude, &device.name)?];
        for section in self.sections.values() {
            let n = self.samples(section);
            if ram.len() + n > RAM_LIMIT {
                return Err(Error::RamOverflow {
                    device: device.name.clone(),
                    len: ram.len() + n,
                    max: RAM_LIMIT,
                });
            }
            let Some(ramp) = section.ramps.get(&device.name) else {
                ram.extend(std::iter::repeat(0).take(n));
                continue;
            };
            let mut values = Array1::from_iter((0..n).map(|i| i as f64 / n as f64));
            ramp.eval_inplace(&mut values.view_mut());
            let origin = format!("section {} of {}", section.name, device.name);
            for &v in values.iter() {
                ram.push(amplitude_code(v, &origin)?);
            }
        }
        Ok(ram)
    }

    /// Rebuilds the RAM arrays of the edited devices and returns their names.
    ///
    /// Fails on the first device whose array would exceed [`RAM_LIMIT`] or whose ramp leaves
    /// `[0, 1]`; that device stays marked edited and keeps its previous array.
    pub fn build_ram_arrays(&mut self) -> Result<Vec<String>> {
        let mut rebuilt = Vec::new();
        for name in self.edited_devices() {
            let Some(device) = self.devices.get(&name) else {
                continue;
            };
            let ram = self.compile_device(device)?;
            if let Some(device) = self.devices.get_mut(&name) {
                log::debug!("Rebuilt RAM of {} ({} words)", name, ram.len());
                device.ram = ram;
                device.edited = false;
            }
            rebuilt.push(name);
        }
        Ok(rebuilt)
    }

    pub fn pulses(&self) -> Vec<Pulse> {
        self.sections
            .values()
            .map(|section| Pulse {
                bits: section.bits,
                duration: section.duration,
            })
            .collect()
    }

    /// Duration of one cycle in seconds
    pub fn sequence_length(&self) -> f64 {
        self.sections.values().map(|s| s.duration).sum()
    }

    /// Gated time over total time; 0 for an empty sequence.
    pub fn gated_fraction(&self) -> f64 {
        let total = self.sequence_length();
        if total <= 0. {
            return 0.;
        }
        let gated: f64 = self
            .sections
            .values()
            .filter(|s| s.gated)
            .map(|s| s.duration)
            .sum();
        gated / total
    }
}

#[cfg(test)]
mod test {
    use crate::sequence::*;

    fn two_device_sequence() -> PulseSequence {
        let mut seq = PulseSequence::new(1e-6, 10).unwrap();
        seq.add_device("cooling", 0, 1.).unwrap();
        seq.add_device("probe", 1, 0.).unwrap();
        seq.add_section(
            Section::new("doppler", 4e-6, 0b01).with_ramp("cooling", Ramp::new_const(0.5)),
        )
        .unwrap();
        seq.add_section(
            Section::new("probe", 2e-6, 0b10)
                .gated()
                .with_ramp("probe", Ramp::new_linear(0., 1.)),
        )
        .unwrap();
        seq
    }

    mod ramps {
        use crate::sequence::*;

        #[test]
        fn missing_keys_are_rejected() {
            let args = hashmap! {"start".to_string() => 0.};
            assert!(matches!(
                Ramp::new(RampType::SINE2, args),
                Err(Error::InvalidParameter(_))
            ));
        }

        #[test]
        fn shapes() {
            let mut t = Array1::from_vec(vec![0., 0.5]);
            Ramp::new_linear(0.2, 0.4).eval_inplace(&mut t.view_mut());
            assert!((t[1] - 0.3).abs() < 1e-12);

            let mut t = Array1::from_vec(vec![0., 0.5]);
            Ramp::new_sine2(0., 1.).eval_inplace(&mut t.view_mut());
            assert_eq!(t[0], 0.);
            assert!((t[1] - 0.5).abs() < 1e-12);
        }

        #[test]
        fn amplitude_codes() {
            assert_eq!(amplitude_code(1., "test").unwrap(), AMPLITUDE_FULL_SCALE);
            assert_eq!(amplitude_code(0., "test").unwrap(), 0);
            assert!(amplitude_code(1.01, "test").is_err());
            assert!(amplitude_code(-0.01, "test").is_err());
            assert!(amplitude_code(f64::NAN, "test").is_err());
        }

        #[test]
        fn profile_range() {
            assert!(validate_profile(7).is_ok());
            assert!(matches!(validate_profile(8), Err(Error::ProfileOutOfRange(8))));
        }
    }

    mod ram {
        use super::*;

        #[test]
        fn layout_is_cooling_word_then_sections() {
            let mut seq = two_device_sequence();
            let rebuilt = seq.build_ram_arrays().unwrap();
            assert_eq!(rebuilt, vec!["cooling".to_string(), "probe".to_string()]);

            let cooling = seq.ram("cooling").unwrap();
            assert_eq!(cooling.len(), 1 + 4 + 2);
            assert_eq!(cooling[0], AMPLITUDE_FULL_SCALE);
            assert!(cooling[1..5].iter().all(|&w| w == 8192));
            assert_eq!(&cooling[5..], &[0, 0]);

            let probe = seq.ram("probe").unwrap();
            assert_eq!(&probe[..5], &[0; 5]);
            assert_eq!(probe[5], 0);
            assert_eq!(probe[6], 8192);
        }

        #[test]
        fn only_edited_devices_are_rebuilt() {
            let mut seq = two_device_sequence();
            seq.build_ram_arrays().unwrap();
            assert!(seq.edited_devices().is_empty());
            assert!(seq.build_ram_arrays().unwrap().is_empty());

            seq.edit_section("probe", |s| {
                s.ramps.insert("probe".to_string(), Ramp::new_sine2(0., 0.5));
            })
            .unwrap();
            assert_eq!(seq.build_ram_arrays().unwrap(), vec!["probe".to_string()]);

            // A new duration shifts every device
            seq.edit_section("doppler", |s| s.duration = 3e-6).unwrap();
            assert_eq!(seq.edited_devices().len(), 2);
        }

        #[test]
        fn overflow_is_an_error() {
            let mut seq = PulseSequence::new(1e-6, 1).unwrap();
            seq.add_device("cooling", 0, 1.).unwrap();
            seq.add_section(Section::new("long", 2e-3, 0).with_ramp("cooling", Ramp::new_const(1.)))
                .unwrap();
            assert!(matches!(
                seq.build_ram_arrays(),
                Err(Error::RamOverflow { max: RAM_LIMIT, .. })
            ));
            assert!(seq.devices()["cooling"].edited());
        }

        #[test]
        fn out_of_range_ramp_is_not_clamped() {
            let mut seq = two_device_sequence();
            seq.edit_section("doppler", |s| {
                s.ramps.insert("cooling".to_string(), Ramp::new_linear(0.5, 1.5));
            })
            .unwrap();
            assert!(matches!(
                seq.build_ram_arrays(),
                Err(Error::AmplitudeOutOfRange { .. })
            ));
        }

        #[test]
        fn unknown_device_is_rejected() {
            let mut seq = two_device_sequence();
            let section = Section::new("repump", 1e-6, 0).with_ramp("ghost", Ramp::new_const(1.));
            assert!(seq.add_section(section).is_err());
            assert!(seq.edit_section("missing", |_| {}).is_err());
        }
    }

    mod program {
        use super::*;

        #[test]
        fn pulses_and_gating() {
            let seq = two_device_sequence();
            assert_eq!(
                seq.pulses(),
                vec![
                    Pulse { bits: 0b01, duration: 4e-6 },
                    Pulse { bits: 0b10, duration: 2e-6 }
                ]
            );
            assert!((seq.sequence_length() - 6e-6).abs() < 1e-18);
            assert!((seq.gated_fraction() - 1. / 3.).abs() < 1e-12);
            assert_eq!(PulseSequence::new(1e-6, 1).unwrap().gated_fraction(), 0.);
        }
    }
}
