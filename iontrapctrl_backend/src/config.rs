//! JSON configuration of a control session.
//!
//! Every field has a default, so a file only lists what differs from the lab defaults. Times
//! are in seconds, voltages in volts, rates in counts per second. The configuration is validated
//! as a whole before anything touches hardware.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use iontrap_backend::{validate_modes, validate_trap_depth, ChannelMode, ChannelSpec, DdsProfile};

use crate::error::*;
use crate::utils::secs;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Construction-time channel assignment; missing numbers are idle
    pub channels: IndexMap<u8, ChannelSpec>,
    /// Assignment applied while an experiment runs; `None` uses the standard one
    pub experiment_channels: Option<IndexMap<u8, ChannelMode>>,
    /// Count-rate sampling rate
    pub rate: f64,
    /// Rolling-window length of the count history
    pub n: usize,

    /// Fluorescence below which the ion is presumed lost
    pub pmt_threshold: f64,
    /// Fluorescence of exactly one cooled ion, as seen by the counting channels
    pub expected_fluorescence: f64,
    /// Detector rate inside a trigger window when the ion is bright
    pub expected_run_rate: f64,
    /// Fraction of `expected_run_rate` a trigger window needs to count as valid
    pub gate_min_fraction: f64,
    /// Fraction of `expected_fluorescence` that ends a catch attempt successfully
    pub catch_fraction: f64,
    /// Relative tolerance of the single-ion check
    pub single_ion_tolerance: f64,
    pub single_ion_retries: usize,
    pub single_ion_backoff: f64,
    /// Number of rate samples averaged by each fluorescence check
    pub check_samples: usize,

    pub catch_timeout: f64,
    pub load_timeout: f64,
    pub load_attempts: usize,
    pub oven_pin: u8,
    pub shutter_pin: u8,
    pub loading_trap_depth: f64,
    pub operating_trap_depth: f64,
    /// Depth used to release a stuck multi-ion or dark state before reloading
    pub release_trap_depth: f64,
    pub release_time: f64,

    /// Longest wait for the sequencer's run-complete line
    pub run_timeout: f64,
    /// Share of the calibrated run time slept before polling the run-complete line
    pub run_time_margin: f64,
    pub poll_interval: f64,
    /// Poll period while paused
    pub pause_poll: f64,

    /// Profiles written to the DDS boards when the sequence is flashed
    pub dds_profiles: Vec<DdsProfile>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let spec = |name: &str, mode| ChannelSpec {
            name: name.to_string(),
            mode,
        };
        Self {
            channels: IndexMap::from([
                (0, spec("sequencer trigger", ChannelMode::Trigger)),
                (1, spec("PMT", ChannelMode::SignalF)),
                (3, spec("SPCM", ChannelMode::SignalSp)),
                (5, spec("RF pickup", ChannelMode::Trap)),
            ]),
            experiment_channels: None,
            rate: 10.,
            n: 100,
            pmt_threshold: 500.,
            expected_fluorescence: 2000.,
            expected_run_rate: 1e6,
            gate_min_fraction: 0.5,
            catch_fraction: 0.5,
            single_ion_tolerance: 0.1,
            single_ion_retries: 5,
            single_ion_backoff: 1.,
            check_samples: 5,
            catch_timeout: 10.,
            load_timeout: 60.,
            load_attempts: 3,
            oven_pin: 0,
            shutter_pin: 1,
            loading_trap_depth: 1.,
            operating_trap_depth: 2.,
            release_trap_depth: 0.2,
            release_time: 0.5,
            run_timeout: 1.,
            run_time_margin: 0.9,
            poll_interval: 1e-3,
            pause_poll: 0.1,
            dds_profiles: Vec::new(),
        }
    }
}

fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Config(msg()))
    }
}

impl ExperimentConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_modes(self.channels.iter().map(|(number, spec)| (number, &spec.mode)))?;
        if let Some(modes) = &self.experiment_channels {
            validate_modes(modes.iter())?;
        }
        for depth in [
            self.loading_trap_depth,
            self.operating_trap_depth,
            self.release_trap_depth,
        ] {
            validate_trap_depth(depth)?;
        }
        for profile in &self.dds_profiles {
            profile.validate()?;
        }

        check(self.rate > 0., || format!("rate must be positive, got {}", self.rate))?;
        check(self.n > 0, || "n must be positive".to_string())?;
        for (name, value) in [
            ("gate_min_fraction", self.gate_min_fraction),
            ("catch_fraction", self.catch_fraction),
            ("single_ion_tolerance", self.single_ion_tolerance),
            ("run_time_margin", self.run_time_margin),
        ] {
            check(value > 0. && value <= 1., || {
                format!("{name} must lie in (0, 1], got {value}")
            })?;
        }
        for (name, value) in [
            ("catch_timeout", self.catch_timeout),
            ("load_timeout", self.load_timeout),
            ("run_timeout", self.run_timeout),
            ("poll_interval", self.poll_interval),
            ("pause_poll", self.pause_poll),
            ("single_ion_backoff", self.single_ion_backoff),
            ("release_time", self.release_time),
        ] {
            check(value > 0. && value.is_finite(), || {
                format!("{name} must be a positive time, got {value}")
            })?;
        }
        check(self.expected_fluorescence > 0., || {
            "expected_fluorescence must be positive".to_string()
        })?;
        check(self.oven_pin != self.shutter_pin, || {
            format!("oven and shutter share pin {}", self.oven_pin)
        })?;
        Ok(())
    }

    pub fn catch_timeout(&self) -> Duration {
        secs(self.catch_timeout)
    }
    pub fn load_timeout(&self) -> Duration {
        secs(self.load_timeout)
    }
    pub fn run_timeout(&self) -> Duration {
        secs(self.run_timeout)
    }
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval)
    }
    pub fn pause_poll(&self) -> Duration {
        secs(self.pause_poll)
    }
    pub fn single_ion_backoff(&self) -> Duration {
        secs(self.single_ion_backoff)
    }
    pub fn release_time(&self) -> Duration {
        secs(self.release_time)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ExperimentConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ExperimentConfig::from_json(
            r#"{
                "rate": 50,
                "channels": {
                    "2": {"name": "PMT", "mode": "signal-f"},
                    "6": {"name": "trigger", "mode": "trigger"}
                },
                "dds_profiles": [{"board": 0, "profile": 3, "frequency": 200.0, "amplitude": 0.8}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.rate, 50.);
        assert_eq!(config.n, 100);
        assert_eq!(config.channels[&6].mode, ChannelMode::Trigger);
        assert_eq!(config.dds_profiles[0].phase, 0.);
    }

    #[test]
    fn trap_depth_beyond_three_volts_fails() {
        let config = ExperimentConfig {
            operating_trap_depth: 3.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Backend(iontrap_backend::Error::TrapDepthOutOfRange(_)))
        ));
    }

    #[test]
    fn duplicate_trigger_fails() {
        let result = ExperimentConfig::from_json(
            r#"{"experiment_channels": {"0": "trigger", "1": "trigger"}}"#,
        );
        assert!(matches!(
            result,
            Err(Error::Backend(iontrap_backend::Error::DuplicateMode { .. }))
        ));
    }

    #[test]
    fn out_of_range_profile_fails() {
        let result = ExperimentConfig::from_json(
            r#"{"dds_profiles": [{"board": 0, "profile": 9, "frequency": 200.0, "amplitude": 0.5}]}"#,
        );
        assert!(matches!(
            result,
            Err(Error::Backend(iontrap_backend::Error::ProfileOutOfRange(9)))
        ));
    }

    #[test]
    fn bad_fraction_fails() {
        let config = ExperimentConfig {
            catch_fraction: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
