use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use iontrap_backend::{default_experiment_modes, ChannelMode, PulseSequence, Ramp, Section};
use iontrapctrl_backend::sim::SimHardware;
use iontrapctrl_backend::*;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Runs the ion-trap control stack against simulated hardware",
    long_about = None
)]
struct Args {
    /// JSON configuration; lab defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Committed runs of the demo experiment
    #[arg(long, default_value_t = 5)]
    iterations: usize,

    /// Acquisition runs pooled by the RF-correlation demo
    #[arg(long, default_value_t = 20)]
    rf_runs: usize,

    /// Seconds of count-rate sampling before the experiment
    #[arg(long, default_value_t = 0.5)]
    count_time: f64,
}

fn demo_sequence() -> iontrap_backend::Result<PulseSequence> {
    let mut seq = PulseSequence::new(1e-6, 50)?;
    seq.add_device("cooling", 0, 1.)?;
    seq.add_device("probe", 1, 0.)?;
    seq.add_section(Section::new("doppler", 20e-6, 0b01).with_ramp("cooling", Ramp::new_const(0.6)))?;
    seq.add_section(
        Section::new("probe", 10e-6, 0b10)
            .gated()
            .with_ramp("probe", Ramp::new_sine2(0., 1.)),
    )?;
    Ok(seq)
}

fn channel_of(modes: &indexmap::IndexMap<u8, ChannelMode>, mode: ChannelMode) -> Option<u8> {
    modes
        .iter()
        .find(|(_, m)| **m == mode)
        .map(|(number, _)| *number)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ExperimentConfig::from_file(path)?,
        None => ExperimentConfig::default(),
    };

    let modes = config
        .experiment_channels
        .clone()
        .unwrap_or_else(default_experiment_modes);
    let trigger = channel_of(&modes, ChannelMode::Trigger)
        .ok_or(iontrap_backend::Error::MissingChannel(ChannelMode::Trigger))?;
    let trap = config
        .channels
        .iter()
        .find(|(_, spec)| spec.mode == ChannelMode::Trap)
        .map(|(number, _)| *number)
        .ok_or(iontrap_backend::Error::MissingChannel(ChannelMode::Trap))?;

    let sim = Arc::new(SimHardware::new(trigger, trap));
    // Photon budget of one ion at the expected fluorescence in counting mode
    let detectors = config
        .channels
        .values()
        .filter(|spec| spec.mode.is_signal())
        .count()
        .max(1);
    let photons = config.expected_fluorescence / (detectors as f64 * config.rate);
    sim.set_photons_per_read(photons.round() as usize);
    let reader = Arc::new(Reader::new(sim.clone(), &config.channels, config.rate, config.n)?);
    let mut dispatcher = Dispatcher::new(reader.clone());

    for line in ["GET_RATE", "GET_N", "START_COUNTING"] {
        println!("{line} -> {}", dispatcher.dispatch_line(line).to_json());
    }
    std::thread::sleep(secs(args.count_time));
    println!("GET_COUNTS -> {}", dispatcher.dispatch_line("GET_COUNTS").to_json());
    println!("STOP_COUNTING -> {}", dispatcher.dispatch_line("STOP_COUNTING").to_json());

    let rf = reader.rf_correlation(args.rf_runs, 1000., 32)?;
    match &rf.fit {
        Some(fit) => println!(
            "RF correlation over {} runs: amplitude {:.3}, frequency {:.3e} Hz, phase {:.3} rad",
            args.rf_runs, fit.amplitude, fit.frequency, fit.phase
        ),
        None => println!("RF correlation over {} runs: no usable data", args.rf_runs),
    }

    let runner = ExperimentRunner::new(
        reader.clone(),
        sim.clone(),
        sim.clone(),
        ControlToken::new(),
        config,
        demo_sequence()?,
    )?;
    let handle = ExperimentHandle::spawn(runner, Some(args.iterations));
    dispatcher.attach_experiment(handle.commands());
    while !handle.is_finished() {
        let counters = handle.monitor().counters();
        log::debug!(
            "{}: {}/{} valid pulses",
            handle.monitor().state(),
            counters.n_valid_pulses,
            counters.n_total_pulses
        );
        std::thread::sleep(Duration::from_millis(100));
    }
    let summary = handle.join()?;
    dispatcher.detach_experiment();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    for (chan, diffs) in reader.time_diffs() {
        println!("channel {chan}: {} committed delays", diffs.len());
    }
    Ok(())
}
