use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iontrap_backend::{DdsProfile, PulseSequence, Ramp, ReaderMode, Section};
use iontrapctrl_backend::sim::SimHardware;
use iontrapctrl_backend::*;

fn config() -> ExperimentConfig {
    ExperimentConfig {
        rate: 100.,
        check_samples: 1,
        expected_fluorescence: 1000.,
        expected_run_rate: 1e7,
        catch_timeout: 0.05,
        load_timeout: 0.2,
        single_ion_retries: 2,
        single_ion_backoff: 1e-3,
        release_time: 1e-3,
        run_timeout: 0.2,
        poll_interval: 1e-4,
        pause_poll: 5e-3,
        dds_profiles: vec![DdsProfile {
            board: 0,
            profile: 0,
            frequency: 210.,
            amplitude: 0.8,
            phase: 0.,
        }],
        ..Default::default()
    }
}

fn sequence() -> PulseSequence {
    let mut seq = PulseSequence::new(1e-6, 2).unwrap();
    seq.add_device("cooling", 0, 1.).unwrap();
    seq.add_section(Section::new("cool", 1e-6, 0b1).with_ramp("cooling", Ramp::new_const(0.5)))
        .unwrap();
    seq
}

struct Setup {
    sim: Arc<SimHardware>,
    reader: Arc<Reader>,
    token: ControlToken,
}

fn setup() -> Setup {
    let config = config();
    let sim = Arc::new(SimHardware::new(0, 5));
    let reader =
        Arc::new(Reader::new(sim.clone(), &config.channels, config.rate, config.n).unwrap());
    Setup {
        sim,
        reader,
        token: ControlToken::new(),
    }
}

impl Setup {
    fn runner(&self) -> ExperimentRunner {
        ExperimentRunner::new(
            self.reader.clone(),
            self.sim.clone(),
            self.sim.clone(),
            self.token.clone(),
            config(),
            sequence(),
        )
        .unwrap()
    }
}

fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn counting_round_trip() {
    let s = setup();
    s.reader.start_counting().unwrap();
    assert!(s.reader.is_counting());
    assert!(s.reader.wait_for_samples(3, Duration::from_secs(5)));
    let counts = s.reader.get_counts();
    assert_eq!(counts.counts.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert!(counts.counts[&1].iter().all(|&c| c == 5. * 100.));

    s.reader.stop_counting().unwrap();
    assert!(!s.reader.is_counting());
    assert!(s.reader.get_counts().is_empty());
    assert_eq!(s.reader.mode(), ReaderMode::Idle);
    assert!(s.sim.enabled_channels().is_empty());
}

#[test]
fn rf_correlation_restores_the_previous_mode() {
    let s = setup();
    s.reader.enter_counting().unwrap();

    let rf = s.reader.rf_correlation(5, 1000., 16).unwrap();
    assert!(!rf.histogram.is_empty());
    assert_eq!(s.reader.mode(), ReaderMode::Counting);
    assert_eq!(s.sim.enabled_channels(), BTreeSet::from([1, 3]));

    s.sim.set_ion_present(false);
    let rf = s.reader.rf_correlation(5, 1000., 16).unwrap();
    assert!(rf.is_empty());
    assert_eq!(s.reader.mode(), ReaderMode::Counting);
    assert_eq!(s.sim.enabled_channels(), BTreeSet::from([1, 3]));
}

#[test]
fn dispatcher_answers_every_line() {
    let s = setup();
    let dispatcher = Dispatcher::new(s.reader.clone());
    assert_eq!(
        dispatcher.dispatch_line("MAKE_COFFEE"),
        Response::UnknownCommand("MAKE_COFFEE".to_string())
    );
    assert_eq!(dispatcher.dispatch_line("SET_RATE 50"), Response::Ok);
    assert_eq!(dispatcher.dispatch_line("GET_RATE"), Response::Rate(50.));
    assert!(matches!(dispatcher.dispatch_line("SET_N 0"), Response::Error(_)));
    assert!(matches!(
        dispatcher.dispatch_line("PAUSE_EXPERIMENT"),
        Response::Error(_)
    ));
    match dispatcher.dispatch_line("GET_LAST_TIMESTAMPS") {
        Response::Timestamps { tstamp, tchannel } => {
            assert!(tstamp.is_empty());
            assert!(tchannel.is_empty());
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn blinking_ion_yields_half_valid_pulses() {
    let s = setup();
    s.sim.set_blink_pattern(&[true, false]);
    let mut runner = s.runner();
    let mut recvr = CmdChan::new().new_recvr();
    let summary = runner.start_experiment(Some(4), &mut recvr).unwrap();

    assert_eq!(summary.iterations, 4);
    assert_eq!(summary.counters.n_total_pulses, 8);
    assert_eq!(summary.counters.n_valid_pulses, 4);
    assert!(summary.counters.n_valid_pulses <= summary.counters.n_total_pulses);
    assert!(summary.run_time > 0.);
    assert_eq!(s.sim.profiles(), vec![(0, 0, 210., 0.8, 0.)]);
}

#[test]
fn pause_releases_the_hardware_until_resumed() {
    let s = setup();
    let handle = ExperimentHandle::spawn(s.runner(), None);
    let mut dispatcher = Dispatcher::new(s.reader.clone());
    dispatcher.attach_experiment(handle.commands());

    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > 0));
    match s.token.acquire("manual") {
        Err(Error::HardwareBusy { owner }) => assert_eq!(owner, EXPERIMENT_OWNER),
        _ => panic!("the running loop must hold the token"),
    }

    assert_eq!(dispatcher.dispatch_line("PAUSE_EXPERIMENT"), Response::Ok);
    assert!(wait_until(|| handle.monitor().state() == RunnerState::Paused));
    assert!(wait_until(|| s.token.owner().is_none()));
    assert_eq!(s.reader.mode(), ReaderMode::Idle);
    {
        // Manual diagnostics while paused
        let manual = s.token.acquire("manual").unwrap();
        assert_eq!(manual.owner(), "manual");
    }

    let paused_at = handle.monitor().counters().n_total_pulses;
    assert_eq!(dispatcher.dispatch_line("RESUME_EXPERIMENT"), Response::Ok);
    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > paused_at));

    assert_eq!(dispatcher.dispatch_line("STOP_EXPERIMENT"), Response::Ok);
    let summary = handle.join().unwrap();
    assert!(summary.stopped);
    assert!(summary.iterations >= 2);
    assert_eq!(s.token.owner(), None);
    assert_eq!(s.reader.mode(), ReaderMode::Idle);
}

#[test]
fn lost_ion_discards_the_run_and_pauses() {
    let s = setup();
    let handle = ExperimentHandle::spawn(s.runner(), None);
    assert!(wait_until(|| handle.monitor().counters().n_valid_pulses > 0));

    s.sim.set_ion_present(false);
    assert!(wait_until(|| handle.monitor().state() == RunnerState::Paused));
    handle.stop();
    let summary = handle.join().unwrap();
    assert!(summary.stopped);
    assert!(summary.discarded >= 1);
    assert!(!s.sim.any_pin_high());
    assert!(!s.sim.trapping());
}

#[test]
fn failed_resume_stays_paused() {
    let s = setup();
    let handle = ExperimentHandle::spawn(s.runner(), None);
    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > 0));
    handle.pause();
    assert!(wait_until(|| handle.monitor().state() == RunnerState::Paused));

    // No ion and no way to load one
    s.sim.set_ion_present(false);
    handle.resume();
    assert!(wait_until(|| s.sim.trap_depth_history().len() >= 2));
    assert!(wait_until(|| handle.monitor().state() == RunnerState::Paused));
    assert!(!s.sim.any_pin_high());

    handle.stop();
    let summary = handle.join().unwrap();
    assert!(summary.stopped);
}

#[test]
fn stop_during_a_hung_run_ends_the_loop() {
    let s = setup();
    let handle = ExperimentHandle::spawn(s.runner(), None);
    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > 0));

    s.sim.hang_sequencer(true);
    std::thread::sleep(Duration::from_millis(100));
    handle.stop();
    assert!(wait_until(|| handle.is_finished()));
    let summary = handle.join().unwrap();
    assert!(summary.stopped);
    assert_eq!(s.token.owner(), None);
}

#[test]
fn pause_sent_during_a_failed_run_does_not_undo_the_resume() {
    let s = setup();
    let handle = ExperimentHandle::spawn(s.runner(), None);
    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > 0));

    s.sim.hang_sequencer(true);
    std::thread::sleep(Duration::from_millis(50));
    handle.pause();
    assert!(wait_until(|| handle.monitor().state() == RunnerState::Paused));

    s.sim.hang_sequencer(false);
    let paused_at = handle.monitor().counters().n_total_pulses;
    handle.resume();
    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > paused_at + 2));
    assert_eq!(handle.monitor().state(), RunnerState::Running);

    handle.stop();
    assert!(handle.join().unwrap().stopped);
}

#[test]
fn stop_counting_during_an_experiment_is_harmless() {
    let s = setup();
    let handle = ExperimentHandle::spawn(s.runner(), None);
    let dispatcher = Dispatcher::new(s.reader.clone());
    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > 0));

    assert_eq!(dispatcher.dispatch_line("STOP_COUNTING"), Response::Ok);
    assert_eq!(s.reader.mode(), ReaderMode::Experiment);

    let before = handle.monitor().counters().n_total_pulses;
    assert!(wait_until(|| handle.monitor().counters().n_total_pulses > before + 2));
    assert_eq!(handle.monitor().state(), RunnerState::Running);
    handle.stop();
    let summary = handle.join().unwrap();
    assert_eq!(summary.discarded, 0);
}
