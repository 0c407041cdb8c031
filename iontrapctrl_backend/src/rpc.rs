//! Typed command/response boundary of the reader service.
//!
//! The wire format is the legacy one: a command word followed by space-separated arguments,
//! e.g. `SET_RATE 20` or `START_RF_CORRELATION 100 1000 50 0`. Lines are parsed into
//! [`Request`] before anything is dispatched; [`Response`] serializes to JSON. Failures are
//! reported as responses and never cross the boundary as panics.

use regex::Regex;
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use iontrap_backend::{CountSnapshot, RfCorrelation};

use crate::reader::Reader;
use crate::worker_cmd_chan::*;

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    GetCounts,
    StartCounting,
    StopCounting,
    GetRate,
    SetRate(f64),
    GetN,
    SetN(usize),
    StartRfCorrelation {
        no_runs: usize,
        rate: f64,
        no_bins: usize,
        show_plot: bool,
    },
    GetLastTimestamps,
    PauseExperiment,
    ResumeExperiment,
    StopExperiment,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("{command}: {msg}")]
    BadArguments { command: String, msg: String },
}

/// Command word followed by whitespace-separated arguments
static COMMAND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<cmd>[A-Z_]+)(?P<args>(?:\s+\S+)*)\s*$").expect("literal pattern compiles")
});

fn arg<T: FromStr>(command: &str, args: &[&str], idx: usize, name: &str) -> Result<T, RequestError> {
    let bad = |msg: String| RequestError::BadArguments {
        command: command.to_string(),
        msg,
    };
    let raw = args
        .get(idx)
        .ok_or_else(|| bad(format!("missing argument <{name}>")))?;
    raw.parse()
        .map_err(|_| bad(format!("invalid <{name}>: {raw}")))
}

fn no_args(command: &str, args: &[&str], expected: usize) -> Result<(), RequestError> {
    if args.len() != expected {
        return Err(RequestError::BadArguments {
            command: command.to_string(),
            msg: format!("expected {expected} arguments, got {}", args.len()),
        });
    }
    Ok(())
}

impl FromStr for Request {
    type Err = RequestError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let caps = COMMAND_LINE
            .captures(line)
            .ok_or_else(|| RequestError::Unknown(line.trim().to_string()))?;
        let command = &caps["cmd"];
        let args: Vec<&str> = caps["args"].split_whitespace().collect();

        let request = match command {
            "GET_COUNTS" => Request::GetCounts,
            "START_COUNTING" => Request::StartCounting,
            "STOP_COUNTING" => Request::StopCounting,
            "GET_RATE" => Request::GetRate,
            "SET_RATE" => {
                no_args(command, &args, 1)?;
                Request::SetRate(arg(command, &args, 0, "rate")?)
            }
            "GET_N" => Request::GetN,
            "SET_N" => {
                no_args(command, &args, 1)?;
                Request::SetN(arg(command, &args, 0, "n")?)
            }
            "START_RF_CORRELATION" => {
                no_args(command, &args, 4)?;
                let show_plot: u8 = arg(command, &args, 3, "show_plot")?;
                if show_plot > 1 {
                    return Err(RequestError::BadArguments {
                        command: command.to_string(),
                        msg: format!("<show_plot> must be 0 or 1, got {show_plot}"),
                    });
                }
                Request::StartRfCorrelation {
                    no_runs: arg(command, &args, 0, "no_runs")?,
                    rate: arg(command, &args, 1, "rate")?,
                    no_bins: arg(command, &args, 2, "no_bins")?,
                    show_plot: show_plot == 1,
                }
            }
            "GET_LAST_TIMESTAMPS" => Request::GetLastTimestamps,
            "PAUSE_EXPERIMENT" => Request::PauseExperiment,
            "RESUME_EXPERIMENT" => Request::ResumeExperiment,
            "STOP_EXPERIMENT" => Request::StopExperiment,
            _ => return Err(RequestError::Unknown(line.trim().to_string())),
        };
        match request {
            Request::SetRate(_) | Request::SetN(_) | Request::StartRfCorrelation { .. } => {}
            _ => no_args(command, &args, 0)?,
        }
        Ok(request)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok,
    Counts(CountSnapshot),
    Rate(f64),
    N(usize),
    RfCorrelation(RfCorrelation),
    Timestamps { tstamp: Vec<i64>, tchannel: Vec<u8> },
    Error(String),
    UnknownCommand(String),
}

impl Response {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|err| format!("{{\"error\":\"{}\"}}", err.to_string().replace('"', "'")))
    }
}

/// Routes requests to the reader and, while one runs, to the experiment loop.
pub struct Dispatcher {
    reader: Arc<Reader>,
    experiment: Option<CmdChan>,
}

impl Dispatcher {
    pub fn new(reader: Arc<Reader>) -> Self {
        Self {
            reader,
            experiment: None,
        }
    }

    /// Forwards the experiment commands to `cmd`
    pub fn attach_experiment(&mut self, cmd: CmdChan) {
        self.experiment = Some(cmd);
    }

    pub fn detach_experiment(&mut self) {
        self.experiment = None;
    }

    /// Parses and executes one wire line
    pub fn dispatch_line(&self, line: &str) -> Response {
        match line.parse::<Request>() {
            Ok(request) => self.dispatch(request),
            Err(RequestError::Unknown(command)) => {
                log::warn!("Unknown command: {command}");
                Response::UnknownCommand(command)
            }
            Err(err) => Response::Error(err.to_string()),
        }
    }

    fn ok_or_error(result: crate::error::Result<()>) -> Response {
        match result {
            Ok(()) => Response::Ok,
            Err(err) => Response::Error(err.to_string()),
        }
    }

    fn forward(&self, cmd: WorkerCmd) -> Response {
        match &self.experiment {
            Some(chan) => {
                chan.send(cmd);
                Response::Ok
            }
            None => Response::Error("No experiment is running".to_string()),
        }
    }

    pub fn dispatch(&self, request: Request) -> Response {
        log::debug!("Dispatching {request:?}");
        match request {
            Request::GetCounts => Response::Counts(self.reader.get_counts()),
            Request::StartCounting => Self::ok_or_error(self.reader.start_counting()),
            Request::StopCounting => Self::ok_or_error(self.reader.stop_counting()),
            Request::GetRate => Response::Rate(self.reader.rate()),
            Request::SetRate(rate) => Self::ok_or_error(self.reader.set_rate(rate)),
            Request::GetN => Response::N(self.reader.n()),
            Request::SetN(n) => Self::ok_or_error(self.reader.set_n(n)),
            Request::StartRfCorrelation {
                no_runs,
                rate,
                no_bins,
                show_plot,
            } => {
                if show_plot {
                    log::info!("Plotting is left to the client; returning the histogram");
                }
                match self.reader.rf_correlation(no_runs, rate, no_bins) {
                    Ok(result) => Response::RfCorrelation(result),
                    Err(err) => Response::Error(err.to_string()),
                }
            }
            Request::GetLastTimestamps => {
                let batch = self.reader.last_timestamps();
                Response::Timestamps {
                    tstamp: batch.tstamp,
                    tchannel: batch.tchannel,
                }
            }
            Request::PauseExperiment => self.forward(WorkerCmd::Pause),
            Request::ResumeExperiment => self.forward(WorkerCmd::Resume),
            Request::StopExperiment => self.forward(WorkerCmd::Stop),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    mod parsing {
        use super::*;

        #[test]
        fn legacy_lines() {
            assert_eq!("GET_COUNTS".parse::<Request>(), Ok(Request::GetCounts));
            assert_eq!(" SET_RATE 20 ".parse::<Request>(), Ok(Request::SetRate(20.)));
            assert_eq!("SET_N 500".parse::<Request>(), Ok(Request::SetN(500)));
            assert_eq!(
                "START_RF_CORRELATION 100 1000 50 1".parse::<Request>(),
                Ok(Request::StartRfCorrelation {
                    no_runs: 100,
                    rate: 1000.,
                    no_bins: 50,
                    show_plot: true
                })
            );
        }

        #[test]
        fn unknown_and_malformed() {
            assert!(matches!(
                "FIRE_LASER".parse::<Request>(),
                Err(RequestError::Unknown(_))
            ));
            assert!(matches!(
                "get_counts".parse::<Request>(),
                Err(RequestError::Unknown(_))
            ));
            assert!(matches!(
                "SET_N ten".parse::<Request>(),
                Err(RequestError::BadArguments { .. })
            ));
            assert!(matches!(
                "SET_RATE".parse::<Request>(),
                Err(RequestError::BadArguments { .. })
            ));
            assert!(matches!(
                "GET_RATE 4".parse::<Request>(),
                Err(RequestError::BadArguments { .. })
            ));
            assert!(matches!(
                "START_RF_CORRELATION 1 2 3 2".parse::<Request>(),
                Err(RequestError::BadArguments { .. })
            ));
        }
    }

    #[test]
    fn lines_parse_concurrently() {
        let workers: Vec<_> = (0..4)
            .map(|n| std::thread::spawn(move || format!("SET_N {n}").parse::<Request>()))
            .collect();
        for (n, worker) in workers.into_iter().enumerate() {
            assert_eq!(worker.join().unwrap(), Ok(Request::SetN(n)));
        }
    }

    #[test]
    fn responses_serialize_to_json() {
        assert_eq!(Response::Ok.to_json(), "\"ok\"");
        assert_eq!(Response::Rate(10.).to_json(), "{\"rate\":10.0}");
        assert_eq!(
            Response::UnknownCommand("X".to_string()).to_json(),
            "{\"unknown_command\":\"X\"}"
        );
    }
}
