//! # Ion-trap control backend
//!
//! Hardware-facing half of the control system, built on the pure model in [`iontrap_backend`].
//!
//! - [`reader`]: the threaded timestamp reader with its counting loop, RF-correlation
//!   acquisition and per-run processing.
//! - [`experiment`]: ion catching and loading, and the pulsed-experiment loop with
//!   pause/resume through [`worker_cmd_chan`].
//! - [`rpc`]: typed request/response boundary for remote clients.
//! - [`hardware`]: collaborator traits; [`sim`] implements them in software.

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod reader;
pub mod rpc;
pub mod sim;
pub mod utils;
pub mod worker_cmd_chan;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::experiment::*;
pub use crate::hardware::*;
pub use crate::reader::*;
pub use crate::rpc::*;
pub use crate::utils::*;
pub use crate::worker_cmd_chan::*;
