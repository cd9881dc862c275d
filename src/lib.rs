//! # gpiolink
//!
//! A single-client device-control daemon. One TCP client at a time drives a
//! small line-oriented command protocol against the board's digital and analog
//! IO, while the server streams a fixed 18-byte UDP status packet back to the
//! same host at a precisely timed, runtime-selectable rate.
//!
//! ## Features
//!
//! - **Absolute-deadline ticking**: telemetry cadence never drifts with
//!   processing jitter, and rate changes apply from the next deadline
//! - **Tiny command protocol**: `ra`, `rd`, `wdx,y`, `pux`, `h`, `q`, `k`
//!   terminated by CRLF, with `!`/`?` acknowledgements
//! - **Pluggable IO**: the hardware sits behind the [`backend::IoBackend`] trait
//! - **Bounded memory**: fixed-size receive, response and telemetry buffers
//!
//! ## Quick Start
//!
//! ```no_run
//! use gpiolink::{Server, ServerConfig, SimulatedIo};
//!
//! # async fn serve() -> Result<(), gpiolink::server::ServerError> {
//! let mut server = Server::bind(ServerConfig::default(), SimulatedIo::new()).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`backend`] - IO backend trait plus simulated and recording backends
//! - [`telemetry`] - Telemetry packet encoding, decoding and gap tracking
//! - [`protocol`] - Command parsing and dispatch
//! - [`scheduler`] - Rate table and absolute-deadline ticker
//! - [`server`] - Connection manager and tick loop
//! - [`config`] - Server configuration

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod backend;
pub mod config;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod telemetry;

// Re-export main public types for convenience
pub use backend::{IoBackend, IoSnapshot, RecordingIo, SimulatedIo};
pub use config::ServerConfig;
pub use protocol::{parse_command, Command, SessionAction};
pub use server::{Server, SessionEnd};
pub use telemetry::{TelemetryEncoder, TelemetryPacket};
