//! Lattice agent: runs and supervises Minecraft server processes on one host.
//!
//! - [`process::Supervisor`] owns every instance and drives its lifecycle.
//! - [`rcon::RconClient`] speaks the remote console protocol.
//! - [`monitor::Monitor`] samples CPU and memory of running servers.
//! - [`realtime::Fanout`] streams lifecycle events to websocket clients.

pub mod api;
pub mod config;
pub mod error;
pub mod monitor;
pub mod process;
pub mod rcon;
pub mod realtime;
pub mod state;

pub use error::{Error, Result};
