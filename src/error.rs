//! Error types shared by the supervisor, console client and HTTP surface.
//!
//! Every variant maps to a stable [`Error::kind`] string that the HTTP layer
//! and the realtime channel hand to clients unchanged.

use thiserror::Error;

use crate::state::ServerStatus;

#[derive(Error, Debug)]
pub enum Error {
    /// No instance with this id is registered.
    #[error("Server '{0}' not found")]
    NotFound(String),

    /// The operation is not legal for the instance's current status.
    #[error("Cannot {action} server '{id}' while it is {status}")]
    InvalidState {
        id: String,
        status: ServerStatus,
        action: &'static str,
    },

    /// The instance has no live process to talk to.
    #[error("Server '{0}' process not available")]
    NotRunning(String),

    /// A create request failed validation.
    #[error("Invalid server config: {0}")]
    InvalidConfig(String),

    /// Spawning or signalling the OS process failed.
    #[error("Server process error: {0}")]
    Process(String),

    /// The console peer did not answer in time.
    #[error("Console timed out waiting for {0}")]
    ProtocolTimeout(&'static str),

    /// The console peer rejected the configured password.
    #[error("Console authentication rejected")]
    ProtocolAuth,

    /// The console peer sent something that is not a valid frame, or hung up.
    #[error("Console protocol error: {0}")]
    Protocol(String),

    /// No console session is open for this call.
    #[error("Console not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable reason for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidState { .. } | Error::NotRunning(_) => "invalid_state",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Process(_) => "process_failure",
            Error::ProtocolTimeout(_) => "protocol_timeout",
            Error::ProtocolAuth => "protocol_auth",
            Error::Protocol(_) => "protocol_error",
            Error::NotConnected => "not_connected",
            Error::Io(_) => "io_failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
