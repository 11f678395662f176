//! Error types for torcat.
//!
//! Every failure path ends the process, so messages carry enough context
//! (destination, control reply, relay direction) to be printed as-is.

use crate::relay::RelayError;
use thiserror::Error;

/// Core error type for torcat operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid command-line or control endpoint configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Tor control connection or transport failure.
    #[error("tor error: {0}")]
    Tor(String),

    /// The control port answered with a non-success status.
    #[error("control port replied {code}: {message}")]
    Control {
        /// Three digit status code.
        code: u16,
        /// Reply text after the status code.
        message: String,
    },

    /// Authentication with the control port failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A command needing an authenticated control connection was issued early.
    #[error("control connection not authenticated")]
    NotAuthenticated,

    /// Onion identity generation or validation failed.
    #[error("identity error: {0}")]
    Identity(String),

    /// Outbound connection through Tor failed.
    #[error("connection to {destination} failed: {reason}")]
    Dial {
        /// `host:port` that was being dialed.
        destination: String,
        /// Why the dial failed.
        reason: String,
    },

    /// Publishing the onion service or accepting on it failed.
    #[error("listen failed: {0}")]
    Listen(String),

    /// The conversation ended with an I/O failure.
    #[error("conversation failed")]
    Relay(#[from] RelayError),
}

/// Result type alias using torcat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure happened before any conversation started.
    pub fn is_setup(&self) -> bool {
        !matches!(self, Error::Relay(_))
    }

    /// Whether the control port rejected our credentials.
    ///
    /// Tor answers a failed `AUTHENTICATE` with status 515.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Control { code: 515, .. })
    }
}
