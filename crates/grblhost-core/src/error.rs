//! Error handling for grblhost
//!
//! Provides error types for the layers of the protocol engine:
//! - Transport errors (serial port open/close/IO)
//! - Protocol errors (device-reported errors and alarms)
//! - Command errors (command bus dispatch failures)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Transport error type
///
/// Represents failures of the serial link between the host and the
/// controller.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Port not found on this system
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Port is already open
    #[error("Port already open: {port}")]
    AlreadyOpen {
        /// The name of the port that is already open.
        port: String,
    },

    /// No port is open
    #[error("Port is not open")]
    NotOpen,

    /// Connection lost mid-session
    #[error("Connection lost: {reason}")]
    Disconnected {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol error type
///
/// Represents conditions reported by the device itself over the wire.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Device rejected a G-code block (`error:<n>`)
    #[error("error:{code} ({message})")]
    DeviceError {
        /// The numeric error code.
        code: u8,
        /// The decoded human-readable message.
        message: String,
    },

    /// Device entered an alarm state (`ALARM:<n>`)
    #[error("ALARM:{code} ({message})")]
    DeviceAlarm {
        /// The numeric alarm code.
        code: u8,
        /// The decoded human-readable message.
        message: String,
    },

    /// Acknowledgment arrived with nothing in flight
    #[error("Unexpected acknowledgment: nothing in flight")]
    UnexpectedAck,
}

/// Command error type
///
/// Represents command bus dispatch failures.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// Unknown command key
    #[error("Unknown command: {key}")]
    UnknownCommand {
        /// The command key that was not recognized.
        key: String,
    },

    /// Command arguments did not decode
    #[error("Invalid arguments for {key}: {reason}")]
    InvalidArguments {
        /// The command key.
        key: String,
        /// The reason the arguments were rejected.
        reason: String,
    },

    /// A program load was attempted with empty content
    #[error("Empty G-code program")]
    EmptyProgram,

    /// No program is loaded
    #[error("No G-code program loaded")]
    NoProgram,

    /// A macro id did not resolve
    #[error("Macro not found: {id}")]
    MacroNotFound {
        /// The macro id that was not found.
        id: String,
    },

    /// A required collaborator is not installed
    #[error("{name} is not available")]
    CollaboratorMissing {
        /// The collaborator name (task runner, macro store, ...).
        name: &'static str,
    },
}

/// Main error type for grblhost
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
