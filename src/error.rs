//! Hard failures of the library.
//!
//! Timeouts, CRC errors and exception responses are normal outcomes of an exchange
//! and are reported through [`crate::frame::ModbusResponse`] and
//! [`crate::master::RequestError`]. The [`Error`] type here is reserved for
//! configuration mistakes and for a transport that can not be used at all.

use crate::protocol as proto;

/// Represents all failures that stop an operation before or outside an exchange.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An operation needed a serial configuration but none was provided.
    #[error("No serial configuration provided")]
    NoConfiguration,

    /// The transport is closed.
    #[error("Serial port is not open")]
    NotConnected,

    /// No serial port is available for auto-detection.
    #[error("No suitable serial port found")]
    NoPortFound,

    /// Wraps `proto::Error`.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// Wraps `tokio_serial::Error`.
    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),

    /// Wraps `std::io::Error`.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A profile file or report could not be read or written as YAML.
    #[cfg(feature = "serde")]
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The result type for library operations.
pub type Result<T> = std::result::Result<T, Error>;
