//! Error type shared by both protocol clients.
use crate::protocol as proto;

/// Represents all possible errors of a device operation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Connecting, sending or receiving failed, including timeouts.
    /// Retrying the whole operation may succeed.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The device answered with something that could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with its own error indicator.
    /// Over the service protocol this usually means a wrong system id.
    #[error("Request rejected by the device: {0}")]
    Rejected(String),

    /// The write was sent, but the device never reported the requested state.
    /// The value may still be applied later.
    #[error("Device did not reach the requested state after {attempts} attempts")]
    Convergence { attempts: u32 },

    /// The connection address or client settings are invalid. Raised before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Wraps `proto::Error`.
    #[error(transparent)]
    Encoding(#[from] proto::Error),

    /// The device state does not contain the requested thermostat.
    #[error("Unknown thermostat: {0}")]
    UnknownThermostat(String),

    /// The operation is not available over the connected protocol.
    #[error("{0} is not supported over {1}")]
    Unsupported(&'static str, &'static str),
}

impl Error {
    /// Whether the caller may simply try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(..))
    }

    pub(crate) fn timed_out(what: &str) -> Self {
        Error::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }
}

#[cfg(feature = "modbus-tcp")]
impl From<tokio_modbus::Error> for Error {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(err) => Error::Transport(err),
            tokio_modbus::Error::Protocol(err) => Error::Protocol(err.to_string()),
        }
    }
}

#[cfg(feature = "modbus-tcp")]
impl From<tokio_modbus::ExceptionCode> for Error {
    fn from(err: tokio_modbus::ExceptionCode) -> Self {
        Error::Rejected(format!("Modbus exception: {err}"))
    }
}

impl From<serde_path_to_error::Error<serde_json::Error>> for Error {
    fn from(err: serde_path_to_error::Error<serde_json::Error>) -> Self {
        Error::Protocol(format!("invalid field '{}': {}", err.path(), err.inner()))
    }
}

/// The result type of device operations.
pub type Result<T> = std::result::Result<T, Error>;
