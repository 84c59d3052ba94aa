use thiserror::Error;

use crate::ServoId;

pub type Result<T, E = BusError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("no response from servo {0}")]
    NoResponse(ServoId),
    #[error("parameter not in control table: {0}")]
    UnknownParam(String),
    #[error("invalid value for {param}: {reason}")]
    InvalidValue { param: String, reason: String },
    #[error("bus is closed")]
    Closed,
}
