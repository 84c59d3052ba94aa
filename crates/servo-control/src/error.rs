use servo_bus::BusError;
use thiserror::Error;

/// Problems with the robot description that stop an actuator from starting.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("joint not found: {0}")]
    JointNotFound(String),
    #[error("joint {joint} is {kind}, which has no bounded range")]
    UnsupportedJointKind { joint: String, kind: String },
    #[error("joint {0} has no limits defined")]
    MissingLimits(String),
    #[error("joint {joint} has invalid limits: {reason}")]
    InvalidLimits { joint: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("bus driver failed to start on {port}: {source}")]
    DriverStart {
        port: String,
        #[source]
        source: BusError,
    },
    #[error("unknown control table: {0}")]
    UnknownControlTable(String),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("controller has stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("not armed")]
    NotArmed,
    #[error("invalid target angle: {0}")]
    InvalidAngle(f64),
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("actuator has stopped")]
    Stopped,
}

pub type Result<T, E = ControllerError> = core::result::Result<T, E>;
