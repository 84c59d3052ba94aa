//! servo-control: bus controller and joint actuators for serial-bus servos
//!
//! A [`Controller`] owns one servo bus, polls positions and status in
//! batches and runs the arm sequence. Each [`Actuator`] maps one joint onto
//! one servo and writes goal positions through its controller. Torque is
//! released on disarm by a [`DisarmSnapshot`] held by the safety system.

mod error;
pub use error::{ActuatorError, ConfigurationError, ControllerError, Result};

mod mapping;
pub use mapping::{clamp_angle, deadband_radians, JointMapping, RADIANS_PER_STEP};

mod alerts;
pub use alerts::{
    decode_hardware_error, mask_hardware_error, AlertKind, HardwareAlert, TORQUE_ENABLED_BIT,
};

mod status;
pub use status::{
    LevelChange, LevelTracker, StatusSnapshot, TemperatureLevel, VoltageLevel,
    LOAD_DEADBAND_PCT, TEMPERATURE_DEADBAND_C, TEMPERATURE_ERROR_C, TEMPERATURE_WARN_C,
    VOLTAGE_DEADBAND_V, VOLTAGE_MAX_V, VOLTAGE_MIN_V,
};

mod messages;
pub use messages::{
    BeginMotion, CommandType, Diagnostic, DiagnosticKind, DiagnosticLevel, JointFeedback, Message,
    PositionCommand, ServoStatus, TopicPath,
};

mod pubsub;
pub use pubsub::{Envelope, LocalBus, MessageBus};

mod robot;
pub use robot::{Joint, JointKind, JointLimits, JointRange, RobotModel};

mod disarm;
pub use disarm::{disarm, DisarmAction, DisarmSnapshot, SharedBus};

mod metrics;
pub use metrics::{ControllerMetrics, MetricsHub};

mod state;
pub use state::ServoRegistration;

mod controller;
pub use controller::{
    ArmFailurePolicy, Controller, ControllerConfig, ControllerHandle, ControllerServices,
};

mod actuator;
pub use actuator::{
    Actuator, ActuatorConfig, ActuatorHandle, ActuatorServices, ActuatorState, Motion,
};

mod config;
pub use config::{
    load_description_file, parse_description, ActuatorSpec, ControllerSpec, RobotDescription,
};
