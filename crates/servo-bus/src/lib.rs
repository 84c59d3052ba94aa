//! servo-bus: driver contract for serial-bus servos
//!
//! This crate provides the [`ServoBus`] trait, servo identifiers, named
//! parameters and the register layout ([`ControlTable`]) used to convert
//! between raw registers and physical units. The default build enables a
//! `mock` backend that simulates servos in-process so that the controller
//! can be exercised on any host.

mod types;
pub use types::{ParamValue, PingStatus, PortInfo, ServoId};

mod error;
pub use error::{BusError, Result};

mod control_table;
pub use control_table::{
    radians_to_steps, steps_to_radians, Access, ControlTable, Conversion, Param, ParamCategory,
    ParamSpec, CENTER_STEP, MAX_STEP, STEPS_PER_REV,
};

mod traits;
pub use traits::ServoBus;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{BusOp, MockBus};
