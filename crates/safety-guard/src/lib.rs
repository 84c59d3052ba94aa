//! safety-guard: arming, disarm hooks and error reporting for robotics
//!
//! This crate provides the safety side of actuation:
//! - A system-wide arm state with broadcast transitions
//! - Disarm hooks that components register and that stay callable after the
//!   component itself is gone
//! - Error reporting and an audit log of safety events

mod types;
pub use types::{
    ArmState, ComponentId, DisarmReport, ReportedError, SafetyEvent, SafetyEventType,
    ViolationSeverity,
};

mod traits;
pub use traits::{DisarmHook, SafetySubsystem};

mod registry;
pub use registry::SafetyRegistry;
