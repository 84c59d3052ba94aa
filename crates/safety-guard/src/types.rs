use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

/// System-wide actuation permission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArmState {
    Disarmed,
    Armed,
}

/// Severity levels for reported errors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViolationSeverity {
    Warning,
    Error,
    Critical,
    Emergency,
}

/// Identity of a component that registers with the safety system: the
/// robot it belongs to and its path inside that robot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId {
    pub robot: String,
    pub path: Vec<String>,
}

impl ComponentId {
    pub fn new<S: Into<String>>(robot: impl Into<String>, path: impl IntoIterator<Item = S>) -> Self {
        Self {
            robot: robot.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.robot, self.path.join("/"))
    }
}

/// An error raised by a component and handed to the safety system. What to
/// do about it (ignore, disarm, latch) is decided here, not by the reporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedError {
    pub kind: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub context: HashMap<String, serde_json::Value>,
}

/// Safety event for logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEvent {
    pub timestamp: SystemTime,
    pub event_type: SafetyEventType,
    pub component: Option<ComponentId>,
    pub message: String,
    pub severity: ViolationSeverity,
    pub context: HashMap<String, serde_json::Value>,
}

/// Types of safety events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SafetyEventType {
    ComponentRegistered,
    ErrorReported,
    Armed,
    Disarmed,
    DisarmHookFailed,
}

impl fmt::Display for SafetyEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyEventType::ComponentRegistered => write!(f, "ComponentRegistered"),
            SafetyEventType::ErrorReported => write!(f, "ErrorReported"),
            SafetyEventType::Armed => write!(f, "Armed"),
            SafetyEventType::Disarmed => write!(f, "Disarmed"),
            SafetyEventType::DisarmHookFailed => write!(f, "DisarmHookFailed"),
        }
    }
}

/// Outcome of a system disarm.
#[derive(Debug, Clone, Default)]
pub struct DisarmReport {
    pub hooks_run: usize,
    pub failed: Vec<ComponentId>,
}
