use serde::{Deserialize, Serialize};
use servo_bus::ServoId;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::AlertKind;

/// Slash-separated topic path, e.g. `sensor/shoulder`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TopicPath(pub Vec<String>);

impl TopicPath {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Position feedback for a joint.
    pub fn joint_state(joint: &str) -> Self {
        Self::new(["sensor", joint])
    }

    /// Status telemetry for one servo on a controller.
    pub fn servo_status(controller: &str, id: ServoId) -> Self {
        Self::new([
            "sensor".to_string(),
            controller.to_string(),
            "servo".to_string(),
            id.to_string(),
        ])
    }

    pub fn diagnostics(controller: &str) -> Self {
        Self::new(["diagnostics", controller])
    }

    pub fn command(joint: &str) -> Self {
        Self::new(["actuator", joint, "command"])
    }

    pub fn begin_motion(joint: &str) -> Self {
        Self::new(["actuator", joint, "begin_motion"])
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointFeedback {
    pub joint_name: String,
    pub angle: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServoStatus {
    pub servo_id: ServoId,
    pub temperature: Option<f64>,
    pub voltage: Option<f64>,
    pub load: Option<f64>,
    pub hardware_error: Option<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Position,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeginMotion {
    pub initial_position: f64,
    pub target_position: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub expected_arrival: OffsetDateTime,
    pub correlation_id: Option<Uuid>,
    pub command_type: CommandType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionCommand {
    pub angle: f64,
    pub correlation_id: Option<Uuid>,
}

impl PositionCommand {
    pub fn new(angle: f64) -> Self {
        Self {
            angle,
            correlation_id: None,
        }
    }

    pub fn with_correlation(angle: f64, id: Uuid) -> Self {
        Self {
            angle,
            correlation_id: Some(id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Communication,
    Temperature,
    Voltage,
    HardwareAlert,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub component: String,
    pub level: DiagnosticLevel,
    pub kind: DiagnosticKind,
    pub message: String,
    pub servo_id: Option<ServoId>,
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<AlertKind>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    JointFeedback(JointFeedback),
    ServoStatus(ServoStatus),
    BeginMotion(BeginMotion),
    PositionCommand(PositionCommand),
    Diagnostic(Diagnostic),
}
