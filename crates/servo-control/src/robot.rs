use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointKind {
    Revolute,
    Prismatic,
    Continuous,
    Fixed,
    Floating,
    Planar,
}

impl JointKind {
    /// Whether a joint of this kind moves within a bounded range that can
    /// be mapped onto a servo's encoder.
    pub fn is_bounded(&self) -> bool {
        matches!(self, JointKind::Revolute | JointKind::Prismatic)
    }
}

impl fmt::Display for JointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JointKind::Revolute => "revolute",
            JointKind::Prismatic => "prismatic",
            JointKind::Continuous => "continuous",
            JointKind::Fixed => "fixed",
            JointKind::Floating => "floating",
            JointKind::Planar => "planar",
        };
        f.write_str(s)
    }
}

/// Position bounds in radians and the velocity limit in radians per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub lower: f64,
    pub upper: f64,
    pub velocity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    pub name: String,
    pub kind: JointKind,
    #[serde(default)]
    pub limits: Option<JointLimits>,
}

/// The range an actuator derives from its joint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointRange {
    pub lower: f64,
    pub upper: f64,
    pub center: f64,
    pub range: f64,
    pub velocity_limit: f64,
}

impl Joint {
    pub fn range(&self) -> Result<JointRange, ConfigurationError> {
        if !self.kind.is_bounded() {
            return Err(ConfigurationError::UnsupportedJointKind {
                joint: self.name.clone(),
                kind: self.kind.to_string(),
            });
        }
        let limits = self
            .limits
            .ok_or_else(|| ConfigurationError::MissingLimits(self.name.clone()))?;
        if !(limits.lower.is_finite() && limits.upper.is_finite()) || limits.lower > limits.upper {
            return Err(ConfigurationError::InvalidLimits {
                joint: self.name.clone(),
                reason: format!("lower {} upper {}", limits.lower, limits.upper),
            });
        }
        Ok(JointRange {
            lower: limits.lower,
            upper: limits.upper,
            center: (limits.lower + limits.upper) / 2.0,
            range: limits.upper - limits.lower,
            velocity_limit: limits.velocity,
        })
    }
}

/// Joint topology of one robot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotModel {
    pub name: String,
    pub joints: BTreeMap<String, Joint>,
}

impl RobotModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            joints: BTreeMap::new(),
        }
    }

    pub fn with_joint(mut self, joint: Joint) -> Self {
        self.joints.insert(joint.name.clone(), joint);
        self
    }

    pub fn joint(&self, name: &str) -> Result<&Joint, ConfigurationError> {
        self.joints
            .get(name)
            .ok_or_else(|| ConfigurationError::JointNotFound(name.to_string()))
    }
}
