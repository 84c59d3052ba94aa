use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use servo_bus::ServoId;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::actuator::ActuatorConfig;
use crate::controller::{ArmFailurePolicy, ControllerConfig};
use crate::disarm::DisarmAction;
use crate::robot::{Joint, RobotModel};

fn default_baud() -> u32 {
    1_000_000
}

fn default_control_table() -> String {
    "sts3215".to_string()
}

fn default_poll_ms() -> u64 {
    50
}

fn default_status_poll_ms() -> u64 {
    1000
}

fn default_deadband() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSpec {
    pub name: String,
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_control_table")]
    pub control_table: String,
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    /// Zero disables status polling.
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_interval_ms: u64,
    #[serde(default)]
    pub disarm_action: DisarmAction,
    #[serde(default)]
    pub arm_failure_policy: ArmFailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSpec {
    pub joint: String,
    pub servo_id: ServoId,
    pub controller: String,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default = "default_deadband")]
    pub position_deadband: u32,
}

/// A robot description file: joints, the buses that drive them and which
/// servo sits on which joint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotDescription {
    pub robot: String,
    #[serde(default)]
    pub joints: Vec<Joint>,
    #[serde(default)]
    pub controllers: Vec<ControllerSpec>,
    #[serde(default)]
    pub actuators: Vec<ActuatorSpec>,
}

impl RobotDescription {
    pub fn model(&self) -> RobotModel {
        self.joints
            .iter()
            .cloned()
            .fold(RobotModel::new(self.robot.clone()), RobotModel::with_joint)
    }

    pub fn controller_config(&self, spec: &ControllerSpec) -> ControllerConfig {
        ControllerConfig {
            name: spec.name.clone(),
            robot: self.robot.clone(),
            port: spec.port.clone(),
            baud: spec.baud,
            control_table: spec.control_table.clone(),
            poll_interval: Duration::from_millis(spec.poll_interval_ms),
            status_poll_interval: Duration::from_millis(spec.status_poll_interval_ms),
            disarm_action: spec.disarm_action,
            arm_failure_policy: spec.arm_failure_policy,
        }
    }

    pub fn actuator_config(&self, spec: &ActuatorSpec) -> ActuatorConfig {
        ActuatorConfig {
            robot: self.robot.clone(),
            joint: spec.joint.clone(),
            servo_id: spec.servo_id,
            reverse: spec.reverse,
            position_deadband: spec.position_deadband,
        }
    }

    /// Actuators grouped by the controller they sit on.
    pub fn actuators_by_controller(&self) -> BTreeMap<&str, Vec<&ActuatorSpec>> {
        let mut out: BTreeMap<&str, Vec<&ActuatorSpec>> = BTreeMap::new();
        for a in &self.actuators {
            out.entry(a.controller.as_str()).or_default().push(a);
        }
        out
    }

    /// Cross-reference checks serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut controllers = BTreeSet::new();
        for c in &self.controllers {
            if !controllers.insert(c.name.as_str()) {
                bail!("duplicate controller: {}", c.name);
            }
            if c.poll_interval_ms == 0 {
                bail!("controller {}: poll_interval_ms must be positive", c.name);
            }
        }
        let joints: BTreeSet<&str> = self.joints.iter().map(|j| j.name.as_str()).collect();
        let mut servos = BTreeSet::new();
        let mut driven = BTreeSet::new();
        for a in &self.actuators {
            if !controllers.contains(a.controller.as_str()) {
                bail!("actuator {}: unknown controller {}", a.joint, a.controller);
            }
            if !joints.contains(a.joint.as_str()) {
                bail!("actuator {}: unknown joint", a.joint);
            }
            if !servos.insert((a.controller.as_str(), a.servo_id)) {
                bail!(
                    "servo {} used twice on controller {}",
                    a.servo_id,
                    a.controller
                );
            }
            if !driven.insert(a.joint.as_str()) {
                bail!("joint {} has more than one actuator", a.joint);
            }
        }
        Ok(())
    }
}

pub fn parse_description(raw: &str) -> anyhow::Result<RobotDescription> {
    let val: Value = serde_yaml::from_str(raw).context("parsing yaml")?;
    let desc: RobotDescription =
        serde_yaml::from_value(val).context("decoding robot description")?;
    desc.validate()?;
    Ok(desc)
}

pub fn load_description_file(path: impl AsRef<Path>) -> anyhow::Result<RobotDescription> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading robot description: {}", path.display()))?;
    parse_description(&raw).with_context(|| format!("loading {}", path.display()))
}
