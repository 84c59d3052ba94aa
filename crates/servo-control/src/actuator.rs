//! Joint actuators.
//!
//! An actuator drives one servo on behalf of one joint. It converts joint
//! angles to raw goal positions and writes them through its controller.
//! Commands arrive three ways: broadcast on `actuator/<joint>/command`, a
//! direct one-way [`ActuatorHandle::cast`], or an acknowledged
//! [`ActuatorHandle::call`]. All three run the same handler.

use safety_guard::SafetySubsystem;
use servo_bus::{Param, ParamValue, ServoId};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::controller::ControllerHandle;
use crate::error::ActuatorError;
use crate::mapping::{clamp_angle, JointMapping};
use crate::messages::{BeginMotion, CommandType, Message, PositionCommand, TopicPath};
use crate::pubsub::MessageBus;
use crate::robot::{JointRange, RobotModel};
use crate::state::ServoRegistration;

const REQUEST_CHANNEL_CAPACITY: usize = 32;
// Keeps `OffsetDateTime` arithmetic in range for near-zero velocity limits.
const MAX_TRAVEL_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorConfig {
    pub robot: String,
    pub joint: String,
    pub servo_id: ServoId,
    pub reverse: bool,
    /// Feedback deadband in raw steps, handed to the controller.
    pub position_deadband: u32,
}

#[derive(Clone)]
pub struct ActuatorServices {
    pub safety: Arc<dyn SafetySubsystem>,
    pub messages: Arc<dyn MessageBus>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorState {
    pub servo_id: ServoId,
    pub reverse: bool,
    pub position_deadband: u32,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub center_angle: f64,
    pub range: f64,
    pub velocity_limit: f64,
    pub current_angle: f64,
}

/// A planned move, not yet sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Motion {
    pub raw: u32,
    pub target: f64,
    pub begin: BeginMotion,
}

impl ActuatorState {
    pub fn new(config: &ActuatorConfig, range: JointRange) -> Self {
        Self {
            servo_id: config.servo_id,
            reverse: config.reverse,
            position_deadband: config.position_deadband,
            lower_limit: range.lower,
            upper_limit: range.upper,
            center_angle: range.center,
            range: range.range,
            velocity_limit: range.velocity_limit,
            current_angle: range.center,
        }
    }

    pub fn mapping(&self) -> JointMapping {
        JointMapping::new(self.center_angle, self.reverse)
    }

    pub fn plan(
        &self,
        command: &PositionCommand,
        now: OffsetDateTime,
    ) -> Result<Motion, ActuatorError> {
        if !command.angle.is_finite() {
            return Err(ActuatorError::InvalidAngle(command.angle));
        }
        let target = clamp_angle(command.angle, self.lower_limit, self.upper_limit);
        let raw = self.mapping().angle_to_raw(target);

        let distance = (target - self.current_angle).abs();
        let travel = if self.velocity_limit > 0.0 && self.velocity_limit.is_finite() {
            (distance / self.velocity_limit).min(MAX_TRAVEL_SECS)
        } else {
            0.0
        };
        let expected_arrival = now + time::Duration::seconds_f64(travel);

        Ok(Motion {
            raw,
            target,
            begin: BeginMotion {
                initial_position: self.current_angle,
                target_position: target,
                expected_arrival,
                correlation_id: command.correlation_id,
                command_type: CommandType::Position,
            },
        })
    }
}

enum Request {
    Cast(PositionCommand),
    Call {
        command: PositionCommand,
        reply: oneshot::Sender<Result<BeginMotion, ActuatorError>>,
    },
    Disarm {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<ActuatorState>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

pub struct Actuator;

impl Actuator {
    /// Validate the joint, park the servo at the joint centre with torque
    /// off, register with the controller and start listening for commands.
    pub async fn start(
        config: ActuatorConfig,
        model: &RobotModel,
        controller: ControllerHandle,
        services: ActuatorServices,
    ) -> Result<ActuatorHandle, ActuatorError> {
        let range = model.joint(&config.joint)?.range()?;
        let state = ActuatorState::new(&config, range);
        let id = config.servo_id;

        controller
            .write(id, Param::TorqueEnable, ParamValue::Bool(false))
            .await?;
        controller
            .write_raw(
                id,
                Param::GoalPosition,
                state.mapping().angle_to_raw(state.center_angle),
            )
            .await?;
        controller
            .register_servo(ServoRegistration::new(
                id,
                config.joint.clone(),
                state.center_angle,
                config.position_deadband,
                config.reverse,
            ))
            .await?;

        let commands = services
            .messages
            .subscribe(&config.robot, &TopicPath::command(&config.joint));
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        tracing::info!(
            joint = %config.joint,
            servo = %id,
            center = state.center_angle,
            "actuator started"
        );

        let task = ActuatorTask {
            robot: config.robot,
            joint: config.joint.clone(),
            state,
            controller,
            services,
        };
        tokio::spawn(task.run(rx, commands));
        Ok(ActuatorHandle {
            joint: config.joint,
            tx,
        })
    }
}

struct ActuatorTask {
    robot: String,
    joint: String,
    state: ActuatorState,
    controller: ControllerHandle,
    services: ActuatorServices,
}

impl ActuatorTask {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut commands: broadcast::Receiver<Message>,
    ) {
        let mut commands_open = true;
        let mut stop_reply = None;
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    None => break,
                    Some(Request::Stop { reply }) => {
                        stop_reply = Some(reply);
                        break;
                    }
                    Some(Request::Cast(command)) => {
                        if let Err(e) = self.command(command).await {
                            self.dropped(&e);
                        }
                    }
                    Some(Request::Call { command, reply }) => {
                        let _ = reply.send(self.command(command).await);
                    }
                    Some(Request::Disarm { reply }) => {
                        tracing::debug!(joint = %self.joint, "actuator disarmed");
                        let _ = reply.send(());
                    }
                    Some(Request::State { reply }) => {
                        let _ = reply.send(self.state);
                    }
                },
                message = commands.recv(), if commands_open => match message {
                    Ok(Message::PositionCommand(command)) => {
                        if let Err(e) = self.command(command).await {
                            self.dropped(&e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(joint = %self.joint, missed, "command subscription lagged");
                    }
                    Err(RecvError::Closed) => commands_open = false,
                },
            }
        }
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
        tracing::info!(joint = %self.joint, "actuator stopped");
    }

    async fn command(&mut self, command: PositionCommand) -> Result<BeginMotion, ActuatorError> {
        if !self.services.safety.is_armed() {
            return Err(ActuatorError::NotArmed);
        }
        let motion = self.state.plan(&command, OffsetDateTime::now_utc())?;
        self.controller
            .write_raw_async(self.state.servo_id, Param::GoalPosition, motion.raw)
            .await?;
        self.state.current_angle = motion.target;

        tracing::debug!(
            joint = %self.joint,
            target = motion.target,
            raw = motion.raw,
            "position command"
        );
        self.services.messages.publish(
            &self.robot,
            &TopicPath::begin_motion(&self.joint),
            Message::BeginMotion(motion.begin.clone()),
        );
        Ok(motion.begin)
    }

    fn dropped(&self, error: &ActuatorError) {
        match error {
            ActuatorError::NotArmed => {
                tracing::debug!(joint = %self.joint, "command ignored while disarmed")
            }
            e => tracing::warn!(joint = %self.joint, "command failed: {}", e),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActuatorHandle {
    joint: String,
    tx: mpsc::Sender<Request>,
}


impl ActuatorHandle {
    pub fn joint(&self) -> &str {
        &self.joint
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ActuatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ActuatorError::Stopped)?;
        rx.await.map_err(|_| ActuatorError::Stopped)
    }

    /// Fire-and-forget command. Dropped silently while disarmed.
    pub async fn cast(&self, command: PositionCommand) -> Result<(), ActuatorError> {
        self.tx
            .send(Request::Cast(command))
            .await
            .map_err(|_| ActuatorError::Stopped)
    }

    /// Acknowledged command. Fails with [`ActuatorError::NotArmed`] while
    /// disarmed.
    pub async fn call(&self, command: PositionCommand) -> Result<BeginMotion, ActuatorError> {
        self.request(|reply| Request::Call { command, reply }).await?
    }

    /// Actuators hold no device state of their own to release; torque is
    /// handled by the controller's disarm snapshot.
    pub async fn disarm(&self) -> Result<(), ActuatorError> {
        self.request(|reply| Request::Disarm { reply }).await
    }

    pub async fn state(&self) -> Result<ActuatorState, ActuatorError> {
        self.request(|reply| Request::State { reply }).await
    }

    pub async fn stop(&self) -> Result<(), ActuatorError> {
        self.request(|reply| Request::Stop { reply }).await
    }
}
