//! The bus controller actor.
//!
//! One tokio task owns one servo bus. Callers talk to it through a cloneable
//! [`ControllerHandle`]; the task serves one request at a time and runs the
//! position and status polls between requests.

use parking_lot::Mutex;
use safety_guard::{ArmState, SafetySubsystem};
use serde::{Deserialize, Serialize};
use servo_bus::{ControlTable, Param, ParamValue, PingStatus, ServoBus, ServoId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, Instant};

use crate::disarm::{DisarmAction, SharedBus};
use crate::error::{ControllerError, Result};
use crate::metrics::ControllerMetrics;
use crate::pubsub::MessageBus;
use crate::state::{ControllerState, ServoRegistration};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What to do when present positions cannot be read while arming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmFailurePolicy {
    /// Leave torque disabled.
    #[default]
    Abort,
    /// Enable torque without holding the present position first.
    EnableTorque,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub name: String,
    pub robot: String,
    pub port: String,
    pub baud: u32,
    pub control_table: String,
    pub poll_interval: Duration,
    /// Zero disables status polling.
    pub status_poll_interval: Duration,
    pub disarm_action: DisarmAction,
    pub arm_failure_policy: ArmFailurePolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            robot: "robot".to_string(),
            port: "mock".to_string(),
            baud: 1_000_000,
            control_table: "sts3215".to_string(),
            poll_interval: Duration::from_millis(50),
            status_poll_interval: Duration::from_millis(1000),
            disarm_action: DisarmAction::DisableTorque,
            arm_failure_policy: ArmFailurePolicy::Abort,
        }
    }
}

/// The collaborators a controller publishes to and reports to.
#[derive(Clone)]
pub struct ControllerServices {
    pub safety: Arc<dyn SafetySubsystem>,
    pub messages: Arc<dyn MessageBus>,
    pub metrics: ControllerMetrics,
}

enum Request {
    RegisterServo {
        registration: ServoRegistration,
        reply: oneshot::Sender<()>,
    },
    Read {
        id: ServoId,
        param: Param,
        reply: oneshot::Sender<Result<ParamValue>>,
    },
    ReadRaw {
        id: ServoId,
        param: Param,
        reply: oneshot::Sender<Result<u32>>,
    },
    /// `reply: None` is a fire-and-forget write without acknowledgement.
    Write {
        id: ServoId,
        param: Param,
        value: ParamValue,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    WriteRaw {
        id: ServoId,
        param: Param,
        raw: u32,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Ping {
        id: ServoId,
        reply: oneshot::Sender<Result<PingStatus>>,
    },
    ListServos {
        reply: oneshot::Sender<Vec<ServoRegistration>>,
    },
    ControlTable {
        reply: oneshot::Sender<ControlTable>,
    },
    BulkRead {
        ids: Vec<ServoId>,
        param: Param,
        reply: oneshot::Sender<Result<Vec<ParamValue>>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

pub struct Controller;

impl Controller {
    /// Open the bus with driver `B` and start the controller task.
    pub fn start<B>(config: ControllerConfig, services: ControllerServices) -> Result<ControllerHandle>
    where
        B: ServoBus + 'static,
    {
        let table = ControlTable::by_name(&config.control_table)
            .ok_or_else(|| ControllerError::UnknownControlTable(config.control_table.clone()))?;
        let bus = B::open(&config.port, config.baud, table).map_err(|source| {
            ControllerError::DriverStart {
                port: config.port.clone(),
                source,
            }
        })?;
        tracing::info!(
            controller = %config.name,
            port = %config.port,
            baud = config.baud,
            "servo bus opened"
        );
        Ok(Self::spawn(Box::new(bus), config, services))
    }

    /// Start the controller task on an already opened bus.
    pub fn spawn(
        bus: Box<dyn ServoBus>,
        config: ControllerConfig,
        services: ControllerServices,
    ) -> ControllerHandle {
        let transitions = services.safety.subscribe();
        let shared: SharedBus = Arc::new(Mutex::new(bus));
        let state = ControllerState::new(&config, shared, services);
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let task = ControllerTask {
            state,
            requests: rx,
            transitions,
            poll_interval: config.poll_interval.max(MIN_POLL_INTERVAL),
            status_poll_interval: config.status_poll_interval,
        };
        tokio::spawn(task.run());
        ControllerHandle {
            name: config.name,
            tx,
        }
    }
}

struct ControllerTask {
    state: ControllerState,
    requests: mpsc::Receiver<Request>,
    transitions: broadcast::Receiver<ArmState>,
    poll_interval: Duration,
    status_poll_interval: Duration,
}

impl ControllerTask {
    async fn run(self) {
        let ControllerTask {
            mut state,
            mut requests,
            mut transitions,
            poll_interval,
            status_poll_interval,
        } = self;
        let status_enabled = !status_poll_interval.is_zero();
        let mut transitions_open = true;

        let poll = sleep(poll_interval);
        tokio::pin!(poll);
        let status = sleep(status_poll_interval);
        tokio::pin!(status);

        let mut stop_reply = None;
        loop {
            // Transitions first: a write queued by an actuator that already
            // sees the system armed must land after the arm sequence.
            tokio::select! {
                biased;

                transition = transitions.recv(), if transitions_open => match transition {
                    Ok(ArmState::Armed) => {
                        let outcome = state.arm();
                        tracing::debug!(component = %state.component(), ?outcome, "arm handled");
                    }
                    Ok(ArmState::Disarmed) => {
                        tracing::debug!(component = %state.component(), "disarm handled by safety hook");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "arm transitions lagged, resyncing");
                        let outcome = state.arm();
                        tracing::debug!(component = %state.component(), ?outcome, "arm resynced");
                    }
                    Err(RecvError::Closed) => transitions_open = false,
                },
                request = requests.recv() => match request {
                    Some(Request::Stop { reply }) => {
                        stop_reply = Some(reply);
                        break;
                    }
                    Some(request) => handle(&mut state, request),
                    None => break,
                },
                _ = &mut poll => {
                    state.poll_positions();
                    poll.as_mut().reset(Instant::now() + poll_interval);
                }
                _ = &mut status, if status_enabled => {
                    state.poll_status();
                    status.as_mut().reset(Instant::now() + status_poll_interval);
                }
            }
        }

        drop(requests);
        state.shutdown();
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
        tracing::info!(component = %state.component(), "controller stopped");
    }
}

fn handle(state: &mut ControllerState, request: Request) {
    match request {
        Request::RegisterServo {
            registration,
            reply,
        } => {
            state.register_servo(registration);
            let _ = reply.send(());
        }
        Request::Read { id, param, reply } => {
            let _ = reply.send(state.read(id, param));
        }
        Request::ReadRaw { id, param, reply } => {
            let _ = reply.send(state.read_raw(id, param));
        }
        Request::Write {
            id,
            param,
            value,
            reply,
        } => {
            let result = state.write(id, param, value, reply.is_some());
            respond_or_log(reply, result, id, param);
        }
        Request::WriteRaw {
            id,
            param,
            raw,
            reply,
        } => {
            let result = state.write_raw(id, param, raw, reply.is_some());
            respond_or_log(reply, result, id, param);
        }
        Request::Ping { id, reply } => {
            let _ = reply.send(state.ping(id));
        }
        Request::ListServos { reply } => {
            let _ = reply.send(state.list_servos());
        }
        Request::ControlTable { reply } => {
            let _ = reply.send(state.control_table());
        }
        Request::BulkRead { ids, param, reply } => {
            let _ = reply.send(state.bulk_read(&ids, param));
        }
        Request::Stop { reply } => {
            let _ = reply.send(());
        }
    }
}

fn respond_or_log(
    reply: Option<oneshot::Sender<Result<()>>>,
    result: Result<()>,
    id: ServoId,
    param: Param,
) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::warn!("async write of {} to servo {} failed: {}", param, id, e);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControllerHandle {
    name: String,
    tx: mpsc::Sender<Request>,
}


impl ControllerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    pub async fn register_servo(&self, registration: ServoRegistration) -> Result<()> {
        self.request(|reply| Request::RegisterServo {
            registration,
            reply,
        })
        .await
    }

    pub async fn read(&self, id: ServoId, param: Param) -> Result<ParamValue> {
        self.request(|reply| Request::Read { id, param, reply })
            .await?
    }

    pub async fn read_raw(&self, id: ServoId, param: Param) -> Result<u32> {
        self.request(|reply| Request::ReadRaw { id, param, reply })
            .await?
    }

    /// Write and wait for the servo to acknowledge.
    pub async fn write(&self, id: ServoId, param: Param, value: ParamValue) -> Result<()> {
        self.request(|reply| Request::Write {
            id,
            param,
            value,
            reply: Some(reply),
        })
        .await?
    }

    pub async fn write_raw(&self, id: ServoId, param: Param, raw: u32) -> Result<()> {
        self.request(|reply| Request::WriteRaw {
            id,
            param,
            raw,
            reply: Some(reply),
        })
        .await?
    }

    /// Queue a write without acknowledgement. Bus failures are only logged.
    pub async fn write_async(&self, id: ServoId, param: Param, value: ParamValue) -> Result<()> {
        self.send(Request::Write {
            id,
            param,
            value,
            reply: None,
        })
        .await
    }

    pub async fn write_raw_async(&self, id: ServoId, param: Param, raw: u32) -> Result<()> {
        self.send(Request::WriteRaw {
            id,
            param,
            raw,
            reply: None,
        })
        .await
    }

    pub async fn ping(&self, id: ServoId) -> Result<PingStatus> {
        self.request(|reply| Request::Ping { id, reply }).await?
    }

    pub async fn list_servos(&self) -> Result<Vec<ServoRegistration>> {
        self.request(|reply| Request::ListServos { reply }).await
    }

    pub async fn control_table(&self) -> Result<ControlTable> {
        self.request(|reply| Request::ControlTable { reply }).await
    }

    pub async fn bulk_read(&self, ids: Vec<ServoId>, param: Param) -> Result<Vec<ParamValue>> {
        self.request(|reply| Request::BulkRead { ids, param, reply })
            .await?
    }

    /// Stop the task. Returns once the bus has been released.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Request::Stop { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, TopicPath};
    use crate::pubsub::LocalBus;
    use safety_guard::SafetyRegistry;
    use servo_bus::{BusError, MockBus, CENTER_STEP};

    fn id(raw: u8) -> ServoId {
        ServoId::new(raw).unwrap()
    }

    struct Rig {
        mock: MockBus,
        safety: Arc<SafetyRegistry>,
        messages: Arc<LocalBus>,
        handle: ControllerHandle,
    }

    fn rig(config: ControllerConfig) -> Rig {
        let mock = MockBus::new(ControlTable::sts3215()).with_servos([id(1), id(2)]);
        let safety = Arc::new(SafetyRegistry::new());
        let messages = Arc::new(LocalBus::new());
        let services = ControllerServices {
            safety: safety.clone(),
            messages: messages.clone(),
            metrics: ControllerMetrics::new(&config.name).unwrap(),
        };
        let handle = Controller::spawn(Box::new(mock.clone()), config, services);
        Rig {
            mock,
            safety,
            messages,
            handle,
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            name: "bus0".to_string(),
            robot: "arm".to_string(),
            ..ControllerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_reports_driver_failure() {
        let services = ControllerServices {
            safety: Arc::new(SafetyRegistry::new()),
            messages: Arc::new(LocalBus::new()),
            metrics: ControllerMetrics::new("bad").unwrap(),
        };
        let config = ControllerConfig {
            port: "/dev/does-not-exist".to_string(),
            ..config()
        };
        let err = Controller::start::<MockBus>(config, services.clone()).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::DriverStart {
                source: BusError::InterfaceNotFound(_),
                ..
            }
        ));

        let config = ControllerConfig {
            control_table: "xl330".to_string(),
            ..ControllerConfig::default()
        };
        let err = Controller::start::<MockBus>(config, services).unwrap_err();
        assert!(matches!(err, ControllerError::UnknownControlTable(_)));
    }

    #[tokio::test]
    async fn test_start_opens_mock_port() {
        let services = ControllerServices {
            safety: Arc::new(SafetyRegistry::new()),
            messages: Arc::new(LocalBus::new()),
            metrics: ControllerMetrics::new("bus0").unwrap(),
        };
        let config = ControllerConfig {
            port: "mock:3".to_string(),
            ..config()
        };
        let handle = Controller::start::<MockBus>(config, services).unwrap();
        assert!(handle.ping(id(3)).await.is_ok());
        assert!(handle.ping(id(4)).await.is_err());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_generic_parameter_access() {
        let rig = rig(config());
        let h = &rig.handle;
        h.write(id(1), Param::Lock, ParamValue::Bool(true)).await.unwrap();
        assert_eq!(h.read(id(1), Param::Lock).await.unwrap(), ParamValue::Bool(true));
        h.write_raw(id(2), Param::GoalPosition, 1234).await.unwrap();
        assert_eq!(h.read_raw(id(2), Param::GoalPosition).await.unwrap(), 1234);
        assert!(h.write(id(9), Param::Lock, ParamValue::Bool(true)).await.is_err());

        // Unacknowledged writes to an absent servo are not errors.
        h.write_raw_async(id(9), Param::GoalPosition, 10).await.unwrap();
        h.write_async(id(1), Param::GoalPosition, ParamValue::Int(3000))
            .await
            .unwrap();
        let temps = h
            .bulk_read(vec![id(1), id(2)], Param::PresentTemperature)
            .await
            .unwrap();
        assert_eq!(temps.len(), 2);
        assert_eq!(rig.mock.register(id(1), Param::GoalPosition), Some(3000));
        assert_eq!(h.control_table().await.unwrap().name, "sts3215");
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_poll_publishes_feedback() {
        let rig = rig(config());
        let mut rx = rig.messages.subscribe("arm", &TopicPath::joint_state("shoulder"));
        rig.handle
            .register_servo(ServoRegistration::new(id(1), "shoulder", 0.5, 2, false))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Message::JointFeedback(fb) => assert!((fb.angle - 0.5).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        rig.mock
            .set_register(id(1), Param::PresentPosition, CENTER_STEP + 100);
        match rx.recv().await.unwrap() {
            Message::JointFeedback(fb) => assert!(fb.angle > 0.5),
            other => panic!("unexpected {other:?}"),
        }
        let servos = rig.handle.list_servos().await.unwrap();
        assert_eq!(servos.len(), 1);
        assert!(servos[0].last_position.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_status_interval_disables_status_poll() {
        let rig = rig(ControllerConfig {
            status_poll_interval: Duration::ZERO,
            ..config()
        });
        rig.handle
            .register_servo(ServoRegistration::new(id(1), "shoulder", 0.0, 2, false))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!rig
            .mock
            .ops()
            .iter()
            .any(|op| matches!(op, servo_bus::BusOp::BulkRead { param: Param::PresentTemperature, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_transition_runs_arm_sequence() {
        let rig = rig(config());
        rig.handle
            .register_servo(ServoRegistration::new(id(1), "shoulder", 0.0, 2, false))
            .await
            .unwrap();
        rig.mock.set_register(id(1), Param::PresentPosition, 900);
        rig.safety.arm();

        // Any request is served after the transition already queued.
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.handle.list_servos().await.unwrap();
        assert_eq!(rig.mock.register(id(1), Param::TorqueEnable), Some(1));
        assert_eq!(rig.mock.register(id(1), Param::GoalPosition), Some(900));

        let report = rig.safety.disarm();
        assert_eq!(report.hooks_run, 1);
        assert_eq!(rig.mock.register(id(1), Param::TorqueEnable), Some(0));
    }

    #[tokio::test]
    async fn test_disarm_right_after_arm_leaves_torque_off() {
        let rig = rig(config());
        rig.handle
            .register_servo(ServoRegistration::new(id(1), "shoulder", 0.0, 2, false))
            .await
            .unwrap();
        rig.safety.arm();
        rig.safety.disarm();

        // Both transitions are served before this request.
        rig.handle.list_servos().await.unwrap();
        assert!(!rig.safety.is_armed());
        assert_eq!(rig.mock.register(id(1), Param::TorqueEnable), Some(0));
        assert!(!rig.mock.ops().iter().any(|op| matches!(
            op,
            servo_bus::BusOp::BulkWrite { param: Param::TorqueEnable, values }
                if values.iter().any(|(_, raw)| *raw == 1)
        )));
    }

    #[tokio::test]
    async fn test_stop_releases_bus_and_disarm_still_works() {
        let rig = rig(config());
        rig.handle
            .register_servo(ServoRegistration::new(id(1), "shoulder", 0.0, 2, false))
            .await
            .unwrap();
        assert!(!rig.handle.is_stopped());
        rig.handle.stop().await.unwrap();
        assert!(!rig.mock.is_alive());
        assert!(rig.handle.is_stopped());
        assert!(matches!(
            rig.handle.read(id(1), Param::Lock).await,
            Err(ControllerError::Stopped)
        ));
        // The snapshot outlives the task; disarm is attempted and swallowed.
        let report = rig.safety.disarm();
        assert_eq!(report.hooks_run, 1);
        assert!(report.failed.is_empty());
    }
}
