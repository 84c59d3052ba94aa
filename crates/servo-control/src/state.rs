//! Controller state: the servo registry, both polling cycles and the arm
//! sequence. Owned by the controller task; each method runs one bounded
//! series of bus transactions and returns.

use safety_guard::{ComponentId, ReportedError, SafetySubsystem, ViolationSeverity};
use serde::{Deserialize, Serialize};
use servo_bus::{BusError, ControlTable, Param, ParamValue, PingStatus, ServoBus, ServoId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::alerts::{mask_hardware_error, HardwareAlert};
use crate::controller::{ArmFailurePolicy, ControllerConfig, ControllerServices};
use crate::disarm::{DisarmAction, DisarmSnapshot, SharedBus};
use crate::error::Result;
use crate::mapping::{deadband_radians, JointMapping};
use crate::messages::{
    Diagnostic, DiagnosticKind, DiagnosticLevel, JointFeedback, Message, ServoStatus, TopicPath,
};
use crate::metrics::ControllerMetrics;
use crate::pubsub::MessageBus;
use crate::status::{LevelChange, LevelTracker, StatusSnapshot};

const POSITION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoRegistration {
    pub servo_id: ServoId,
    pub joint_name: String,
    pub center_angle: f64,
    /// Minimum movement, in raw steps, before feedback is published.
    pub position_deadband: u32,
    pub reverse: bool,
    /// Last published position as decoded by the driver, in radians.
    pub last_position: Option<f64>,
}

impl ServoRegistration {
    pub fn new(
        servo_id: ServoId,
        joint_name: impl Into<String>,
        center_angle: f64,
        position_deadband: u32,
        reverse: bool,
    ) -> Self {
        Self {
            servo_id,
            joint_name: joint_name.into(),
            center_angle,
            position_deadband,
            reverse,
            last_position: None,
        }
    }

    pub fn mapping(&self) -> JointMapping {
        JointMapping::new(self.center_angle, self.reverse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    NoServos,
    /// The system was disarmed before the sequence could start.
    NotArmed,
    Armed,
    /// Present positions could not be read; torque stays off.
    Aborted,
    /// Present positions could not be read; torque was enabled anyway.
    ArmedWithoutStaging,
    /// A bus step other than the position read failed.
    Failed,
}

pub(crate) struct ControllerState {
    name: String,
    robot: String,
    component: ComponentId,
    bus: SharedBus,
    registry: BTreeMap<ServoId, ServoRegistration>,
    last_status: BTreeMap<ServoId, StatusSnapshot>,
    levels: BTreeMap<ServoId, LevelTracker>,
    disarm_action: DisarmAction,
    arm_failure_policy: ArmFailurePolicy,
    safety: Arc<dyn SafetySubsystem>,
    messages: Arc<dyn MessageBus>,
    metrics: ControllerMetrics,
}

impl ControllerState {
    pub(crate) fn new(config: &ControllerConfig, bus: SharedBus, services: ControllerServices) -> Self {
        Self {
            name: config.name.clone(),
            robot: config.robot.clone(),
            component: ComponentId::new(config.robot.clone(), ["controllers", config.name.as_str()]),
            bus,
            registry: BTreeMap::new(),
            last_status: BTreeMap::new(),
            levels: BTreeMap::new(),
            disarm_action: config.disarm_action,
            arm_failure_policy: config.arm_failure_policy,
            safety: services.safety,
            messages: services.messages,
            metrics: services.metrics,
        }
    }

    pub(crate) fn component(&self) -> &ComponentId {
        &self.component
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.safety.is_armed()
    }

    pub(crate) fn ids(&self) -> Vec<ServoId> {
        self.registry.keys().copied().collect()
    }

    pub(crate) fn disarm_snapshot(&self) -> DisarmSnapshot {
        DisarmSnapshot {
            bus: self.bus.clone(),
            known_ids: self.ids(),
            action: self.disarm_action,
        }
    }

    /// Upsert a servo and hand the safety system a fresh disarm snapshot.
    pub(crate) fn register_servo(&mut self, registration: ServoRegistration) {
        tracing::info!(
            controller = %self.name,
            servo = %registration.servo_id,
            joint = %registration.joint_name,
            "servo registered"
        );
        self.registry.insert(registration.servo_id, registration);
        self.metrics.registered_servos.set(self.registry.len() as i64);
        self.safety
            .register(self.component.clone(), Arc::new(self.disarm_snapshot()));
    }

    pub(crate) fn list_servos(&self) -> Vec<ServoRegistration> {
        self.registry.values().cloned().collect()
    }

    fn with_bus<T>(
        &self,
        f: impl FnOnce(&mut dyn ServoBus) -> servo_bus::Result<T>,
    ) -> Result<T> {
        let mut bus = self.bus.lock();
        let result = f(&mut **bus);
        drop(bus);
        if result.is_err() {
            self.metrics.bus_errors.inc();
        }
        result.map_err(Into::into)
    }

    pub(crate) fn read(&self, id: ServoId, param: Param) -> Result<ParamValue> {
        self.with_bus(|bus| bus.read(id, param))
    }

    pub(crate) fn read_raw(&self, id: ServoId, param: Param) -> Result<u32> {
        self.with_bus(|bus| bus.read_raw(id, param))
    }

    pub(crate) fn write(
        &self,
        id: ServoId,
        param: Param,
        value: ParamValue,
        wait_for_ack: bool,
    ) -> Result<()> {
        self.with_bus(|bus| bus.write(id, param, value, wait_for_ack))
    }

    pub(crate) fn write_raw(
        &self,
        id: ServoId,
        param: Param,
        raw: u32,
        wait_for_ack: bool,
    ) -> Result<()> {
        self.with_bus(|bus| bus.write_raw(id, param, raw, wait_for_ack))
    }

    pub(crate) fn ping(&self, id: ServoId) -> Result<PingStatus> {
        self.with_bus(|bus| bus.ping(id))
    }

    pub(crate) fn bulk_read(&self, ids: &[ServoId], param: Param) -> Result<Vec<ParamValue>> {
        self.with_bus(|bus| bus.bulk_read(ids, param))
    }

    pub(crate) fn control_table(&self) -> ControlTable {
        self.bus.lock().control_table().clone()
    }

    /// One position-feedback cycle. Returns how many joints were published.
    pub(crate) fn poll_positions(&mut self) -> usize {
        if self.registry.is_empty() {
            return 0;
        }
        self.metrics.position_polls.inc();
        let ids = self.ids();
        let result = self.bus.lock().bulk_read(&ids, Param::PresentPosition);
        let readings = match result {
            Ok(readings) if readings.len() == ids.len() => readings,
            Ok(readings) => {
                self.communication_failure(
                    "position poll",
                    &BusError::Io(format!("{} replies for {} servos", readings.len(), ids.len())),
                );
                return 0;
            }
            Err(e) => {
                self.communication_failure("position poll", &e);
                return 0;
            }
        };

        let mut published = 0;
        for (id, value) in ids.iter().zip(readings) {
            let Some(reg) = self.registry.get_mut(id) else {
                continue;
            };
            let position = value.as_f64();
            let significant = match reg.last_position {
                None => true,
                Some(last) => {
                    (position - last).abs()
                        >= deadband_radians(reg.position_deadband) - POSITION_EPSILON
                }
            };
            if !significant {
                continue;
            }
            reg.last_position = Some(position);
            let feedback = JointFeedback {
                joint_name: reg.joint_name.clone(),
                angle: reg.mapping().position_to_angle(position),
            };
            self.messages.publish(
                &self.robot,
                &TopicPath::joint_state(&reg.joint_name),
                Message::JointFeedback(feedback),
            );
            self.metrics.feedback_published.inc();
            published += 1;
        }
        published
    }

    fn read_field(&self, ids: &[ServoId], param: Param) -> Option<Vec<ParamValue>> {
        let result = self.bus.lock().bulk_read(ids, param);
        match result {
            Ok(values) if values.len() == ids.len() => Some(values),
            Ok(_) => {
                self.communication_failure(
                    "status poll",
                    &BusError::Io(format!("misaligned {param} reply")),
                );
                None
            }
            Err(e) => {
                self.communication_failure(&format!("status poll ({param})"), &e);
                None
            }
        }
    }

    /// One status cycle. Returns how many servo statuses were published.
    pub(crate) fn poll_status(&mut self) -> usize {
        if self.registry.is_empty() {
            return 0;
        }
        self.metrics.status_polls.inc();
        let ids = self.ids();
        let temperature = self.read_field(&ids, Param::PresentTemperature);
        let voltage = self.read_field(&ids, Param::PresentVoltage);
        let load = self.read_field(&ids, Param::PresentLoad);
        let hardware = self.read_field(&ids, Param::HardwareError);

        let field = |values: &Option<Vec<ParamValue>>, i: usize| {
            values.as_ref().and_then(|v| v.get(i)).copied()
        };

        let mut published = 0;
        for (i, id) in ids.iter().enumerate() {
            let snapshot = StatusSnapshot {
                temperature: field(&temperature, i).map(|v| v.as_f64()),
                voltage: field(&voltage, i).map(|v| v.as_f64()),
                load: field(&load, i).map(|v| v.as_f64()),
                hardware_error: field(&hardware, i)
                    .map(|v| mask_hardware_error((v.as_i64() & 0xFF) as u8)),
            };
            let previous = self.last_status.get(id).copied();

            if let Some(code) = snapshot.hardware_error {
                let previous_code = previous.and_then(|p| p.hardware_error);
                if code != 0 && previous_code != Some(code) {
                    self.report_hardware_alert(*id, code);
                }
            }

            let changes = self.levels.entry(*id).or_default().observe(&snapshot);
            for change in changes {
                self.publish_level_change(*id, change);
            }

            let changed = previous.map_or(true, |p| snapshot.differs_from(&p));
            if changed {
                let status = ServoStatus {
                    servo_id: *id,
                    temperature: snapshot.temperature,
                    voltage: snapshot.voltage,
                    load: snapshot.load,
                    hardware_error: snapshot.hardware_error,
                };
                self.messages.publish(
                    &self.robot,
                    &TopicPath::servo_status(&self.name, *id),
                    Message::ServoStatus(status),
                );
                self.metrics.status_published.inc();
                self.last_status.insert(*id, snapshot);
                published += 1;
            }
        }
        published
    }

    /// Re-enable torque without a jump: hold every servo where it is, then
    /// turn torque back on.
    pub(crate) fn arm(&mut self) -> ArmOutcome {
        if self.registry.is_empty() {
            return ArmOutcome::NoServos;
        }
        let ids = self.ids();
        let shared = self.bus.clone();
        let mut bus = shared.lock();
        // Checked under the bus lock: a disarm hook that lands after this
        // point waits for the lock and runs once torque is on.
        if !self.is_armed() {
            tracing::debug!(controller = %self.name, "stale arm transition skipped");
            return ArmOutcome::NotArmed;
        }

        let torque_off: Vec<_> = ids.iter().map(|id| (*id, ParamValue::Bool(false))).collect();
        if let Err(e) = bus.bulk_write(Param::TorqueEnable, &torque_off) {
            self.arm_failure("torque disable", &e);
            return ArmOutcome::Failed;
        }

        let mut outcome = ArmOutcome::Armed;
        match bus.bulk_read(&ids, Param::PresentPosition) {
            Ok(positions) if positions.len() == ids.len() => {
                for (id, position) in ids.iter().zip(positions) {
                    if let Err(e) = bus.staged_write(*id, Param::GoalPosition, position) {
                        self.arm_failure("goal staging", &e);
                        return ArmOutcome::Failed;
                    }
                }
                if let Err(e) = bus.commit_staged() {
                    self.arm_failure("staged commit", &e);
                    return ArmOutcome::Failed;
                }
            }
            result => {
                let e = match result {
                    Err(e) => e,
                    Ok(_) => BusError::Io("misaligned position reply".to_string()),
                };
                self.arm_failure("position read", &e);
                match self.arm_failure_policy {
                    ArmFailurePolicy::Abort => {
                        tracing::warn!(controller = %self.name, "arm aborted, torque left disabled");
                        return ArmOutcome::Aborted;
                    }
                    ArmFailurePolicy::EnableTorque => outcome = ArmOutcome::ArmedWithoutStaging,
                }
            }
        }

        let torque_on: Vec<_> = ids.iter().map(|id| (*id, ParamValue::Bool(true))).collect();
        if let Err(e) = bus.bulk_write(Param::TorqueEnable, &torque_on) {
            self.arm_failure("torque enable", &e);
            return ArmOutcome::Failed;
        }
        if let Err(e) = bus.bulk_write(Param::Lock, &torque_on) {
            self.arm_failure("lock", &e);
            return ArmOutcome::Failed;
        }
        tracing::info!(controller = %self.name, servos = ids.len(), "torque enabled");
        outcome
    }

    /// Release the port if the driver is still running.
    pub(crate) fn shutdown(&mut self) {
        let mut bus = self.bus.lock();
        if bus.is_alive() {
            bus.stop();
            tracing::info!(controller = %self.name, "bus stopped");
        }
    }

    fn publish_diagnostic(&self, diagnostic: Diagnostic) {
        self.messages.publish(
            &self.robot,
            &TopicPath::diagnostics(&self.name),
            Message::Diagnostic(diagnostic),
        );
    }

    fn diagnostic(
        &self,
        level: DiagnosticLevel,
        kind: DiagnosticKind,
        message: String,
        servo_id: Option<ServoId>,
        value: Option<f64>,
    ) -> Diagnostic {
        Diagnostic {
            component: self.component.to_string(),
            level,
            kind,
            message,
            servo_id,
            value,
            alerts: Vec::new(),
        }
    }

    fn communication_failure(&self, operation: &str, error: &BusError) {
        tracing::warn!(controller = %self.name, "{} failed: {}", operation, error);
        self.metrics.bus_errors.inc();
        let servo_id = match error {
            BusError::NoResponse(id) => Some(*id),
            _ => None,
        };
        self.publish_diagnostic(self.diagnostic(
            DiagnosticLevel::Error,
            DiagnosticKind::Communication,
            format!("{operation} failed: {error}"),
            servo_id,
            None,
        ));
    }

    fn arm_failure(&self, step: &str, error: &BusError) {
        tracing::error!(controller = %self.name, "arm step {} failed: {}", step, error);
        self.communication_failure(&format!("arm ({step})"), error);
        self.safety.report_error(
            &self.component,
            ReportedError {
                kind: "arm_failed".to_string(),
                severity: ViolationSeverity::Error,
                message: format!("{step} failed: {error}"),
                context: HashMap::new(),
            },
        );
    }

    fn report_hardware_alert(&self, id: ServoId, code: u8) {
        let Some(alert) = HardwareAlert::from_raw(id, code) else {
            return;
        };
        let message = alert.describe();
        tracing::warn!(controller = %self.name, "{}", message);
        self.metrics.hardware_alerts.inc();

        let mut context = HashMap::new();
        context.insert("servo_id".to_string(), serde_json::json!(id.raw()));
        context.insert("raw_value".to_string(), serde_json::json!(alert.raw_value));
        context.insert(
            "alerts".to_string(),
            serde_json::json!(alert.alerts.iter().map(|a| a.as_str()).collect::<Vec<_>>()),
        );
        self.safety.report_error(
            &self.component,
            ReportedError {
                kind: "hardware_alert".to_string(),
                severity: ViolationSeverity::Critical,
                message: message.clone(),
                context,
            },
        );

        let mut diagnostic = self.diagnostic(
            DiagnosticLevel::Error,
            DiagnosticKind::HardwareAlert,
            message,
            Some(id),
            Some(f64::from(code)),
        );
        diagnostic.alerts = alert.alerts.into_iter().collect();
        self.publish_diagnostic(diagnostic);
    }

    fn publish_level_change(&self, id: ServoId, change: LevelChange) {
        let (level, kind, message, value) = match change {
            LevelChange::TemperatureCritical(t) => (
                DiagnosticLevel::Error,
                DiagnosticKind::Temperature,
                format!("servo {id} temperature critical: {t:.1}°C"),
                t,
            ),
            LevelChange::TemperatureWarning(t) => (
                DiagnosticLevel::Warn,
                DiagnosticKind::Temperature,
                format!("servo {id} temperature high: {t:.1}°C"),
                t,
            ),
            LevelChange::TemperatureRecovered(t) => (
                DiagnosticLevel::Ok,
                DiagnosticKind::Temperature,
                format!("servo {id} temperature normal: {t:.1}°C"),
                t,
            ),
            LevelChange::VoltageLow(v) => (
                DiagnosticLevel::Warn,
                DiagnosticKind::Voltage,
                format!("servo {id} voltage low: {v:.1}V"),
                v,
            ),
            LevelChange::VoltageHigh(v) => (
                DiagnosticLevel::Warn,
                DiagnosticKind::Voltage,
                format!("servo {id} voltage high: {v:.1}V"),
                v,
            ),
            LevelChange::VoltageRecovered(v) => (
                DiagnosticLevel::Ok,
                DiagnosticKind::Voltage,
                format!("servo {id} voltage normal: {v:.1}V"),
                v,
            ),
        };
        match level {
            DiagnosticLevel::Ok => tracing::info!(controller = %self.name, "{}", message),
            _ => tracing::warn!(controller = %self.name, "{}", message),
        }
        self.publish_diagnostic(self.diagnostic(level, kind, message, Some(id), Some(value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{Envelope, LocalBus};
    use core::f64::consts::FRAC_PI_4;
    use parking_lot::Mutex;
    use safety_guard::SafetyRegistry;
    use servo_bus::{BusOp, MockBus, CENTER_STEP};
    use tokio::sync::broadcast;

    fn id(raw: u8) -> ServoId {
        ServoId::new(raw).unwrap()
    }

    struct Fixture {
        mock: MockBus,
        safety: Arc<SafetyRegistry>,
        tap: broadcast::Receiver<Envelope>,
        state: ControllerState,
    }

    impl Fixture {
        fn new(ids: &[u8], policy: ArmFailurePolicy) -> Self {
            let mock =
                MockBus::new(ControlTable::sts3215()).with_servos(ids.iter().map(|r| id(*r)));
            let safety = Arc::new(SafetyRegistry::new());
            let messages = Arc::new(LocalBus::new());
            let tap = messages.tap();
            let config = ControllerConfig {
                name: "bus0".to_string(),
                robot: "arm".to_string(),
                arm_failure_policy: policy,
                ..ControllerConfig::default()
            };
            let bus: Box<dyn ServoBus> = Box::new(mock.clone());
            let services = ControllerServices {
                safety: safety.clone(),
                messages,
                metrics: ControllerMetrics::new("bus0").unwrap(),
            };
            let state = ControllerState::new(&config, Arc::new(Mutex::new(bus)), services);
            Self {
                mock,
                safety,
                tap,
                state,
            }
        }

        fn register(&mut self, raw: u8, joint: &str, deadband: u32, reverse: bool) {
            self.state
                .register_servo(ServoRegistration::new(id(raw), joint, 0.0, deadband, reverse));
        }

        fn drain(&mut self) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(env) = self.tap.try_recv() {
                out.push(env);
            }
            out
        }

        fn feedback(&mut self) -> Vec<JointFeedback> {
            self.drain()
                .into_iter()
                .filter_map(|e| match e.message {
                    Message::JointFeedback(f) => Some(f),
                    _ => None,
                })
                .collect()
        }

        fn diagnostics(&mut self) -> Vec<Diagnostic> {
            self.drain()
                .into_iter()
                .filter_map(|e| match e.message {
                    Message::Diagnostic(d) => Some(d),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_register_is_upsert_and_announces_snapshot() {
        let mut fx = Fixture::new(&[1, 2], ArmFailurePolicy::Abort);
        fx.register(1, "shoulder", 2, false);
        fx.register(2, "elbow", 2, false);
        fx.register(1, "shoulder", 4, true);

        let servos = fx.state.list_servos();
        assert_eq!(servos.len(), 2);
        assert_eq!(servos[0].position_deadband, 4);
        assert!(servos[0].reverse);
        assert_eq!(fx.safety.registered(), vec![fx.state.component().clone()]);
        assert_eq!(fx.state.disarm_snapshot().known_ids, vec![id(1), id(2)]);
    }

    #[test]
    fn test_empty_registry_skips_polling() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        assert_eq!(fx.state.poll_positions(), 0);
        assert_eq!(fx.state.poll_status(), 0);
        assert_eq!(fx.state.arm(), ArmOutcome::NoServos);
        assert!(fx.mock.ops().is_empty());
    }

    #[test]
    fn test_first_reading_publishes_then_deadband_applies() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "shoulder", 3, false);

        assert_eq!(fx.state.poll_positions(), 1);
        let first = fx.feedback();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].joint_name, "shoulder");
        assert!(first[0].angle.abs() < 1e-12);

        fx.mock.set_register(id(1), Param::PresentPosition, CENTER_STEP + 2);
        assert_eq!(fx.state.poll_positions(), 0);
        assert!(fx.feedback().is_empty());

        fx.mock.set_register(id(1), Param::PresentPosition, CENTER_STEP + 3);
        assert_eq!(fx.state.poll_positions(), 1);
        let moved = fx.feedback();
        assert!((moved[0].angle - deadband_radians(3)).abs() < 1e-9);
    }

    #[test]
    fn test_deadband_measured_from_last_published() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "shoulder", 3, false);
        fx.state.poll_positions();
        for step in 1..=2 {
            fx.mock
                .set_register(id(1), Param::PresentPosition, CENTER_STEP + step);
            assert_eq!(fx.state.poll_positions(), 0);
        }
        assert_eq!(
            fx.state.list_servos()[0].last_position,
            Some(core::f64::consts::PI)
        );
    }

    #[test]
    fn test_reverse_servo_feedback() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "wrist", 0, true);
        fx.mock.set_register(id(1), Param::PresentPosition, 1536);
        fx.state.poll_positions();
        let fb = fx.feedback();
        assert!((fb[0].angle - FRAC_PI_4).abs() < 1e-9);
    }

    #[test]
    fn test_position_batch_failure_publishes_diagnostic() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "shoulder", 1, false);
        fx.register(5, "ghost", 1, false);
        assert_eq!(fx.state.poll_positions(), 0);
        let diags = fx.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Communication);
        assert_eq!(diags[0].servo_id, Some(id(5)));
        assert_eq!(fx.state.metrics.bus_errors.get(), 1);
        assert!(fx.state.list_servos().iter().all(|s| s.last_position.is_none()));
    }

    #[test]
    fn test_status_publishes_on_change_only() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "shoulder", 1, false);
        assert_eq!(fx.state.poll_status(), 1);
        assert_eq!(fx.state.poll_status(), 0);

        fx.mock.set_register(id(1), Param::PresentVoltage, 75);
        assert_eq!(fx.state.poll_status(), 1);

        // Torque bit alone does not change the masked value.
        fx.mock.set_register(id(1), Param::HardwareError, 0x10);
        assert_eq!(fx.state.poll_status(), 0);
    }

    #[test]
    fn test_failed_field_is_unknown_and_counts_as_change() {
        let mut fx = Fixture::new(&[1, 2], ArmFailurePolicy::Abort);
        fx.register(1, "a", 1, false);
        fx.register(2, "b", 1, false);
        fx.state.poll_status();
        fx.drain();

        fx.mock.fail_param(Param::PresentLoad);
        assert_eq!(fx.state.poll_status(), 2);
        let statuses: Vec<ServoStatus> = fx
            .drain()
            .into_iter()
            .filter_map(|e| match e.message {
                Message::ServoStatus(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.load.is_none() && s.temperature == Some(30.0)));
    }

    #[test]
    fn test_steady_high_temperature_warns_once() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "a", 1, false);
        fx.mock.set_register(id(1), Param::PresentTemperature, 60);
        for _ in 0..5 {
            fx.state.poll_status();
        }
        let warns: Vec<_> = fx
            .diagnostics()
            .into_iter()
            .filter(|d| d.kind == DiagnosticKind::Temperature)
            .collect();
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].level, DiagnosticLevel::Warn);
        assert_eq!(warns[0].value, Some(60.0));
    }

    #[test]
    fn test_hardware_alert_reported_once_per_change() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "a", 1, false);
        fx.mock.set_register(id(1), Param::HardwareError, 0x31);
        fx.state.poll_status();
        fx.state.poll_status();

        let errors = fx.safety.errors_for(fx.state.component());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("voltage_error, overload_error"));
        assert_eq!(errors[0].severity, ViolationSeverity::Critical);

        fx.mock.set_register(id(1), Param::HardwareError, 0x00);
        fx.state.poll_status();
        assert_eq!(fx.safety.errors_for(fx.state.component()).len(), 1);

        fx.mock.set_register(id(1), Param::HardwareError, 0x04);
        fx.state.poll_status();
        assert_eq!(fx.safety.errors_for(fx.state.component()).len(), 2);
        assert_eq!(fx.state.metrics.hardware_alerts.get(), 2);
    }

    #[test]
    fn test_arm_holds_present_position() {
        let mut fx = Fixture::new(&[1, 2], ArmFailurePolicy::Abort);
        fx.safety.arm();
        fx.register(1, "a", 1, false);
        fx.register(2, "b", 1, false);
        fx.mock.set_register(id(1), Param::PresentPosition, 1000);
        fx.mock.set_register(id(2), Param::PresentPosition, 3000);
        fx.mock.clear_ops();

        assert_eq!(fx.state.arm(), ArmOutcome::Armed);
        let ops = fx.mock.ops();
        assert_eq!(
            ops,
            vec![
                BusOp::BulkWrite {
                    param: Param::TorqueEnable,
                    values: vec![(id(1), 0), (id(2), 0)],
                },
                BusOp::BulkRead {
                    param: Param::PresentPosition,
                    ids: vec![id(1), id(2)],
                },
                BusOp::StagedWrite {
                    id: id(1),
                    param: Param::GoalPosition,
                    raw: 1000,
                },
                BusOp::StagedWrite {
                    id: id(2),
                    param: Param::GoalPosition,
                    raw: 3000,
                },
                BusOp::Commit,
                BusOp::BulkWrite {
                    param: Param::TorqueEnable,
                    values: vec![(id(1), 1), (id(2), 1)],
                },
                BusOp::BulkWrite {
                    param: Param::Lock,
                    values: vec![(id(1), 1), (id(2), 1)],
                },
            ]
        );
        // No jump: the servos stay where they were.
        assert_eq!(fx.mock.register(id(1), Param::PresentPosition), Some(1000));
        assert_eq!(fx.mock.register(id(2), Param::PresentPosition), Some(3000));
    }

    #[test]
    fn test_arm_with_torque_on_commit_keeps_servo_in_place() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.safety.arm();
        fx.register(1, "a", 1, false);
        fx.mock.set_torque_on_commit(true);
        fx.mock.set_register(id(1), Param::GoalPosition, CENTER_STEP);
        fx.mock.set_register(id(1), Param::PresentPosition, 1000);
        fx.mock.clear_ops();

        assert_eq!(fx.state.arm(), ArmOutcome::Armed);
        let ops = fx.mock.ops();
        let commit = ops.iter().position(|op| *op == BusOp::Commit).unwrap();
        assert!(ops[..commit].contains(&BusOp::StagedWrite {
            id: id(1),
            param: Param::GoalPosition,
            raw: 1000,
        }));
        assert_eq!(fx.mock.register(id(1), Param::TorqueEnable), Some(1));
        assert_eq!(fx.mock.register(id(1), Param::GoalPosition), Some(1000));
        assert_eq!(fx.mock.register(id(1), Param::PresentPosition), Some(1000));
    }

    #[test]
    fn test_arm_is_skipped_once_disarmed() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.register(1, "a", 1, false);
        fx.safety.arm();
        fx.safety.disarm();
        fx.mock.clear_ops();

        assert_eq!(fx.state.arm(), ArmOutcome::NotArmed);
        assert!(fx.mock.ops().is_empty());
        assert_eq!(fx.mock.register(id(1), Param::TorqueEnable), Some(0));
    }

    #[test]
    fn test_arm_read_failure_aborts_by_default() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.safety.arm();
        fx.register(1, "a", 1, false);
        fx.mock.fail_param(Param::PresentPosition);
        fx.mock.clear_ops();

        assert_eq!(fx.state.arm(), ArmOutcome::Aborted);
        assert_eq!(fx.mock.register(id(1), Param::TorqueEnable), Some(0));
        assert!(!fx
            .mock
            .ops()
            .iter()
            .any(|op| matches!(op, BusOp::Commit | BusOp::StagedWrite { .. })));
        assert_eq!(fx.safety.errors_for(fx.state.component()).len(), 1);
        assert!(fx
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::Communication));
    }

    #[test]
    fn test_arm_read_failure_can_enable_torque() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::EnableTorque);
        fx.safety.arm();
        fx.register(1, "a", 1, false);
        fx.mock.fail_param(Param::PresentPosition);

        assert_eq!(fx.state.arm(), ArmOutcome::ArmedWithoutStaging);
        assert_eq!(fx.mock.register(id(1), Param::TorqueEnable), Some(1));
        assert_eq!(fx.mock.register(id(1), Param::Lock), Some(1));
        assert_eq!(fx.mock.staged_len(), 0);
    }

    #[test]
    fn test_shutdown_stops_live_bus() {
        let mut fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.state.shutdown();
        assert!(!fx.mock.is_alive());
        fx.state.shutdown();
        let stops = fx.mock.ops().iter().filter(|op| **op == BusOp::Stop).count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_generic_access_passes_through() {
        let fx = Fixture::new(&[1], ArmFailurePolicy::Abort);
        fx.state
            .write(id(1), Param::TorqueEnable, ParamValue::Bool(true), true)
            .unwrap();
        assert_eq!(
            fx.state.read(id(1), Param::TorqueEnable).unwrap(),
            ParamValue::Bool(true)
        );
        assert_eq!(fx.state.read_raw(id(1), Param::PresentVoltage).unwrap(), 74);
        assert!(fx.state.ping(id(9)).is_err());
        assert_eq!(fx.state.metrics.bus_errors.get(), 1);
    }
}
