use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::{
    Access, BusError, ControlTable, Param, ParamValue, PingStatus, PortInfo, Result, ServoBus,
    ServoId, CENTER_STEP,
};

/// One transaction as seen by the mock bus, in call order.
#[derive(Clone, Debug, PartialEq)]
pub enum BusOp {
    Read { id: ServoId, param: Param },
    Write { id: ServoId, param: Param, raw: u32, wait_for_ack: bool },
    BulkRead { param: Param, ids: Vec<ServoId> },
    BulkWrite { param: Param, values: Vec<(ServoId, u32)> },
    StagedWrite { id: ServoId, param: Param, raw: u32 },
    Commit,
    Ping { id: ServoId },
    Stop,
}

#[derive(Debug, Default)]
struct MockServo {
    registers: BTreeMap<Param, u32>,
}

#[derive(Debug)]
struct MockState {
    table: Arc<ControlTable>,
    alive: bool,
    servos: BTreeMap<ServoId, MockServo>,
    staged: Vec<(ServoId, Param, u32)>,
    failing: BTreeSet<Param>,
    fail_everything: bool,
    torque_on_commit: bool,
    ops: Vec<BusOp>,
}

impl MockState {
    fn check(&self, param: Param) -> Result<()> {
        if !self.alive {
            return Err(BusError::Closed);
        }
        if self.fail_everything || self.failing.contains(&param) {
            return Err(BusError::Timeout);
        }
        Ok(())
    }

    fn servo_mut(&mut self, id: ServoId) -> Result<&mut MockServo> {
        self.servos.get_mut(&id).ok_or(BusError::NoResponse(id))
    }

    fn store(&mut self, id: ServoId, param: Param, raw: u32) -> Result<()> {
        let servo = self.servo_mut(id)?;
        servo.registers.insert(param, raw);
        // An ideal servo: with torque on it arrives at its goal instantly.
        let torque = servo.registers.get(&Param::TorqueEnable).copied().unwrap_or(0) != 0;
        if torque {
            if let Some(goal) = servo.registers.get(&Param::GoalPosition).copied() {
                servo.registers.insert(Param::PresentPosition, goal);
            }
        }
        Ok(())
    }

    fn writable(&self, param: Param) -> Result<()> {
        let spec = self.table.spec(param)?;
        if spec.access == Access::ReadOnly {
            return Err(BusError::InvalidValue {
                param: param.to_string(),
                reason: "read-only register".to_string(),
            });
        }
        Ok(())
    }
}

/// An in-process simulated bus. Clones share the same simulated servos, so
/// a test can keep a clone to inspect registers and the operation log while
/// the controller owns another.
#[derive(Clone, Debug)]
pub struct MockBus {
    table: Arc<ControlTable>,
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new(table: ControlTable) -> Self {
        let table = Arc::new(table);
        Self {
            table: table.clone(),
            state: Arc::new(Mutex::new(MockState {
                table,
                alive: true,
                servos: BTreeMap::new(),
                staged: Vec::new(),
                failing: BTreeSet::new(),
                fail_everything: false,
                torque_on_commit: false,
                ops: Vec::new(),
            })),
        }
    }

    /// Add a servo at rest in the centre with nominal telemetry.
    pub fn add_servo(&self, id: ServoId) {
        let mut servo = MockServo::default();
        for (param, raw) in [
            (Param::ModelNumber, 777),
            (Param::Id, u32::from(id.raw())),
            (Param::TorqueEnable, 0),
            (Param::Lock, 0),
            (Param::GoalPosition, CENTER_STEP),
            (Param::PresentPosition, CENTER_STEP),
            (Param::PresentLoad, 0),
            (Param::PresentVoltage, 74),
            (Param::PresentTemperature, 30),
            (Param::HardwareError, 0),
        ] {
            servo.registers.insert(param, raw);
        }
        self.state.lock().servos.insert(id, servo);
    }

    pub fn with_servos(self, ids: impl IntoIterator<Item = ServoId>) -> Self {
        for id in ids {
            self.add_servo(id);
        }
        self
    }

    /// Set a register directly, bypassing access checks and the op log.
    pub fn set_register(&self, id: ServoId, param: Param, raw: u32) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.registers.insert(param, raw);
        }
    }

    pub fn register(&self, id: ServoId, param: Param) -> Option<u32> {
        self.state
            .lock()
            .servos
            .get(&id)
            .and_then(|s| s.registers.get(&param).copied())
    }

    /// Make every transaction touching `param` time out.
    pub fn fail_param(&self, param: Param) {
        self.state.lock().failing.insert(param);
    }

    pub fn fail_everything(&self, fail: bool) {
        self.state.lock().fail_everything = fail;
    }

    pub fn clear_failures(&self) {
        let mut st = self.state.lock();
        st.failing.clear();
        st.fail_everything = false;
    }

    /// Emulate firmware that enables torque when staged writes are applied.
    pub fn set_torque_on_commit(&self, enabled: bool) {
        self.state.lock().torque_on_commit = enabled;
    }

    pub fn staged_len(&self) -> usize {
        self.state.lock().staged.len()
    }

    pub fn ops(&self) -> Vec<BusOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }
}

impl ServoBus for MockBus {
    /// Accepts `mock` (six servos, ids 1..=6) or `mock:N` (ids 1..=N).
    fn open(port: &str, _baud: u32, table: ControlTable) -> Result<Self> {
        let count = match port.split_once(':') {
            None if port == "mock" => 6,
            Some(("mock", n)) => n
                .parse::<u8>()
                .map_err(|_| BusError::InterfaceNotFound(port.to_string()))?,
            _ => return Err(BusError::InterfaceNotFound(port.to_string())),
        };
        let bus = MockBus::new(table);
        for raw in 1..=count.min(ServoId::MAX) {
            if let Some(id) = ServoId::new(raw) {
                bus.add_servo(id);
            }
        }
        tracing::debug!(port, servos = count, "opened mock servo bus");
        Ok(bus)
    }

    fn list_ports() -> Result<Vec<PortInfo>> {
        Ok(vec![PortInfo {
            name: "mock".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn control_table(&self) -> &ControlTable {
        &self.table
    }

    fn read_raw(&mut self, id: ServoId, param: Param) -> Result<u32> {
        let mut st = self.state.lock();
        st.ops.push(BusOp::Read { id, param });
        st.check(param)?;
        st.table.spec(param)?;
        let servo = st.servo_mut(id)?;
        Ok(servo.registers.get(&param).copied().unwrap_or(0))
    }

    fn write_raw(
        &mut self,
        id: ServoId,
        param: Param,
        raw: u32,
        wait_for_ack: bool,
    ) -> Result<()> {
        let mut st = self.state.lock();
        st.ops.push(BusOp::Write {
            id,
            param,
            raw,
            wait_for_ack,
        });
        st.check(param)?;
        st.writable(param)?;
        match st.store(id, param, raw) {
            Err(BusError::NoResponse(_)) if !wait_for_ack => Ok(()),
            other => other,
        }
    }

    fn bulk_read(&mut self, ids: &[ServoId], param: Param) -> Result<Vec<ParamValue>> {
        let mut st = self.state.lock();
        st.ops.push(BusOp::BulkRead {
            param,
            ids: ids.to_vec(),
        });
        st.check(param)?;
        let spec = *st.table.spec(param)?;
        ids.iter()
            .map(|id| -> Result<ParamValue> {
                let servo = st.servos.get(id).ok_or(BusError::NoResponse(*id))?;
                let raw = servo.registers.get(&param).copied().unwrap_or(0);
                Ok(spec.decode(raw))
            })
            .collect()
    }

    fn bulk_write(&mut self, param: Param, values: &[(ServoId, ParamValue)]) -> Result<()> {
        let mut st = self.state.lock();
        let encoded = values
            .iter()
            .map(|(id, v)| -> Result<(ServoId, u32)> { Ok((*id, st.table.encode(param, *v)?)) })
            .collect::<Result<Vec<_>>>()?;
        st.ops.push(BusOp::BulkWrite {
            param,
            values: encoded.clone(),
        });
        st.check(param)?;
        st.writable(param)?;
        // Sync writes are fire-and-forget on the wire; absent ids are skipped.
        for (id, raw) in encoded {
            if st.servos.contains_key(&id) {
                st.store(id, param, raw)?;
            }
        }
        Ok(())
    }

    fn staged_write(&mut self, id: ServoId, param: Param, value: ParamValue) -> Result<()> {
        let mut st = self.state.lock();
        let raw = st.table.encode(param, value)?;
        st.ops.push(BusOp::StagedWrite { id, param, raw });
        st.check(param)?;
        st.writable(param)?;
        st.servo_mut(id)?;
        st.staged.push((id, param, raw));
        Ok(())
    }

    fn commit_staged(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        st.ops.push(BusOp::Commit);
        if !st.alive {
            return Err(BusError::Closed);
        }
        let staged = std::mem::take(&mut st.staged);
        let torque_on_commit = st.torque_on_commit;
        for (id, param, raw) in staged {
            st.store(id, param, raw)?;
            if torque_on_commit {
                st.store(id, Param::TorqueEnable, 1)?;
            }
        }
        Ok(())
    }

    fn ping(&mut self, id: ServoId) -> Result<PingStatus> {
        let mut st = self.state.lock();
        st.ops.push(BusOp::Ping { id });
        if !st.alive {
            return Err(BusError::Closed);
        }
        let servo = st.servo_mut(id)?;
        let status = servo.registers.get(&Param::HardwareError).copied().unwrap_or(0);
        Ok(PingStatus {
            servo_id: id,
            status: (status & 0xFF) as u8,
        })
    }

    fn stop(&mut self) {
        let mut st = self.state.lock();
        st.ops.push(BusOp::Stop);
        st.alive = false;
        st.staged.clear();
    }

    fn is_alive(&self) -> bool {
        self.state.lock().alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u8) -> ServoId {
        ServoId::new(raw).unwrap()
    }

    fn bus() -> MockBus {
        MockBus::new(ControlTable::sts3215()).with_servos([id(1), id(2)])
    }

    #[test]
    fn open_parses_servo_count() {
        let mut bus = MockBus::open("mock:3", 1_000_000, ControlTable::sts3215()).unwrap();
        assert!(bus.ping(id(3)).is_ok());
        assert_eq!(bus.ping(id(4)), Err(BusError::NoResponse(id(4))));
        assert!(MockBus::open("/dev/ttyUSB0", 1_000_000, ControlTable::sts3215()).is_err());
    }

    #[test]
    fn bulk_read_is_aligned_and_all_or_nothing() -> anyhow::Result<()> {
        let mut bus = bus();
        bus.set_register(id(2), Param::PresentTemperature, 41);
        let temps = bus.bulk_read(&[id(2), id(1)], Param::PresentTemperature)?;
        assert_eq!(temps, vec![ParamValue::Float(41.0), ParamValue::Float(30.0)]);

        let err = bus.bulk_read(&[id(1), id(9)], Param::PresentTemperature);
        assert_eq!(err, Err(BusError::NoResponse(id(9))));
        Ok(())
    }

    #[test]
    fn staged_writes_apply_only_on_commit() -> anyhow::Result<()> {
        let mut bus = bus();
        bus.staged_write(id(1), Param::GoalPosition, ParamValue::Int(1000))?;
        assert_eq!(bus.register(id(1), Param::GoalPosition), Some(CENTER_STEP));
        assert_eq!(bus.staged_len(), 1);
        bus.commit_staged()?;
        assert_eq!(bus.register(id(1), Param::GoalPosition), Some(1000));
        assert_eq!(bus.staged_len(), 0);
        Ok(())
    }

    #[test]
    fn torque_on_commit_moves_servo_to_staged_goal() -> anyhow::Result<()> {
        let mut bus = bus();
        bus.set_torque_on_commit(true);
        bus.staged_write(id(2), Param::GoalPosition, ParamValue::Int(3000))?;
        bus.commit_staged()?;
        assert_eq!(bus.register(id(2), Param::TorqueEnable), Some(1));
        assert_eq!(bus.register(id(2), Param::PresentPosition), Some(3000));
        Ok(())
    }

    #[test]
    fn unacknowledged_write_to_missing_servo_is_silent() {
        let mut bus = bus();
        assert!(bus.write_raw(id(7), Param::GoalPosition, 10, false).is_ok());
        assert!(bus.write_raw(id(7), Param::GoalPosition, 10, true).is_err());
    }

    #[test]
    fn read_only_registers_reject_writes() {
        let mut bus = bus();
        let res = bus.write_raw(id(1), Param::PresentPosition, 10, true);
        assert!(matches!(res, Err(BusError::InvalidValue { .. })));
    }

    #[test]
    fn stopped_bus_is_closed() {
        let mut bus = bus();
        bus.stop();
        assert!(!bus.is_alive());
        assert_eq!(bus.read_raw(id(1), Param::Lock), Err(BusError::Closed));
        assert_eq!(
            bus.bulk_write(Param::TorqueEnable, &[(id(1), ParamValue::Bool(false))]),
            Err(BusError::Closed)
        );
    }

    #[test]
    fn failure_injection_times_out_one_param() {
        let mut bus = bus();
        bus.fail_param(Param::PresentVoltage);
        assert_eq!(
            bus.bulk_read(&[id(1)], Param::PresentVoltage),
            Err(BusError::Timeout)
        );
        assert!(bus.bulk_read(&[id(1)], Param::PresentLoad).is_ok());
        bus.clear_failures();
        assert!(bus.bulk_read(&[id(1)], Param::PresentVoltage).is_ok());
    }
}
