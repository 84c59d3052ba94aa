use crate::{ControlTable, ParamValue, Param, PingStatus, PortInfo, Result, ServoId};

/// A minimal blocking servo bus interface.
///
/// One implementation owns one physical half-duplex bus. Callers are
/// expected to serialise access; implementations need not be re-entrant.
pub trait ServoBus: Send {
    /// Open a bus on `port` at `baud` using the given register layout.
    fn open(port: &str, baud: u32, table: ControlTable) -> Result<Self>
    where
        Self: Sized;

    /// Attempt to list available ports for this backend.
    fn list_ports() -> Result<Vec<PortInfo>>
    where
        Self: Sized;

    fn control_table(&self) -> &ControlTable;

    /// Read one register as its raw integer.
    fn read_raw(&mut self, id: ServoId, param: Param) -> Result<u32>;

    /// Write one raw register integer. With `wait_for_ack` false the call
    /// returns once the packet is sent and a missing servo is not reported.
    fn write_raw(&mut self, id: ServoId, param: Param, raw: u32, wait_for_ack: bool)
        -> Result<()>;

    /// Read one value for every id in a single transaction. The result is
    /// aligned with `ids`; any missing reply fails the whole batch.
    fn bulk_read(&mut self, ids: &[ServoId], param: Param) -> Result<Vec<ParamValue>>;

    /// Write one parameter for many servos in a single transaction.
    fn bulk_write(&mut self, param: Param, values: &[(ServoId, ParamValue)]) -> Result<()>;

    /// Buffer a write on the device without applying it.
    fn staged_write(&mut self, id: ServoId, param: Param, value: ParamValue) -> Result<()>;

    /// Apply every staged write on every servo at once.
    fn commit_staged(&mut self) -> Result<()>;

    fn ping(&mut self, id: ServoId) -> Result<PingStatus>;

    /// Release the port. Further calls fail with `BusError::Closed`.
    fn stop(&mut self);

    fn is_alive(&self) -> bool;

    /// Read one register decoded through the control table.
    fn read(&mut self, id: ServoId, param: Param) -> Result<ParamValue> {
        let raw = self.read_raw(id, param)?;
        self.control_table().decode(param, raw)
    }

    /// Write one physical value encoded through the control table.
    fn write(
        &mut self,
        id: ServoId,
        param: Param,
        value: ParamValue,
        wait_for_ack: bool,
    ) -> Result<()> {
        let raw = self.control_table().encode(param, value)?;
        self.write_raw(id, param, raw, wait_for_ack)
    }
}
