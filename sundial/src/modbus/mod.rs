use async_trait::async_trait;

pub mod connection;
pub mod register;

pub use connection::ModbusPowerSource;

pub type Watts = i64;
pub type UnitId = tokio_modbus::prelude::SlaveId;
pub type Unit = tokio_modbus::prelude::Slave;

/// Something that can report the inverter's instantaneous output.
///
/// Implementations handle their own low-level timeouts. Failures to reach the device are reported as
/// [`crate::Error::Connectivity`] so callers can retry on their next cycle.
#[async_trait]
pub trait PowerSource: Send {
    async fn connect(&mut self) -> crate::Result<()>;

    async fn read_power(&mut self) -> crate::Result<Watts>;

    async fn close(&mut self) -> crate::Result<()>;
}
