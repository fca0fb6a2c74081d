pub mod actuator;
pub mod calibration;
pub mod capture;
pub mod config;
pub mod modbus;
pub mod monitor;
pub mod shutdown;

mod error;
pub use error::Error;

#[cfg(test)]
mod testing;

pub type Result<T> = std::result::Result<T, Error>;
