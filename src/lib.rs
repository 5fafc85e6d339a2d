//! Modbus TCP Manager
//!
//! Exposes a small web API for connecting to, reading from, and writing to an
//! industrial device speaking Modbus TCP. The core is the device session: one
//! owned connection per device, MBAP-framed request/response handling, and
//! transparent reconnection with bounded retry.

pub mod config;
pub mod modbus;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use modbus::{
    ConnectionInfo, DeviceAddress, ModbusSession, ReadRequest, WriteCoilRequest,
    WriteRegisterRequest,
};
pub use services::ApiService;
pub use utils::error::ModbusError;

pub const VERSION: &str = "0.1.0";
