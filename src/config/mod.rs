pub mod settings;

pub use settings::{Config, ModbusSettings, ServerConfig};
