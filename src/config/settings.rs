use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // HTTP server settings
    pub server: ServerConfig,

    // Modbus protocol settings
    pub modbus: ModbusSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSettings {
    pub default_port: u16,        // Standard Modbus TCP port
    pub default_unit_id: u8,      // Modbus unit/slave identifier
    pub timeout_seconds: u64,     // Connect and request timeout
    pub max_retries: u32,         // Total attempts per logical call
    pub retry_delay_ms: u64,      // Backoff between reconnect attempts
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            default_port: 502,
            default_unit_id: 1,
            timeout_seconds: 10,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            modbus: ModbusSettings::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ModbusError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| ModbusError::Config(format!("Invalid configuration: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ModbusError::Config(format!("Failed to create directory: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ModbusError::Config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(&path, content).map_err(|e| {
            ModbusError::Config(format!(
                "Failed to write {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Override file/default settings with command line arguments.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ModbusError> {
        if let Some(host) = matches.get_one::<String>("host") {
            self.server.host = host.clone();
        }

        if let Some(port) = matches.get_one::<String>("port") {
            self.server.port = port
                .parse()
                .map_err(|_| ModbusError::Config(format!("Invalid server port: {}", port)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_modbus_conventions() {
        let config = Config::default();
        assert_eq!(config.modbus.default_port, 502);
        assert_eq!(config.modbus.default_unit_id, 1);
        assert_eq!(config.modbus.timeout_seconds, 10);
        assert_eq!(config.modbus.max_retries, 3);
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = Config::default();
        let content = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&content).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.modbus.retry_delay_ms, config.modbus.retry_delay_ms);
    }
}
