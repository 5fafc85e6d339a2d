use thiserror::Error;

/// Error taxonomy for the Modbus TCP manager.
///
/// The session retry loop decides eligibility with [`ModbusError::is_retryable`]
/// instead of inspecting error text: transport-level failures are worth a
/// reconnect, a well-formed Modbus exception from a healthy device is not.
#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Modbus exception: {message}")]
    Protocol { code: Option<u8>, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid response frame: {0}")]
    Frame(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ModbusError {
    /// Whether the failure warrants a reconnect and a fresh attempt.
    ///
    /// A garbled frame counts as a transport symptom: the stream may be
    /// desynchronized and only a reconnect restores a known state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModbusError::Transport(_) | ModbusError::Timeout | ModbusError::Frame(_)
        )
    }

    /// Raw Modbus exception code, when the device returned one.
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            ModbusError::Protocol { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Transport(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::Timeout
    }
}
