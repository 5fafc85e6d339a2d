//! Device session: owns one connection to one Modbus TCP slave, issues the
//! four supported operations with validation, and recovers from transient
//! connection loss via bounded retry with full reconnect.

use log::{error, info, warn};
use serde::Serialize;
use std::time::Duration;

use super::codec::{self, ResponsePayload};
use super::transport::{DeviceAddress, ModbusTransport, TcpConnector, TransportConnector};
use crate::config::ModbusSettings;
use crate::utils::error::ModbusError;

/// Total attempts per logical call, each retry preceded by a reconnect.
pub const MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub start_address: u16,
    pub count: u16,
}

impl ReadRequest {
    fn validate(&self) -> Result<(), ModbusError> {
        if self.count == 0 || self.count > codec::MAX_READ_COUNT {
            return Err(ModbusError::Validation(format!(
                "count must be between 1 and {}",
                codec::MAX_READ_COUNT
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRegisterRequest {
    pub address: u16,
    pub value: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCoilRequest {
    pub address: u16,
    pub value: bool,
}

/// Snapshot of the session's identity and state, shaped for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout: u64,
    pub is_connected: bool,
}

enum Operation {
    ReadHoldingRegisters(ReadRequest),
    ReadCoils(ReadRequest),
    WriteSingleRegister(WriteRegisterRequest),
    WriteSingleCoil(WriteCoilRequest),
}

impl Operation {
    fn function(&self) -> u8 {
        match self {
            Operation::ReadHoldingRegisters(_) => codec::FC_READ_HOLDING_REGISTERS,
            Operation::ReadCoils(_) => codec::FC_READ_COILS,
            Operation::WriteSingleRegister(_) => codec::FC_WRITE_SINGLE_REGISTER,
            Operation::WriteSingleCoil(_) => codec::FC_WRITE_SINGLE_COIL,
        }
    }

    fn count(&self) -> u16 {
        match self {
            Operation::ReadHoldingRegisters(req) | Operation::ReadCoils(req) => req.count,
            _ => 0,
        }
    }

    fn encode(&self, transaction_id: u16, unit_id: u8) -> Result<Vec<u8>, ModbusError> {
        match self {
            Operation::ReadHoldingRegisters(req) => codec::encode_read_holding_registers(
                transaction_id,
                unit_id,
                req.start_address,
                req.count,
            ),
            Operation::ReadCoils(req) => {
                codec::encode_read_coils(transaction_id, unit_id, req.start_address, req.count)
            }
            Operation::WriteSingleRegister(req) => codec::encode_write_single_register(
                transaction_id,
                unit_id,
                req.address,
                req.value,
            ),
            Operation::WriteSingleCoil(req) => {
                codec::encode_write_single_coil(transaction_id, unit_id, req.address, req.value)
            }
        }
    }
}

/// Holds at most one live transport at a time; reconnecting closes the old
/// handle first. Callers must serialize access (the API layer guards the
/// session with a mutex), because Modbus TCP allows one request in flight.
pub struct ModbusSession {
    address: DeviceAddress,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    transaction_id: u16,
    transport: Option<Box<dyn ModbusTransport>>,
    connector: Box<dyn TransportConnector>,
}

impl ModbusSession {
    pub fn new(address: DeviceAddress) -> Self {
        Self::with_connector(address, Box::new(TcpConnector))
    }

    pub fn with_connector(address: DeviceAddress, connector: Box<dyn TransportConnector>) -> Self {
        Self {
            address,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            transaction_id: 0,
            transport: None,
            connector,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Builds a session from the device IP and configured protocol settings.
    pub fn from_settings(host: String, settings: &ModbusSettings) -> Self {
        Self::new(DeviceAddress {
            host,
            port: settings.default_port,
            unit_id: settings.default_unit_id,
        })
        .with_timeout(Duration::from_secs(settings.timeout_seconds))
        .with_retry_policy(
            settings.max_retries,
            Duration::from_millis(settings.retry_delay_ms),
        )
    }

    /// Establishes a fresh connection, closing any existing handle first.
    pub async fn connect(&mut self) -> Result<(), ModbusError> {
        if self.transport.take().is_some() {
            info!("🔌 Previous connection closed");
        }

        match self.connector.connect(&self.address, self.timeout).await {
            Ok(transport) => {
                self.transport = Some(transport);
                Ok(())
            }
            Err(e) => {
                error!("❌ Connection to {} failed: {}", self.address, e);
                Err(e)
            }
        }
    }

    /// Idempotent; safe to call on an already-disconnected session.
    pub fn disconnect(&mut self) {
        if self.transport.take().is_some() {
            info!("🔌 Disconnected from Modbus device at {}", self.address);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_healthy())
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            ip: self.address.host.clone(),
            port: self.address.port,
            unit_id: self.address.unit_id,
            timeout: self.timeout.as_secs(),
            is_connected: self.is_connected(),
        }
    }

    pub async fn read_holding_registers(
        &mut self,
        request: ReadRequest,
    ) -> Result<Vec<u16>, ModbusError> {
        request.validate()?;
        info!(
            "📖 Reading registers {} to {}",
            request.start_address,
            request.start_address.saturating_add(request.count - 1)
        );

        match self.execute(Operation::ReadHoldingRegisters(request)).await? {
            ResponsePayload::Registers(words) => Ok(words),
            other => Err(ModbusError::Frame(format!(
                "unexpected payload for register read: {:?}",
                other
            ))),
        }
    }

    pub async fn read_coils(&mut self, request: ReadRequest) -> Result<Vec<bool>, ModbusError> {
        request.validate()?;
        info!(
            "📖 Reading coils {} to {}",
            request.start_address,
            request.start_address.saturating_add(request.count - 1)
        );

        match self.execute(Operation::ReadCoils(request)).await? {
            ResponsePayload::Coils(bits) => Ok(bits),
            other => Err(ModbusError::Frame(format!(
                "unexpected payload for coil read: {:?}",
                other
            ))),
        }
    }

    pub async fn write_single_register(
        &mut self,
        request: WriteRegisterRequest,
    ) -> Result<(), ModbusError> {
        info!(
            "📝 Writing value {} to register {}",
            request.value, request.address
        );

        self.execute(Operation::WriteSingleRegister(request)).await?;
        info!("✅ Register {} written successfully", request.address);
        Ok(())
    }

    pub async fn write_single_coil(
        &mut self,
        request: WriteCoilRequest,
    ) -> Result<(), ModbusError> {
        info!(
            "📝 Writing value {} to coil {}",
            request.value as u8, request.address
        );

        self.execute(Operation::WriteSingleCoil(request)).await?;
        info!("✅ Coil {} written successfully", request.address);
        Ok(())
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.transport.as_ref().is_some_and(|t| t.is_healthy()) {
            return true;
        }

        if self.transport.is_some() {
            warn!("🔄 Connection lost, attempting to reconnect...");
        }
        self.connect().await.is_ok()
    }

    /// Shared algorithm for all four operations: an iterative retry loop with
    /// an explicit attempt counter, never recursion. Only transport-level
    /// failures are retried; a clean Modbus exception from a healthy device
    /// returns immediately.
    async fn execute(&mut self, operation: Operation) -> Result<ResponsePayload, ModbusError> {
        let mut attempt = 1;

        loop {
            if !self.ensure_connected().await {
                return Err(ModbusError::Connection(format!(
                    "unable to establish connection to {}",
                    self.address
                )));
            }

            match self.exchange_once(&operation).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        "🔄 Attempt {}/{} failed: {}; reconnecting",
                        attempt, self.max_retries, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    // Full reconnect on the next pass, never a resend on the
                    // stale socket
                    self.transport = None;
                    attempt += 1;
                }
                Err(e) => {
                    error!("❌ Operation failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn exchange_once(&mut self, operation: &Operation) -> Result<ResponsePayload, ModbusError> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let request = operation.encode(self.transaction_id, self.address.unit_id)?;

        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ModbusError::Connection("no active transport".to_string()))?;
        let response = transport.exchange(&request, self.timeout).await?;

        if response.len() >= 2 && response[0..2] != request[0..2] {
            return Err(ModbusError::Frame(format!(
                "transaction id mismatch: sent {}, received {}",
                u16::from_be_bytes([request[0], request[1]]),
                u16::from_be_bytes([response[0], response[1]])
            )));
        }

        codec::decode_response(operation.function(), &response, operation.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::codec::build_response;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    enum StubReply {
        Registers(Vec<u16>),
        Coils(Vec<u8>),
        Exception(u8),
        Echo,
    }

    struct StubState {
        dials: AtomicUsize,
        exchanges: AtomicUsize,
        fail_first: usize,
        reply: StubReply,
        last_request: Mutex<Vec<u8>>,
    }

    impl StubState {
        fn new(reply: StubReply, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
                exchanges: AtomicUsize::new(0),
                fail_first,
                reply,
                last_request: Mutex::new(Vec::new()),
            })
        }
    }

    struct StubConnector {
        state: Arc<StubState>,
        refuse: bool,
    }

    #[async_trait]
    impl TransportConnector for StubConnector {
        async fn connect(
            &self,
            _address: &DeviceAddress,
            _timeout: Duration,
        ) -> Result<Box<dyn ModbusTransport>, ModbusError> {
            self.state.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(ModbusError::Connection("connection refused".to_string()));
            }
            Ok(Box::new(StubTransport {
                state: self.state.clone(),
            }))
        }
    }

    struct StubTransport {
        state: Arc<StubState>,
    }

    #[async_trait]
    impl ModbusTransport for StubTransport {
        async fn exchange(
            &mut self,
            request: &[u8],
            _timeout: Duration,
        ) -> Result<Vec<u8>, ModbusError> {
            let call = self.state.exchanges.fetch_add(1, Ordering::SeqCst);
            *self.state.last_request.lock().unwrap() = request.to_vec();

            if call < self.state.fail_first {
                return Err(ModbusError::Transport(
                    "connection reset by peer".to_string(),
                ));
            }

            let transaction_id = u16::from_be_bytes([request[0], request[1]]);
            let unit_id = request[6];
            let function = request[7];

            let pdu = match &self.state.reply {
                StubReply::Registers(words) => {
                    let mut pdu = vec![function, (words.len() * 2) as u8];
                    for word in words {
                        pdu.extend_from_slice(&word.to_be_bytes());
                    }
                    pdu
                }
                StubReply::Coils(bytes) => {
                    let mut pdu = vec![function, bytes.len() as u8];
                    pdu.extend_from_slice(bytes);
                    pdu
                }
                StubReply::Exception(code) => vec![function | 0x80, *code],
                StubReply::Echo => request[7..12].to_vec(),
            };

            Ok(build_response(transaction_id, unit_id, &pdu))
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    fn stub_session(state: Arc<StubState>) -> ModbusSession {
        ModbusSession::with_connector(
            DeviceAddress {
                host: "127.0.0.1".to_string(),
                port: 15020,
                unit_id: 1,
            },
            Box::new(StubConnector {
                state,
                refuse: false,
            }),
        )
        .with_retry_policy(MAX_RETRIES, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_invalid_count_fails_without_io() {
        let state = StubState::new(StubReply::Registers(vec![1]), 0);
        let mut session = stub_session(state.clone());

        for count in [0, 126] {
            let result = session
                .read_holding_registers(ReadRequest {
                    start_address: 0,
                    count,
                })
                .await;
            assert!(matches!(result, Err(ModbusError::Validation(_))));

            let result = session
                .read_coils(ReadRequest {
                    start_address: 0,
                    count,
                })
                .await;
            assert!(matches!(result, Err(ModbusError::Validation(_))));
        }

        assert_eq!(state.dials.load(Ordering::SeqCst), 0);
        assert_eq!(state.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_read_holding_registers_success() {
        let state = StubState::new(StubReply::Registers(vec![1, 2, 3, 4]), 0);
        let mut session = stub_session(state.clone());

        session.connect().await.unwrap();
        let registers = session
            .read_holding_registers(ReadRequest {
                start_address: 0,
                count: 4,
            })
            .await
            .unwrap();

        assert_eq!(registers, vec![1, 2, 3, 4]);
        assert_eq!(state.dials.load(Ordering::SeqCst), 1);
        assert_eq!(state.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_coils_truncates_to_requested_count() {
        let state = StubState::new(StubReply::Coils(vec![0b0000_0110]), 0);
        let mut session = stub_session(state.clone());

        let coils = session
            .read_coils(ReadRequest {
                start_address: 0,
                count: 4,
            })
            .await
            .unwrap();

        assert_eq!(coils, vec![false, true, true, false]);
    }

    #[tokio::test]
    async fn test_write_single_coil_wire_value() {
        let state = StubState::new(StubReply::Echo, 0);
        let mut session = stub_session(state.clone());

        session
            .write_single_coil(WriteCoilRequest {
                address: 3,
                value: true,
            })
            .await
            .unwrap();
        assert_eq!(&state.last_request.lock().unwrap()[10..12], &[0xFF, 0x00]);

        session
            .write_single_coil(WriteCoilRequest {
                address: 3,
                value: false,
            })
            .await
            .unwrap();
        assert_eq!(&state.last_request.lock().unwrap()[10..12], &[0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_write_single_register_success() {
        let state = StubState::new(StubReply::Echo, 0);
        let mut session = stub_session(state.clone());

        session
            .write_single_register(WriteRegisterRequest {
                address: 100,
                value: 0x1234,
            })
            .await
            .unwrap();
        assert_eq!(state.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_recover_within_budget() {
        // Fails the first two exchanges, succeeds on the third attempt
        let state = StubState::new(StubReply::Registers(vec![7]), 2);
        let mut session = stub_session(state.clone());

        let registers = session
            .read_holding_registers(ReadRequest {
                start_address: 0,
                count: 1,
            })
            .await
            .unwrap();

        assert_eq!(registers, vec![7]);
        assert_eq!(state.exchanges.load(Ordering::SeqCst), 3);
        // Initial dial plus exactly two reconnects
        assert_eq!(state.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_failures_exhaust_retry_budget() {
        let state = StubState::new(StubReply::Registers(vec![7]), usize::MAX);
        let mut session = stub_session(state.clone());

        let result = session
            .read_holding_registers(ReadRequest {
                start_address: 0,
                count: 1,
            })
            .await;

        assert!(matches!(result, Err(ModbusError::Transport(_))));
        assert_eq!(state.exchanges.load(Ordering::SeqCst), MAX_RETRIES as usize);
    }

    #[tokio::test]
    async fn test_exception_reply_is_not_retried() {
        // Illegal data address, e.g. a read at 9999 the device does not map
        let state = StubState::new(StubReply::Exception(0x02), 0);
        let mut session = stub_session(state.clone());

        let result = session
            .read_holding_registers(ReadRequest {
                start_address: 9999,
                count: 1,
            })
            .await;

        match result {
            Err(ModbusError::Protocol { code, .. }) => assert_eq!(code, Some(2)),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(state.exchanges.load(Ordering::SeqCst), 1);
        assert_eq!(state.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_connection_error() {
        let state = StubState::new(StubReply::Echo, 0);
        let mut session = ModbusSession::with_connector(
            DeviceAddress {
                host: "127.0.0.1".to_string(),
                port: 15020,
                unit_id: 1,
            },
            Box::new(StubConnector {
                state: state.clone(),
                refuse: true,
            }),
        );

        assert!(matches!(
            session.connect().await,
            Err(ModbusError::Connection(_))
        ));

        let result = session
            .read_holding_registers(ReadRequest {
                start_address: 0,
                count: 1,
            })
            .await;
        assert!(matches!(result, Err(ModbusError::Connection(_))));
        assert_eq!(state.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let state = StubState::new(StubReply::Echo, 0);
        let mut session = stub_session(state);

        session.connect().await.unwrap();
        assert!(session.is_connected());

        session.disconnect();
        assert!(!session.is_connected());
        session.disconnect();
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_connection_info_reflects_state() {
        let state = StubState::new(StubReply::Echo, 0);
        let mut session = stub_session(state);

        let info = session.connection_info();
        assert_eq!(info.ip, "127.0.0.1");
        assert_eq!(info.port, 15020);
        assert_eq!(info.unit_id, 1);
        assert!(!info.is_connected);

        session.connect().await.unwrap();
        assert!(session.connection_info().is_connected);
    }

    #[tokio::test]
    async fn test_transaction_ids_increment_per_request() {
        let state = StubState::new(StubReply::Echo, 0);
        let mut session = stub_session(state.clone());

        for expected in 1u16..=3 {
            session
                .write_single_register(WriteRegisterRequest {
                    address: 0,
                    value: 0,
                })
                .await
                .unwrap();
            let request = state.last_request.lock().unwrap().clone();
            assert_eq!(u16::from_be_bytes([request[0], request[1]]), expected);
        }
    }
}
