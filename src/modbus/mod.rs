pub mod codec;
pub mod session;
pub mod transport;

pub use codec::ResponsePayload;
pub use session::{
    ConnectionInfo, ModbusSession, ReadRequest, WriteCoilRequest, WriteRegisterRequest,
};
pub use transport::{DeviceAddress, ModbusTransport, TcpConnector, TransportConnector};
