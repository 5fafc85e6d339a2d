//! Pure MBAP frame building and parsing. No I/O happens here; the session
//! owns the socket and hands raw frames in and out.

use crate::utils::error::ModbusError;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Per-PDU register/coil limit from the Modbus application protocol.
pub const MAX_READ_COUNT: u16 = 125;

const EXCEPTION_BIT: u8 = 0x80;
const MBAP_HEADER_LEN: usize = 7;

/// Decoded body of a well-formed Modbus response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Registers(Vec<u16>),
    Coils(Vec<bool>),
    WriteEcho { address: u16, value: u16 },
}

pub fn encode_read_holding_registers(
    transaction_id: u16,
    unit_id: u8,
    start_address: u16,
    count: u16,
) -> Result<Vec<u8>, ModbusError> {
    validate_count(count)?;
    Ok(wrap_mbap(
        transaction_id,
        unit_id,
        &read_pdu(FC_READ_HOLDING_REGISTERS, start_address, count),
    ))
}

pub fn encode_read_coils(
    transaction_id: u16,
    unit_id: u8,
    start_address: u16,
    count: u16,
) -> Result<Vec<u8>, ModbusError> {
    validate_count(count)?;
    Ok(wrap_mbap(
        transaction_id,
        unit_id,
        &read_pdu(FC_READ_COILS, start_address, count),
    ))
}

pub fn encode_write_single_register(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    value: u16,
) -> Result<Vec<u8>, ModbusError> {
    Ok(wrap_mbap(
        transaction_id,
        unit_id,
        &write_pdu(FC_WRITE_SINGLE_REGISTER, address, value),
    ))
}

/// A coil ON writes 0xFF00 on the wire, OFF writes 0x0000.
pub fn encode_write_single_coil(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    value: bool,
) -> Result<Vec<u8>, ModbusError> {
    let wire_value = if value { 0xFF00 } else { 0x0000 };
    Ok(wrap_mbap(
        transaction_id,
        unit_id,
        &write_pdu(FC_WRITE_SINGLE_COIL, address, wire_value),
    ))
}

/// Parses a full MBAP response frame for the given request function code.
///
/// `count` is the number of registers or coils the request asked for; it is
/// ignored for write echoes. An exception reply (function code with the high
/// bit set) surfaces as [`ModbusError::Protocol`] with the raw exception code.
pub fn decode_response(
    function: u8,
    frame: &[u8],
    count: u16,
) -> Result<ResponsePayload, ModbusError> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(ModbusError::Frame(format!(
            "response too short: {} bytes",
            frame.len()
        )));
    }

    let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
    if protocol_id != 0 {
        return Err(ModbusError::Frame(format!(
            "invalid protocol id: {}",
            protocol_id
        )));
    }

    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if frame.len() != MBAP_HEADER_LEN - 1 + length {
        return Err(ModbusError::Frame(format!(
            "length field {} does not match frame size {}",
            length,
            frame.len()
        )));
    }

    let function_byte = frame[7];
    let pdu_body = &frame[8..];

    if function_byte == function | EXCEPTION_BIT {
        let code = pdu_body.first().copied();
        return Err(ModbusError::Protocol {
            code,
            message: match code {
                Some(c) => format!("{} (code {})", exception_message(c), c),
                None => "exception reply without code".to_string(),
            },
        });
    }

    if function_byte != function {
        return Err(ModbusError::Frame(format!(
            "unexpected function code 0x{:02x}, expected 0x{:02x}",
            function_byte, function
        )));
    }

    match function {
        FC_READ_HOLDING_REGISTERS => decode_registers(pdu_body, count),
        FC_READ_COILS => decode_coils(pdu_body, count),
        FC_WRITE_SINGLE_REGISTER | FC_WRITE_SINGLE_COIL => decode_write_echo(pdu_body),
        _ => Err(ModbusError::Frame(format!(
            "unsupported function code 0x{:02x}",
            function
        ))),
    }
}

fn decode_registers(body: &[u8], count: u16) -> Result<ResponsePayload, ModbusError> {
    let byte_count = body[0] as usize;
    let data = &body[1..];

    if data.len() != byte_count || byte_count != count as usize * 2 {
        return Err(ModbusError::Frame(format!(
            "expected {} register data bytes, got {}",
            count as usize * 2,
            data.len()
        )));
    }

    let words = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(ResponsePayload::Registers(words))
}

fn decode_coils(body: &[u8], count: u16) -> Result<ResponsePayload, ModbusError> {
    let byte_count = body[0] as usize;
    let data = &body[1..];

    // Devices pack 8 coils per byte, so the reply may carry up to 7 padding
    // bits; truncate to the requested count.
    if data.len() != byte_count || byte_count * 8 < count as usize {
        return Err(ModbusError::Frame(format!(
            "expected at least {} coil bits, got {} bytes",
            count, data.len()
        )));
    }

    let bits = (0..count as usize)
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect();
    Ok(ResponsePayload::Coils(bits))
}

fn decode_write_echo(body: &[u8]) -> Result<ResponsePayload, ModbusError> {
    if body.len() != 4 {
        return Err(ModbusError::Frame(format!(
            "write echo must carry 4 bytes, got {}",
            body.len()
        )));
    }

    Ok(ResponsePayload::WriteEcho {
        address: u16::from_be_bytes([body[0], body[1]]),
        value: u16::from_be_bytes([body[2], body[3]]),
    })
}

fn validate_count(count: u16) -> Result<(), ModbusError> {
    if count == 0 || count > MAX_READ_COUNT {
        return Err(ModbusError::Validation(format!(
            "count must be between 1 and {}",
            MAX_READ_COUNT
        )));
    }
    Ok(())
}

fn read_pdu(function: u8, start_address: u16, count: u16) -> [u8; 5] {
    let start = start_address.to_be_bytes();
    let quantity = count.to_be_bytes();
    [function, start[0], start[1], quantity[0], quantity[1]]
}

fn write_pdu(function: u8, address: u16, value: u16) -> [u8; 5] {
    let addr = address.to_be_bytes();
    let val = value.to_be_bytes();
    [function, addr[0], addr[1], val[0], val[1]]
}

fn wrap_mbap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

#[cfg(test)]
pub(crate) fn build_response(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    wrap_mbap(transaction_id, unit_id, pdu)
}
