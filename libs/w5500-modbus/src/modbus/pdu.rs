//! Modbus PDUs for the register functions
//!
//! Requests validate their arguments before encoding, so an out-of-range
//! count never reaches the wire. Responses are decoded against the request
//! that produced them.

use std::fmt;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::error::{LinkError, Result};

/// Largest register count for FC03/FC04
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest register count for FC16
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Exception responses set the high bit of the function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x06 => Some(Self::WriteSingleRegister),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub const fn exception_code(self) -> u8 {
        self.code() | EXCEPTION_FLAG
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02X}", self.code())
    }
}

/// Exception codes carried in byte 1 of an exception PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Other(u8),
}

impl ExceptionCode {
    pub const fn code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Other(code) => code,
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::ServerDeviceFailure => "Server Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server Device Busy",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailedToRespond => "Gateway Target Failed To Respond",
            Self::Other(_) => "Unknown Exception",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Register request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    /// Builds a request from raw parts
    ///
    /// For the read functions `data` holds the register count as its single
    /// element; for FC06 the single value; for FC16 the values to write.
    pub fn from_parts(function: u8, address: u16, data: &[u16]) -> Result<Self> {
        let function = FunctionCode::from_code(function).ok_or_else(|| {
            LinkError::invalid(format!("unsupported function code 0x{:02X}", function))
        })?;
        let single = || match data {
            [value] => Ok(*value),
            _ => Err(LinkError::invalid(format!(
                "{} takes exactly one value, got {}",
                function,
                data.len()
            ))),
        };
        let request = match function {
            FunctionCode::ReadHoldingRegisters => Self::ReadHoldingRegisters {
                address,
                count: single()?,
            },
            FunctionCode::ReadInputRegisters => Self::ReadInputRegisters {
                address,
                count: single()?,
            },
            FunctionCode::WriteSingleRegister => Self::WriteSingleRegister {
                address,
                value: single()?,
            },
            FunctionCode::WriteMultipleRegisters => Self::WriteMultipleRegisters {
                address,
                values: data.to_vec(),
            },
        };
        request.validate()?;
        Ok(request)
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Self::ReadHoldingRegisters { address, .. }
            | Self::ReadInputRegisters { address, .. }
            | Self::WriteSingleRegister { address, .. }
            | Self::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (count, limit) = match self {
            Self::ReadHoldingRegisters { count, .. } | Self::ReadInputRegisters { count, .. } => {
                (usize::from(*count), MAX_READ_REGISTERS)
            },
            Self::WriteMultipleRegisters { values, .. } => (values.len(), MAX_WRITE_REGISTERS),
            Self::WriteSingleRegister { .. } => return Ok(()),
        };
        if count == 0 || count > usize::from(limit) {
            return Err(LinkError::invalid(format!(
                "{} count {} outside 1..={}",
                self.function_code(),
                count,
                limit
            )));
        }
        let last = usize::from(self.address()) + count - 1;
        if last > usize::from(u16::MAX) {
            return Err(LinkError::invalid(format!(
                "{} range {}+{} exceeds address space",
                self.function_code(),
                self.address(),
                count
            )));
        }
        Ok(())
    }

    /// Validates and encodes the request PDU (function code first)
    pub fn encode_pdu(&self) -> Result<BytesMut> {
        self.validate()?;
        let mut pdu = BytesMut::with_capacity(6);
        pdu.put_u8(self.function_code().code());
        match self {
            Self::ReadHoldingRegisters { address, count }
            | Self::ReadInputRegisters { address, count } => {
                pdu.put_u16(*address);
                pdu.put_u16(*count);
            },
            Self::WriteSingleRegister { address, value } => {
                pdu.put_u16(*address);
                pdu.put_u16(*value);
            },
            Self::WriteMultipleRegisters { address, values } => {
                pdu.reserve(5 + values.len() * 2);
                pdu.put_u16(*address);
                pdu.put_u16(values.len() as u16);
                pdu.put_u8((values.len() * 2) as u8);
                for value in values {
                    pdu.put_u16(*value);
                }
            },
        }
        Ok(pdu)
    }

    /// Decodes the response PDU for this request
    pub fn decode_response(&self, pdu: &[u8]) -> Result<Response> {
        let function = self.function_code();
        let code = *pdu
            .first()
            .ok_or_else(|| LinkError::protocol("empty response PDU"))?;

        if code == function.exception_code() {
            let exception = pdu
                .get(1)
                .copied()
                .ok_or_else(|| LinkError::protocol("exception PDU without code"))?;
            return Err(LinkError::ModbusException {
                function: function.code(),
                code: ExceptionCode::from(exception),
            });
        }
        if code != function.code() {
            return Err(LinkError::protocol(format!(
                "function code 0x{:02X} in response to {}",
                code, function
            )));
        }

        match self {
            Self::ReadHoldingRegisters { count, .. } | Self::ReadInputRegisters { count, .. } => {
                let byte_count = usize::from(
                    *pdu.get(1)
                        .ok_or_else(|| LinkError::protocol("read response without byte count"))?,
                );
                if byte_count != usize::from(*count) * 2 {
                    return Err(LinkError::protocol(format!(
                        "byte count {} for {} registers",
                        byte_count, count
                    )));
                }
                if pdu.len() != 2 + byte_count {
                    return Err(LinkError::protocol(format!(
                        "read response {}B, byte count says {}B",
                        pdu.len() - 2,
                        byte_count
                    )));
                }
                let registers: Vec<u16> = pdu[2..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                debug!("{} {} regs", function, registers.len());
                Ok(Response::Registers(registers))
            },
            Self::WriteSingleRegister { address, value } => {
                let (echo_address, echo_value) = decode_echo(pdu, function)?;
                if echo_address != *address || echo_value != *value {
                    return Err(LinkError::protocol(format!(
                        "{} echo {}={} for request {}={}",
                        function, echo_address, echo_value, address, value
                    )));
                }
                Ok(Response::SingleWritten {
                    address: echo_address,
                    value: echo_value,
                })
            },
            Self::WriteMultipleRegisters { address, values } => {
                let (echo_address, quantity) = decode_echo(pdu, function)?;
                if echo_address != *address || usize::from(quantity) != values.len() {
                    return Err(LinkError::protocol(format!(
                        "{} echo {}x{} for request {}x{}",
                        function,
                        echo_address,
                        quantity,
                        address,
                        values.len()
                    )));
                }
                Ok(Response::MultipleWritten {
                    address: echo_address,
                    count: quantity,
                })
            },
        }
    }
}

fn decode_echo(pdu: &[u8], function: FunctionCode) -> Result<(u16, u16)> {
    if pdu.len() != 5 {
        return Err(LinkError::protocol(format!(
            "{} response {}B, expected 5B",
            function,
            pdu.len()
        )));
    }
    Ok((
        u16::from_be_bytes([pdu[1], pdu[2]]),
        u16::from_be_bytes([pdu[3], pdu[4]]),
    ))
}

/// Decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    SingleWritten { address: u16, value: u16 },
    MultipleWritten { address: u16, count: u16 },
}

impl Response {
    /// Register values for read responses, empty for write echoes
    pub fn into_registers(self) -> Vec<u16> {
        match self {
            Self::Registers(values) => values,
            Self::SingleWritten { .. } | Self::MultipleWritten { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_read_holding() {
        let pdu = Request::ReadHoldingRegisters {
            address: 0x006B,
            count: 3,
        }
        .encode_pdu()
        .unwrap();
        assert_eq!(pdu.as_ref(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_encode_write_multiple() {
        let pdu = Request::WriteMultipleRegisters {
            address: 0x0001,
            values: vec![0x000A, 0x0102],
        }
        .encode_pdu()
        .unwrap();
        assert_eq!(
            pdu.as_ref(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_count_limits() {
        for count in [0u16, 126] {
            let err = Request::ReadInputRegisters { address: 0, count }
                .encode_pdu()
                .unwrap_err();
            assert!(matches!(err, LinkError::InvalidArgument(_)));
        }
        assert!(Request::ReadHoldingRegisters {
            address: 0,
            count: 125
        }
        .validate()
        .is_ok());

        let too_many = Request::WriteMultipleRegisters {
            address: 0,
            values: vec![0; 124],
        };
        assert!(too_many.validate().is_err());
        let empty = Request::WriteMultipleRegisters {
            address: 0,
            values: vec![],
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_range_past_address_space() {
        let request = Request::ReadHoldingRegisters {
            address: 0xFFFF,
            count: 2,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(
            Request::from_parts(0x03, 10, &[4]).unwrap(),
            Request::ReadHoldingRegisters {
                address: 10,
                count: 4
            }
        );
        assert_eq!(
            Request::from_parts(0x10, 10, &[1, 2]).unwrap(),
            Request::WriteMultipleRegisters {
                address: 10,
                values: vec![1, 2]
            }
        );
        assert!(Request::from_parts(0x06, 10, &[1, 2]).is_err());
        assert!(Request::from_parts(0x05, 10, &[1]).is_err());
    }

    #[test]
    fn test_decode_registers() {
        let request = Request::ReadHoldingRegisters {
            address: 0,
            count: 2,
        };
        let response = request
            .decode_response(&[0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD])
            .unwrap();
        assert_eq!(response, Response::Registers(vec![0x1234, 0xABCD]));
    }

    #[test]
    fn test_decode_byte_count_mismatch() {
        let request = Request::ReadHoldingRegisters {
            address: 0,
            count: 2,
        };
        let err = request
            .decode_response(&[0x03, 0x02, 0x12, 0x34])
            .unwrap_err();
        assert!(matches!(err, LinkError::ProtocolViolation(_)));
    }

    #[test]
    fn test_decode_exception() {
        let request = Request::ReadHoldingRegisters {
            address: 0,
            count: 1,
        };
        let err = request.decode_response(&[0x83, 0x02]).unwrap_err();
        match err {
            LinkError::ModbusException { function, code } => {
                assert_eq!(function, 0x03);
                assert_eq!(code, ExceptionCode::IllegalDataAddress);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_foreign_function_code() {
        let request = Request::ReadHoldingRegisters {
            address: 0,
            count: 1,
        };
        for pdu in [&[0x04, 0x02, 0x00, 0x01][..], &[0x84, 0x02][..]] {
            let err = request.decode_response(pdu).unwrap_err();
            assert!(matches!(err, LinkError::ProtocolViolation(_)));
        }
    }

    #[test]
    fn test_decode_write_echo_mismatch() {
        let request = Request::WriteSingleRegister {
            address: 100,
            value: 1234,
        };
        assert!(request
            .decode_response(&[0x06, 0x00, 0x64, 0x04, 0xD2])
            .is_ok());
        let err = request
            .decode_response(&[0x06, 0x00, 0x65, 0x04, 0xD2])
            .unwrap_err();
        assert!(matches!(err, LinkError::ProtocolViolation(_)));
    }

    #[test]
    fn test_exception_code_mapping() {
        assert_eq!(ExceptionCode::from(0x0B), ExceptionCode::GatewayTargetFailedToRespond);
        assert_eq!(ExceptionCode::from(0x42), ExceptionCode::Other(0x42));
        assert_eq!(ExceptionCode::from(0x42).code(), 0x42);
        assert_eq!(
            ExceptionCode::IllegalDataAddress.to_string(),
            "Illegal Data Address (0x02)"
        );
    }
}
