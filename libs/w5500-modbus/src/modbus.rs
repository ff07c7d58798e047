//! Modbus TCP client protocol
//!
//! - `pdu`: request/response PDUs for the register functions
//! - `frame`: MBAP header and response frame assembly
//! - `engine`: transaction sequencing over a byte [`Transport`]

pub mod engine;
pub mod frame;
pub mod pdu;

pub use engine::{EngineConfig, ModbusEngine, Transport};
pub use frame::{FrameAssembler, MbapHeader, ResponseFrame, MBAP_HEADER_LEN, MODBUS_TCP_PORT};
pub use pdu::{
    ExceptionCode, FunctionCode, Request, Response, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
