//! W5500 Modbus TCP Link Library
//!
//! Modbus TCP client running on a WIZnet W5500 hardware TCP/IP offload chip,
//! with a supervisor that keeps the connection alive on flaky field networks.
//!
//! # Architecture
//!
//! - **Bus**: register access by 16-bit address and block select (`bus`, `bus::spi`)
//! - **Device**: chip bring-up and common registers (`device`)
//! - **Socket Control**: per-slot command/status state machine (`socket`)
//! - **Ring Transport**: 16-bit wrapping TX/RX buffer pointers (`ring`)
//! - **Modbus**: MBAP framing and the request/response engine (`modbus`)
//! - **Supervisor**: link wait, ARP probe, reconnect and recovery (`supervisor`)
//! - **Simulator**: in-process chip and peer for tests and dry runs (`sim`)
//!
//! # Features
//!
//! - `spidev` - Linux spidev bus (`bus::spi::SpidevBus`)

pub mod bus;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod modbus;
pub mod registers;
pub mod ring;
pub mod sim;
pub mod socket;
pub mod supervisor;

// Re-export core types
pub use bus::Bus;
pub use clock::{poll_until, Clock, ManualClock, SystemClock};
pub use config::{
    ArpProbeMode, BufferConfig, LinkConfig, MacAddress, NetworkConfig, PeerConfig, RecoveryConfig,
};
pub use device::{PhyStatus, SocketTiming, W5500};
pub use error::{LinkError, Result, SocketSnapshot};
pub use registers::{SocketCommand, SocketMode, SocketSlot, SocketStatus};
pub use ring::{RingTransport, SocketStream};
pub use socket::{ConnectOutcome, SocketInfo};
pub use supervisor::{ConnectionState, LinkStats, RecoveryPolicy, Supervisor};

// Re-export Modbus types for convenience
pub use modbus::{ExceptionCode, FunctionCode, ModbusEngine, Request, Response};
