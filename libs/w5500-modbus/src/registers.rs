//! W5500 register map
//!
//! Offsets, block-select codes, command codes and status codes from the W5500
//! datasheet, plus the small typed wrappers used by the rest of the crate.

use std::fmt;

use serde::Serialize;

use crate::error::{LinkError, Result};

/// Number of hardware sockets on the chip
pub const NUM_SOCKETS: u8 = 8;

/// Value of VERSIONR on a genuine W5500
pub const CHIP_VERSION: u8 = 0x04;

/// Block select for the common register block
pub const COMMON_BLOCK: u8 = 0x00;

/// Common register offsets (block 0x00)
pub mod common {
    pub const MR: u16 = 0x0000;
    pub const GAR: u16 = 0x0001;
    pub const SUBR: u16 = 0x0005;
    pub const SHAR: u16 = 0x0009;
    pub const SIPR: u16 = 0x000F;
    pub const IR: u16 = 0x0015;
    pub const SIR: u16 = 0x0017;
    pub const RTR: u16 = 0x0019;
    pub const RCR: u16 = 0x001B;
    pub const PHYCFGR: u16 = 0x002E;
    pub const VERSIONR: u16 = 0x0039;
}

/// Socket register offsets (block 1 + 4n)
pub mod socket {
    pub const MR: u16 = 0x0000;
    pub const CR: u16 = 0x0001;
    pub const IR: u16 = 0x0002;
    pub const SR: u16 = 0x0003;
    pub const PORT: u16 = 0x0004;
    pub const DHAR: u16 = 0x0006;
    pub const DIPR: u16 = 0x000C;
    pub const DPORT: u16 = 0x0010;
    pub const MSSR: u16 = 0x0012;
    pub const RXBUF_SIZE: u16 = 0x001E;
    pub const TXBUF_SIZE: u16 = 0x001F;
    pub const TX_FSR: u16 = 0x0020;
    pub const TX_RD: u16 = 0x0022;
    pub const TX_WR: u16 = 0x0024;
    pub const RX_RSR: u16 = 0x0026;
    pub const RX_RD: u16 = 0x0028;
    pub const RX_WR: u16 = 0x002A;
}

/// Mode register bits
pub mod mode {
    /// Software reset, self-clearing
    pub const RST: u8 = 0x80;
    /// Force ARP before every send
    pub const FARP: u8 = 0x02;
}

/// Socket interrupt bits (Sn_IR, write 1 to clear)
pub mod sn_ir {
    pub const CON: u8 = 0x01;
    pub const DISCON: u8 = 0x02;
    pub const RECV: u8 = 0x04;
    pub const TIMEOUT: u8 = 0x08;
    pub const SEND_OK: u8 = 0x10;
    pub const ALL: u8 = 0xFF;
}

/// PHYCFGR bits
pub mod phy {
    pub const LINK: u8 = 0x01;
    pub const SPEED_100: u8 = 0x02;
    pub const FULL_DUPLEX: u8 = 0x04;
}

// ============================================================================
// Socket slot
// ============================================================================

/// Index of one of the eight hardware sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SocketSlot(u8);

impl SocketSlot {
    pub fn new(index: u8) -> Result<Self> {
        if index < NUM_SOCKETS {
            Ok(Self(index))
        } else {
            Err(LinkError::invalid(format!(
                "socket slot {} out of range 0..{}",
                index, NUM_SOCKETS
            )))
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    /// Every slot in ascending order
    pub fn all() -> impl Iterator<Item = SocketSlot> {
        (0..NUM_SOCKETS).map(SocketSlot)
    }

    pub const fn register_block(self) -> u8 {
        1 + 4 * self.0
    }

    pub const fn tx_block(self) -> u8 {
        2 + 4 * self.0
    }

    pub const fn rx_block(self) -> u8 {
        3 + 4 * self.0
    }
}

impl fmt::Display for SocketSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

// ============================================================================
// Commands, modes, status
// ============================================================================

/// Socket command register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SocketCommand {
    Open = 0x01,
    Listen = 0x02,
    Connect = 0x04,
    Discon = 0x08,
    Close = 0x10,
    Send = 0x20,
    Recv = 0x40,
}

impl SocketCommand {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Listen),
            0x04 => Some(Self::Connect),
            0x08 => Some(Self::Discon),
            0x10 => Some(Self::Close),
            0x20 => Some(Self::Send),
            0x40 => Some(Self::Recv),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Listen => "LISTEN",
            Self::Connect => "CONNECT",
            Self::Discon => "DISCON",
            Self::Close => "CLOSE",
            Self::Send => "SEND",
            Self::Recv => "RECV",
        }
    }
}

impl fmt::Display for SocketCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol selected in Sn_MR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocketMode {
    Closed,
    Tcp,
    Udp,
    Other(u8),
}

impl SocketMode {
    pub const fn code(self) -> u8 {
        match self {
            Self::Closed => 0x00,
            Self::Tcp => 0x01,
            Self::Udp => 0x02,
            Self::Other(code) => code,
        }
    }

    /// Decodes the protocol nibble of Sn_MR
    pub const fn from_register(value: u8) -> Self {
        match value & 0x0F {
            0x00 => Self::Closed,
            0x01 => Self::Tcp,
            0x02 => Self::Udp,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for SocketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("CLOSED"),
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
            Self::Other(code) => write!(f, "0x{:02X}", code),
        }
    }
}

/// Socket status register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SocketStatus {
    Closed,
    Init,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Udp,
    MacRaw,
    Other(u8),
}

impl SocketStatus {
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Closed,
            0x13 => Self::Init,
            0x14 => Self::Listen,
            0x15 => Self::SynSent,
            0x16 => Self::SynRecv,
            0x17 => Self::Established,
            0x18 => Self::FinWait,
            0x1A => Self::Closing,
            0x1B => Self::TimeWait,
            0x1C => Self::CloseWait,
            0x1D => Self::LastAck,
            0x22 => Self::Udp,
            0x42 => Self::MacRaw,
            other => Self::Other(other),
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            Self::Closed => 0x00,
            Self::Init => 0x13,
            Self::Listen => 0x14,
            Self::SynSent => 0x15,
            Self::SynRecv => 0x16,
            Self::Established => 0x17,
            Self::FinWait => 0x18,
            Self::Closing => 0x1A,
            Self::TimeWait => 0x1B,
            Self::CloseWait => 0x1C,
            Self::LastAck => 0x1D,
            Self::Udp => 0x22,
            Self::MacRaw => 0x42,
            Self::Other(code) => code,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Init => "INIT",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYNSENT",
            Self::SynRecv => "SYNRECV",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN_WAIT",
            Self::Closing => "CLOSING",
            Self::TimeWait => "TIME_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::Udp => "UDP",
            Self::MacRaw => "MACRAW",
            Self::Other(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.code())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_slot_blocks() {
        let s0 = SocketSlot::new(0).unwrap();
        assert_eq!(s0.register_block(), 0x01);
        assert_eq!(s0.tx_block(), 0x02);
        assert_eq!(s0.rx_block(), 0x03);

        let s7 = SocketSlot::new(7).unwrap();
        assert_eq!(s7.register_block(), 0x1D);
        assert_eq!(s7.tx_block(), 0x1E);
        assert_eq!(s7.rx_block(), 0x1F);
    }

    #[test]
    fn test_slot_out_of_range() {
        assert!(SocketSlot::new(8).is_err());
        assert_eq!(SocketSlot::all().count(), 8);
    }

    #[test]
    fn test_status_codes() {
        for code in [0x00, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x1A, 0x1B, 0x1C, 0x1D, 0x22, 0x42] {
            assert_eq!(SocketStatus::from_code(code).code(), code);
        }
        assert_eq!(SocketStatus::from_code(0x99), SocketStatus::Other(0x99));
        assert_eq!(SocketStatus::Established.to_string(), "ESTABLISHED(0x17)");
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(SocketCommand::Open.code(), 0x01);
        assert_eq!(SocketCommand::Recv.code(), 0x40);
        assert_eq!(SocketCommand::from_code(0x20), Some(SocketCommand::Send));
        assert_eq!(SocketCommand::from_code(0x03), None);
    }

    #[test]
    fn test_mode_ignores_flag_bits() {
        assert_eq!(SocketMode::from_register(0x21), SocketMode::Tcp);
        assert_eq!(SocketMode::from_register(0x02), SocketMode::Udp);
    }
}
