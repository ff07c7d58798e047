//! Link Error Types
//!
//! One error enum for the whole stack, grouped by how the supervisor reacts:
//! fatal bus/link failures, transport failures that trigger recovery,
//! connect-phase outcomes retried under the attempt budget, and
//! protocol/caller errors that are returned as-is.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

use crate::modbus::ExceptionCode;
use crate::registers::{SocketCommand, SocketStatus};

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Register state captured when a socket-level operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSnapshot {
    pub slot: u8,
    pub status: SocketStatus,
    pub interrupt: u8,
    pub last_command: Option<SocketCommand>,
}

impl fmt::Display for SocketSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S{} SR={} IR=0x{:02X}",
            self.slot, self.status, self.interrupt
        )?;
        if let Some(cmd) = self.last_command {
            write!(f, " last={}", cmd)?;
        }
        Ok(())
    }
}

/// Link errors
#[derive(Debug, Error)]
pub enum LinkError {
    /// Bus transaction did not complete
    #[error("Bus timeout: addr=0x{addr:04X} block=0x{block:02X}")]
    BusTimeout { addr: u16, block: u8 },

    /// Bus backend failure
    #[error("Bus error: {0}")]
    Bus(String),

    /// Command register did not return to zero within the budget
    #[error("Command {command} not accepted within {budget_ms}ms ({snapshot})")]
    CommandTimeout {
        command: SocketCommand,
        budget_ms: u64,
        snapshot: SocketSnapshot,
    },

    /// Slot failed to reach CLOSED after a close
    #[error("Socket did not close ({snapshot})")]
    SlotNotClosed { snapshot: SocketSnapshot },

    /// OPEN left the socket in an unexpected state
    #[error("Socket open failed, expected {expected} ({snapshot})")]
    OpenFailed {
        expected: SocketStatus,
        snapshot: SocketSnapshot,
    },

    /// TX free size never reached the payload size
    #[error("TX stalled: need {needed}B, free {free}B ({snapshot})")]
    TxStalled {
        needed: usize,
        free: u16,
        snapshot: SocketSnapshot,
    },

    /// Established connection dropped
    #[error("Connection lost ({snapshot})")]
    ConnectionLost { snapshot: SocketSnapshot },

    /// No matching response before the deadline
    #[error("Response timeout: trans_id={transaction_id} after {elapsed_ms}ms ({buffered}B buffered)")]
    ResponseTimeout {
        transaction_id: u16,
        elapsed_ms: u64,
        buffered: usize,
    },

    /// Peer rejected the connection
    #[error("Connection refused: {peer} ({snapshot})")]
    Refused {
        peer: SocketAddrV4,
        snapshot: SocketSnapshot,
    },

    /// Handshake did not complete in time
    #[error("Connect timeout: {peer} ({snapshot})")]
    ConnectTimeout {
        peer: SocketAddrV4,
        snapshot: SocketSnapshot,
    },

    /// ARP probe reported the peer unreachable
    #[error("ARP unreachable: {peer} ({snapshot})")]
    ArpUnreachable {
        peer: Ipv4Addr,
        snapshot: SocketSnapshot,
    },

    /// PHY link never came up
    #[error("No PHY link after {waited_ms}ms")]
    NoLink { waited_ms: u64 },

    /// Connect budget exhausted
    #[error("Connect failed after {attempts} attempts: {last}")]
    ConnectFailed { attempts: u32, last: Box<LinkError> },

    /// VERSIONR does not identify a W5500
    #[error("Unexpected chip version: 0x{0:02X}")]
    UnexpectedVersion(u8),

    /// Malformed or mismatched response
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Peer answered with an exception PDU
    #[error("Modbus exception: FC{function:02X} {code}")]
    ModbusException { function: u8, code: ExceptionCode },

    /// Caller supplied an out-of-range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No session to run the request on
    #[error("Not connected")]
    NotConnected,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Bus(err.to_string())
    }
}

// Helper methods for creating errors
impl LinkError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        LinkError::ProtocolViolation(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        LinkError::InvalidArgument(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        LinkError::Bus(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    /// Errors no retry can fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::BusTimeout { .. }
                | LinkError::Bus(_)
                | LinkError::NoLink { .. }
                | LinkError::UnexpectedVersion(_)
                | LinkError::Config(_)
        )
    }

    /// Socket/transport failures that warrant tearing the session down
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LinkError::CommandTimeout { .. }
                | LinkError::SlotNotClosed { .. }
                | LinkError::OpenFailed { .. }
                | LinkError::TxStalled { .. }
                | LinkError::ConnectionLost { .. }
                | LinkError::ResponseTimeout { .. }
        )
    }

    /// Outcomes of a single connect attempt
    pub fn is_connect_phase(&self) -> bool {
        matches!(
            self,
            LinkError::Refused { .. }
                | LinkError::ConnectTimeout { .. }
                | LinkError::ArpUnreachable { .. }
        )
    }

    /// Register snapshot carried by socket-level errors
    pub fn snapshot(&self) -> Option<&SocketSnapshot> {
        match self {
            LinkError::CommandTimeout { snapshot, .. }
            | LinkError::SlotNotClosed { snapshot }
            | LinkError::OpenFailed { snapshot, .. }
            | LinkError::TxStalled { snapshot, .. }
            | LinkError::ConnectionLost { snapshot }
            | LinkError::Refused { snapshot, .. }
            | LinkError::ConnectTimeout { snapshot, .. }
            | LinkError::ArpUnreachable { snapshot, .. } => Some(snapshot),
            LinkError::ConnectFailed { last, .. } => last.snapshot(),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn snapshot() -> SocketSnapshot {
        SocketSnapshot {
            slot: 0,
            status: SocketStatus::SynSent,
            interrupt: 0x08,
            last_command: Some(SocketCommand::Connect),
        }
    }

    #[test]
    fn test_classification() {
        assert!(LinkError::BusTimeout { addr: 0, block: 1 }.is_fatal());
        assert!(LinkError::NoLink { waited_ms: 5000 }.is_fatal());
        assert!(LinkError::ConnectionLost {
            snapshot: snapshot()
        }
        .is_transport());
        assert!(LinkError::ResponseTimeout {
            transaction_id: 1,
            elapsed_ms: 5000,
            buffered: 0
        }
        .is_transport());

        let refused = LinkError::Refused {
            peer: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 502),
            snapshot: snapshot(),
        };
        assert!(refused.is_connect_phase());
        assert!(!refused.is_transport());
        assert!(!refused.is_fatal());

        let protocol = LinkError::protocol("bad length");
        assert!(!protocol.is_fatal());
        assert!(!protocol.is_transport());
    }

    #[test]
    fn test_snapshot_display() {
        assert_eq!(
            snapshot().to_string(),
            "S0 SR=SYNSENT(0x15) IR=0x08 last=CONNECT"
        );
    }

    #[test]
    fn test_connect_failed_exposes_last_snapshot() {
        let err = LinkError::ConnectFailed {
            attempts: 3,
            last: Box::new(LinkError::ArpUnreachable {
                peer: Ipv4Addr::new(10, 0, 0, 2),
                snapshot: snapshot(),
            }),
        };
        assert_eq!(err.snapshot(), Some(&snapshot()));
        assert!(err.to_string().starts_with("Connect failed after 3 attempts"));
    }

    #[test]
    fn test_io_error_maps_to_bus() {
        let err: LinkError = std::io::Error::new(std::io::ErrorKind::Other, "spi").into();
        assert!(matches!(err, LinkError::Bus(_)));
        assert!(err.is_fatal());
    }
}
