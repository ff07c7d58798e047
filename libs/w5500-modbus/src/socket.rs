//! Socket control
//!
//! Drives one hardware socket through its command register and interprets
//! the status and interrupt registers. Every command is written to Sn_CR and
//! then polled until the chip clears it.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::clock::{poll_until, Clock};
use crate::device::W5500;
use crate::error::{LinkError, Result, SocketSnapshot};
use crate::registers::{sn_ir, socket, SocketCommand, SocketMode, SocketSlot, SocketStatus};

/// Result of a TCP connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Established,
    /// Status fell back to CLOSED without a timeout (RST from the peer)
    Refused,
    /// Handshake or ARP timed out, or the deadline passed
    Timeout,
}

/// Register dump of one socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketInfo {
    pub slot: u8,
    pub mode: SocketMode,
    pub command: u8,
    pub status: SocketStatus,
    pub interrupt: u8,
    pub local_port: u16,
    pub peer: SocketAddrV4,
    pub tx_free: u16,
    pub rx_received: u16,
}

impl<B: Bus, C: Clock> W5500<B, C> {
    pub fn status(&mut self, slot: SocketSlot) -> Result<SocketStatus> {
        Ok(SocketStatus::from_code(
            self.read_u8(socket::SR, slot.register_block())?,
        ))
    }

    pub fn interrupt(&mut self, slot: SocketSlot) -> Result<u8> {
        self.read_u8(socket::IR, slot.register_block())
    }

    /// Clears the given Sn_IR bits (write 1 to clear)
    pub fn clear_interrupt(&mut self, slot: SocketSlot, mask: u8) -> Result<()> {
        self.write_u8(socket::IR, slot.register_block(), mask)
    }

    pub fn snapshot(&mut self, slot: SocketSlot) -> Result<SocketSnapshot> {
        Ok(SocketSnapshot {
            slot: slot.index(),
            status: self.status(slot)?,
            interrupt: self.interrupt(slot)?,
            last_command: self.last_command(slot),
        })
    }

    /// Writes a command without waiting for the chip to accept it
    pub(crate) fn post_command(&mut self, slot: SocketSlot, command: SocketCommand) -> Result<()> {
        self.write_u8(socket::CR, slot.register_block(), command.code())?;
        self.record_command(slot, command);
        Ok(())
    }

    /// Writes a command and polls Sn_CR until it reads back zero
    pub fn issue_command(&mut self, slot: SocketSlot, command: SocketCommand) -> Result<()> {
        self.post_command(slot, command)?;

        let clock = self.clock().clone();
        let budget = self.timing().command_budget;
        let poll = self.timing().command_poll;
        let block = slot.register_block();
        let accepted = poll_until(&clock, budget, poll, || {
            Ok((self.read_u8(socket::CR, block)? == 0).then_some(()))
        })?;

        match accepted {
            Some(()) => {
                debug!("{} CMD {} done", slot, command);
                Ok(())
            },
            None => {
                let snapshot = self.snapshot(slot)?;
                error!("{} CMD {} stuck: {}", slot, command, snapshot);
                Err(LinkError::CommandTimeout {
                    command,
                    budget_ms: budget.as_millis() as u64,
                    snapshot,
                })
            },
        }
    }

    /// Closes the socket and waits for it to report CLOSED
    pub fn close(&mut self, slot: SocketSlot) -> Result<()> {
        self.issue_command(slot, SocketCommand::Close)?;
        self.clear_interrupt(slot, sn_ir::ALL)?;

        let clock = self.clock().clone();
        let settle = self.timing().close_settle;
        let poll = self.timing().command_poll;
        let closed = poll_until(&clock, settle, poll, || {
            Ok((self.status(slot)? == SocketStatus::Closed).then_some(()))
        })?;

        if closed.is_none() {
            let snapshot = self.snapshot(slot)?;
            error!("{} not closed: {}", slot, snapshot);
            return Err(LinkError::SlotNotClosed { snapshot });
        }
        debug!("{} closed", slot);
        Ok(())
    }

    /// Graceful FIN when established, then close
    pub fn disconnect(&mut self, slot: SocketSlot) -> Result<()> {
        if self.status(slot)? == SocketStatus::Established {
            if let Err(e) = self.issue_command(slot, SocketCommand::Discon) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("{} DISCON failed: {}", slot, e);
            }
        }
        self.close(slot)
    }

    /// Force-closes the slot, then opens it in `mode` on `local_port`
    pub fn open(
        &mut self,
        slot: SocketSlot,
        mode: SocketMode,
        local_port: u16,
    ) -> Result<SocketStatus> {
        let expected = match mode {
            SocketMode::Tcp => SocketStatus::Init,
            SocketMode::Udp => SocketStatus::Udp,
            other => {
                return Err(LinkError::invalid(format!(
                    "cannot open {} in mode {}",
                    slot, other
                )))
            },
        };

        self.close(slot)?;

        let block = slot.register_block();
        self.write_u8(socket::MR, block, mode.code())?;
        self.write_u16(socket::PORT, block, local_port)?;
        self.clear_interrupt(slot, sn_ir::ALL)?;
        self.issue_command(slot, SocketCommand::Open)?;

        let status = self.status(slot)?;
        if status != expected {
            let snapshot = self.snapshot(slot)?;
            error!("{} open failed: {}", slot, snapshot);
            return Err(LinkError::OpenFailed { expected, snapshot });
        }
        debug!("{} open: {} port={}", slot, mode, local_port);
        Ok(status)
    }

    pub fn set_destination(&mut self, slot: SocketSlot, peer: SocketAddrV4) -> Result<()> {
        let block = slot.register_block();
        self.write_bytes(socket::DIPR, block, &peer.ip().octets())?;
        self.write_u16(socket::DPORT, block, peer.port())
    }

    /// Starts a TCP handshake and waits for its outcome
    ///
    /// The TIMEOUT interrupt is checked before the CLOSED status because the
    /// chip sets both when ARP or SYN retransmission gives up. A timed-out
    /// slot is closed before returning.
    pub fn connect(
        &mut self,
        slot: SocketSlot,
        peer: SocketAddrV4,
        timeout: Duration,
    ) -> Result<ConnectOutcome> {
        self.set_destination(slot, peer)?;
        self.clear_interrupt(slot, sn_ir::ALL)?;
        self.issue_command(slot, SocketCommand::Connect)?;

        let clock = self.clock().clone();
        let poll = self.timing().connect_poll;
        let outcome = poll_until(&clock, timeout, poll, || {
            let status = self.status(slot)?;
            if status == SocketStatus::Established {
                return Ok(Some(ConnectOutcome::Established));
            }
            if self.interrupt(slot)? & sn_ir::TIMEOUT != 0 {
                return Ok(Some(ConnectOutcome::Timeout));
            }
            if status == SocketStatus::Closed {
                return Ok(Some(ConnectOutcome::Refused));
            }
            Ok(None)
        })?
        .unwrap_or(ConnectOutcome::Timeout);

        match outcome {
            ConnectOutcome::Established => {
                self.clear_interrupt(slot, sn_ir::CON)?;
                info!("TCP connected: {} via {}", peer, slot);
            },
            ConnectOutcome::Refused => warn!("TCP refused: {} via {}", peer, slot),
            ConnectOutcome::Timeout => {
                warn!("TCP connect timeout: {} via {}", peer, slot);
                if let Err(e) = self.close(slot) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!("{} close after timeout failed: {}", slot, e);
                }
            },
        }
        Ok(outcome)
    }

    pub fn inspect(&mut self, slot: SocketSlot) -> Result<SocketInfo> {
        let block = slot.register_block();
        let mode = SocketMode::from_register(self.read_u8(socket::MR, block)?);
        let command = self.read_u8(socket::CR, block)?;
        let status = self.status(slot)?;
        let interrupt = self.interrupt(slot)?;
        let local_port = self.read_u16(socket::PORT, block)?;
        let ip = self.read_bytes(socket::DIPR, block, 4)?;
        let peer_port = self.read_u16(socket::DPORT, block)?;
        let tx_free = self.read_u16(socket::TX_FSR, block)?;
        let rx_received = self.read_u16(socket::RX_RSR, block)?;

        Ok(SocketInfo {
            slot: slot.index(),
            mode,
            command,
            status,
            interrupt,
            local_port,
            peer: SocketAddrV4::new(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]), peer_port),
            tx_free,
            rx_received,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::{ConnectBehavior, SimulatedW5500};

    fn device() -> (SimulatedW5500, W5500<SimulatedW5500, ManualClock>) {
        let clock = ManualClock::new();
        let sim = SimulatedW5500::new(clock.clone());
        let device = W5500::with_clock(sim.clone(), clock);
        (sim, device)
    }

    fn slot(index: u8) -> SocketSlot {
        SocketSlot::new(index).unwrap()
    }

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 123, 10), 502)
    }

    #[test]
    fn test_open_tcp_reaches_init() {
        let (_sim, mut dev) = device();
        let status = dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
        assert_eq!(status, SocketStatus::Init);
        assert_eq!(dev.last_command(slot(0)), Some(SocketCommand::Open));
    }

    #[test]
    fn test_open_udp_reaches_udp() {
        let (_sim, mut dev) = device();
        let status = dev.open(slot(1), SocketMode::Udp, 50001).unwrap();
        assert_eq!(status, SocketStatus::Udp);
    }

    #[test]
    fn test_open_rejects_closed_mode() {
        let (_sim, mut dev) = device();
        let err = dev.open(slot(0), SocketMode::Closed, 1).unwrap_err();
        assert!(matches!(err, LinkError::InvalidArgument(_)));
    }

    #[test]
    fn test_connect_established() {
        let (_sim, mut dev) = device();
        dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
        let outcome = dev
            .connect(slot(0), peer(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(outcome, ConnectOutcome::Established);

        let info = dev.inspect(slot(0)).unwrap();
        assert_eq!(info.status, SocketStatus::Established);
        assert_eq!(info.peer, peer());
        assert_eq!(info.local_port, 50000);
    }

    #[test]
    fn test_connect_delayed_accept_within_deadline() {
        let (sim, mut dev) = device();
        sim.set_connect_behavior(ConnectBehavior::AcceptAfter(Duration::from_millis(350)));
        dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
        let outcome = dev.connect(slot(0), peer(), Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, ConnectOutcome::Established);
    }

    #[test]
    fn test_connect_timeout_bit_wins_over_closed() {
        let (sim, mut dev) = device();
        sim.set_connect_behavior(ConnectBehavior::ArpTimeout);
        dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
        let outcome = dev.connect(slot(0), peer(), Duration::from_secs(10)).unwrap();
        assert_eq!(outcome, ConnectOutcome::Timeout);
        assert_eq!(dev.status(slot(0)).unwrap(), SocketStatus::Closed);
    }

    #[test]
    fn test_connect_silent_peer_times_out_and_closes() {
        let (sim, mut dev) = device();
        sim.set_connect_behavior(ConnectBehavior::Silent);
        dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
        let start = dev.clock().now();
        let outcome = dev.connect(slot(0), peer(), Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, ConnectOutcome::Timeout);
        assert!(dev.clock().now() - start >= Duration::from_secs(2));
        assert_eq!(dev.status(slot(0)).unwrap(), SocketStatus::Closed);
        assert_eq!(dev.last_command(slot(0)), Some(SocketCommand::Close));
    }

    #[test]
    fn test_stuck_command_register() {
        let (sim, mut dev) = device();
        sim.set_stuck_command(true);
        let err = dev.issue_command(slot(2), SocketCommand::Open).unwrap_err();
        match err {
            LinkError::CommandTimeout {
                command,
                budget_ms,
                snapshot,
            } => {
                assert_eq!(command, SocketCommand::Open);
                assert_eq!(budget_ms, 500);
                assert_eq!(snapshot.slot, 2);
                assert_eq!(snapshot.last_command, Some(SocketCommand::Open));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_close_reports_unsettled_slot() {
        let (sim, mut dev) = device();
        dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
        sim.set_close_ignored(true);
        let err = dev.close(slot(0)).unwrap_err();
        assert!(matches!(err, LinkError::SlotNotClosed { .. }));
    }

    #[test]
    fn test_disconnect_sends_fin_first() {
        let (sim, mut dev) = device();
        dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
        dev.connect(slot(0), peer(), Duration::from_secs(1)).unwrap();
        dev.disconnect(slot(0)).unwrap();
        assert_eq!(sim.command_count(0, SocketCommand::Discon), 1);
        assert_eq!(dev.status(slot(0)).unwrap(), SocketStatus::Closed);
    }
}
