//! Connection recovery supervisor
//!
//! Owns the chip, the ring transport and the Modbus engine, and turns them
//! into a connection that heals itself. A connect runs
//! `LinkWait -> [ArpProbe] -> SocketOpening -> Connecting -> Established`;
//! any failure goes through `Recovering` (force-ARP on, every socket closed)
//! before the next attempt, under a bounded attempt budget.

use std::net::SocketAddrV4;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::clock::{poll_until, Clock, SystemClock};
use crate::config::{ArpProbeMode, LinkConfig, RecoveryConfig};
use crate::device::W5500;
use crate::error::{LinkError, Result};
use crate::modbus::{EngineConfig, ModbusEngine, Request, Response};
use crate::registers::{sn_ir, SocketCommand, SocketMode, SocketSlot, SocketStatus};
use crate::ring::{RingTransport, SocketStream};
use crate::socket::ConnectOutcome;

/// Payload of the reachability probe datagram
pub const ARP_PROBE_PAYLOAD: [u8; 2] = [0x00, 0x01];

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    LinkWait,
    ArpProbe,
    SocketOpening,
    Connecting,
    Established,
    Recovering,
}

/// Timing and slot assignment for connect and recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub link_wait: Duration,
    pub link_poll: Duration,
    pub arp_timeout: Duration,
    pub arp_poll: Duration,
    pub connect_timeout: Duration,
    /// Pause after closing every socket during recovery
    pub settle: Duration,
    pub max_attempts: u32,
    pub max_transaction_attempts: u32,
    pub arp_probe: ArpProbeMode,
    pub data_slot: SocketSlot,
    pub probe_slot: SocketSlot,
    pub local_port: u16,
    pub probe_port: u16,
}

impl RecoveryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Result<Self> {
        if config.max_attempts == 0 || config.max_transaction_attempts == 0 {
            return Err(LinkError::config("attempt budgets must be at least 1"));
        }
        let data_slot = SocketSlot::new(config.data_slot)?;
        let probe_slot = SocketSlot::new(config.probe_slot)?;
        if data_slot == probe_slot {
            return Err(LinkError::config(format!(
                "data and probe slot are both {}",
                data_slot
            )));
        }
        Ok(Self {
            link_wait: Duration::from_millis(config.link_wait_ms),
            link_poll: Duration::from_millis(100),
            arp_timeout: Duration::from_millis(config.arp_timeout_ms),
            arp_poll: Duration::from_millis(50),
            connect_timeout: config.connect_timeout(),
            settle: Duration::from_millis(50),
            max_attempts: config.max_attempts,
            max_transaction_attempts: config.max_transaction_attempts,
            arp_probe: config.arp_probe,
            data_slot,
            probe_slot,
            local_port: config.local_port,
            probe_port: config.probe_port,
        })
    }
}

/// Link counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub connect_attempts: u64,
    pub connections: u64,
    pub failed_attempts: u64,
    pub recoveries: u64,
    pub arp_probes: u64,
    pub arp_failures: u64,
    pub requests: u64,
    pub exceptions: u64,
    pub transport_failures: u64,
}

/// Why the previous attempt or transaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Refused,
    ConnectTimeout,
    ArpUnreachable,
    Transport,
}

impl FailureKind {
    fn classify(err: &LinkError) -> Option<Self> {
        match err {
            LinkError::Refused { .. } => Some(Self::Refused),
            LinkError::ConnectTimeout { .. } => Some(Self::ConnectTimeout),
            LinkError::ArpUnreachable { .. } => Some(Self::ArpUnreachable),
            e if e.is_transport() => Some(Self::Transport),
            _ => None,
        }
    }
}

/// Self-healing Modbus TCP client over a W5500
pub struct Supervisor<B: Bus, C: Clock = SystemClock> {
    device: W5500<B, C>,
    ring: RingTransport,
    engine: ModbusEngine,
    policy: RecoveryPolicy,
    state: ConnectionState,
    peer: Option<SocketAddrV4>,
    last_failure: Option<FailureKind>,
    stats: LinkStats,
}

impl<B: Bus, C: Clock> Supervisor<B, C> {
    pub fn new(device: W5500<B, C>, policy: RecoveryPolicy, engine: EngineConfig) -> Self {
        Self {
            device,
            ring: RingTransport::new(),
            engine: ModbusEngine::new(engine),
            policy,
            state: ConnectionState::Disconnected,
            peer: None,
            last_failure: None,
            stats: LinkStats::default(),
        }
    }

    /// Validates `config` and builds a supervisor around an initialized chip
    pub fn from_config(device: W5500<B, C>, config: &LinkConfig) -> Result<Self> {
        config.validate()?;
        let policy = RecoveryPolicy::from_config(&config.recovery)?;
        let engine = EngineConfig {
            unit_id: config.peer.unit_id,
            response_timeout: config.recovery.response_timeout(),
            ..EngineConfig::default()
        };
        Ok(Self::new(device, policy, engine))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn engine(&self) -> &ModbusEngine {
        &self.engine
    }

    pub fn device_mut(&mut self) -> &mut W5500<B, C> {
        &mut self.device
    }

    pub fn into_device(self) -> W5500<B, C> {
        self.device
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Link: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Connects to `peer`, retrying with recovery in between
    pub fn connect(&mut self, peer: SocketAddrV4, timeout: Duration) -> Result<()> {
        if self.state == ConnectionState::Established
            && self.peer == Some(peer)
            && self.is_connected()
        {
            return Ok(());
        }
        self.peer = Some(peer);
        self.establish(peer, timeout)
    }

    /// Tears the session down and connects again to the last peer
    pub fn reconnect(&mut self) -> Result<()> {
        let peer = self.peer.ok_or(LinkError::NotConnected)?;
        info!("Reconnect: {}", peer);
        self.recover()?;
        self.establish(peer, self.policy.connect_timeout)
    }

    fn establish(&mut self, peer: SocketAddrV4, timeout: Duration) -> Result<()> {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            self.stats.connect_attempts += 1;
            match self.attempt(peer, timeout) {
                Ok(()) => {
                    self.engine.reset_session();
                    self.ring.discard(self.policy.data_slot);
                    self.last_failure = None;
                    self.stats.connections += 1;
                    self.set_state(ConnectionState::Established);
                    info!("Link up: {} (attempt {}/{})", peer, attempt, max_attempts);
                    return Ok(());
                },
                Err(e) if e.is_fatal() => {
                    error!("Connect aborted: {}", e);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                },
                Err(e) => {
                    warn!("Connect {}/{} failed: {}", attempt, max_attempts, e);
                    self.stats.failed_attempts += 1;
                    self.last_failure = FailureKind::classify(&e);
                    last_error = Some(e);
                    if let Err(recovery) = self.recover() {
                        error!("Recovery failed: {}", recovery);
                        self.set_state(ConnectionState::Disconnected);
                        return Err(recovery);
                    }
                },
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let last = last_error.unwrap_or(LinkError::NotConnected);
        error!("Connect gave up after {} attempts: {}", max_attempts, last);
        Err(LinkError::ConnectFailed {
            attempts: max_attempts,
            last: Box::new(last),
        })
    }

    fn attempt(&mut self, peer: SocketAddrV4, timeout: Duration) -> Result<()> {
        self.set_state(ConnectionState::LinkWait);
        self.wait_for_link()?;

        if self.should_probe() {
            self.set_state(ConnectionState::ArpProbe);
            self.arp_probe(peer)?;
        }

        let slot = self.policy.data_slot;
        self.set_state(ConnectionState::SocketOpening);
        self.ring.discard(slot);
        self.device
            .open(slot, SocketMode::Tcp, self.policy.local_port)?;

        self.set_state(ConnectionState::Connecting);
        match self.device.connect(slot, peer, timeout)? {
            ConnectOutcome::Established => Ok(()),
            ConnectOutcome::Refused => Err(LinkError::Refused {
                peer,
                snapshot: self.device.snapshot(slot)?,
            }),
            ConnectOutcome::Timeout => Err(LinkError::ConnectTimeout {
                peer,
                snapshot: self.device.snapshot(slot)?,
            }),
        }
    }

    fn should_probe(&self) -> bool {
        match self.policy.arp_probe {
            ArpProbeMode::Never => false,
            ArpProbeMode::Always => true,
            ArpProbeMode::OnFailure => matches!(
                self.last_failure,
                Some(FailureKind::ConnectTimeout | FailureKind::ArpUnreachable)
            ),
        }
    }

    fn wait_for_link(&mut self) -> Result<()> {
        let clock = self.device.clock().clone();
        let up = poll_until(&clock, self.policy.link_wait, self.policy.link_poll, || {
            Ok(self.device.link_up()?.then_some(()))
        })?;
        if up.is_none() {
            let waited_ms = self.policy.link_wait.as_millis() as u64;
            error!("No PHY link after {}ms", waited_ms);
            return Err(LinkError::NoLink { waited_ms });
        }
        Ok(())
    }

    /// Checks that the peer answers ARP by sending a datagram from the probe slot
    ///
    /// The probe socket is closed whatever the outcome.
    pub fn arp_probe(&mut self, peer: SocketAddrV4) -> Result<()> {
        self.stats.arp_probes += 1;
        let slot = self.policy.probe_slot;
        let result = self.run_probe(slot, peer);
        let closed = self.device.close(slot);
        self.ring.discard(slot);

        match (result, closed) {
            (Err(e), _) => {
                if matches!(e, LinkError::ArpUnreachable { .. }) {
                    self.stats.arp_failures += 1;
                }
                Err(e)
            },
            (Ok(()), Err(e)) if e.is_fatal() => Err(e),
            (Ok(()), Err(e)) => {
                warn!("Probe socket close failed: {}", e);
                Ok(())
            },
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn run_probe(&mut self, slot: SocketSlot, peer: SocketAddrV4) -> Result<()> {
        self.device
            .open(slot, SocketMode::Udp, self.policy.probe_port)?;
        self.device.set_destination(slot, peer)?;
        self.device
            .clear_interrupt(slot, sn_ir::SEND_OK | sn_ir::TIMEOUT)?;
        self.ring.write(&mut self.device, slot, &ARP_PROBE_PAYLOAD)?;

        let clock = self.device.clock().clone();
        let verdict = poll_until(&clock, self.policy.arp_timeout, self.policy.arp_poll, || {
            let ir = self.device.interrupt(slot)?;
            if ir & sn_ir::SEND_OK != 0 {
                return Ok(Some(true));
            }
            if ir & sn_ir::TIMEOUT != 0 {
                return Ok(Some(false));
            }
            Ok(None)
        })?;

        if verdict == Some(true) {
            self.device.clear_interrupt(slot, sn_ir::SEND_OK)?;
            debug!("ARP probe ok: {}", peer.ip());
            return Ok(());
        }
        let snapshot = self.device.snapshot(slot)?;
        self.device.clear_interrupt(slot, sn_ir::TIMEOUT)?;
        warn!("ARP probe failed: {} ({})", peer.ip(), snapshot);
        Err(LinkError::ArpUnreachable {
            peer: *peer.ip(),
            snapshot,
        })
    }

    /// Re-arms force-ARP and closes every socket without waiting
    pub fn recover(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Recovering);
        self.stats.recoveries += 1;
        self.device.set_force_arp(true)?;
        for slot in SocketSlot::all() {
            self.device.post_command(slot, SocketCommand::Close)?;
            self.ring.discard(slot);
        }
        self.device.clock().sleep(self.policy.settle);
        info!("Recovery: FARP on, all sockets closed");
        Ok(())
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// True while the data socket reports ESTABLISHED
    ///
    /// A dropped connection or an unreadable status moves the supervisor to
    /// `Recovering`, so the next transaction reconnects. A fatal bus error
    /// leaves it `Disconnected`.
    pub fn is_connected(&mut self) -> bool {
        if self.state != ConnectionState::Established {
            return false;
        }
        match self.device.status(self.policy.data_slot) {
            Ok(SocketStatus::Established) => true,
            Ok(status) => {
                warn!("Link dropped: {} {}", self.policy.data_slot, status);
                self.set_state(ConnectionState::Recovering);
                false
            },
            Err(e) if e.is_fatal() => {
                error!("Link status unreadable: {}", e);
                self.set_state(ConnectionState::Disconnected);
                false
            },
            Err(e) => {
                warn!("Link status unreadable: {}", e);
                self.set_state(ConnectionState::Recovering);
                false
            },
        }
    }

    /// Closes the session gracefully
    pub fn disconnect(&mut self) -> Result<()> {
        let slot = self.policy.data_slot;
        let result = self.device.disconnect(slot);
        self.ring.discard(slot);
        self.set_state(ConnectionState::Disconnected);
        if let Some(peer) = self.peer {
            info!("Disconnected: {}", peer);
        }
        result
    }

    fn ensure_connected(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Established => Ok(()),
            ConnectionState::Recovering => {
                let peer = self.peer.ok_or(LinkError::NotConnected)?;
                self.establish(peer, self.policy.connect_timeout)
            },
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Runs one request, reconnecting and retrying on transport failures
    pub fn transact(&mut self, request: &Request) -> Result<Response> {
        request.validate()?;
        let max_attempts = self.policy.max_transaction_attempts;

        for attempt in 1..=max_attempts {
            self.ensure_connected()?;
            self.stats.requests += 1;

            let clock = self.device.clock().clone();
            let result = {
                let mut stream =
                    SocketStream::new(&mut self.device, &mut self.ring, self.policy.data_slot);
                self.engine.request(&mut stream, &clock, request)
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transport() => {
                    self.stats.transport_failures += 1;
                    self.last_failure = Some(FailureKind::Transport);
                    warn!(
                        "{} failed ({}/{}): {}",
                        request.function_code(),
                        attempt,
                        max_attempts,
                        e
                    );
                    self.recover()?;
                    if attempt == max_attempts {
                        return Err(e);
                    }
                },
                Err(e) => {
                    if matches!(e, LinkError::ModbusException { .. }) {
                        self.stats.exceptions += 1;
                    }
                    warn!("{} failed: {}", request.function_code(), e);
                    return Err(e);
                },
            }
        }
        Err(LinkError::NotConnected)
    }

    pub fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.transact(&Request::ReadHoldingRegisters { address, count })
            .map(Response::into_registers)
    }

    pub fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.transact(&Request::ReadInputRegisters { address, count })
            .map(Response::into_registers)
    }

    pub fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.transact(&Request::WriteSingleRegister { address, value })
            .map(|_| ())
    }

    pub fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        self.transact(&Request::WriteMultipleRegisters {
            address,
            values: values.to_vec(),
        })
        .map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_default_config() {
        let policy = RecoveryPolicy::from_config(&RecoveryConfig::default()).unwrap();
        assert_eq!(policy.data_slot.index(), 0);
        assert_eq!(policy.probe_slot.index(), 1);
        assert_eq!(policy.connect_timeout, Duration::from_secs(10));
        assert_eq!(policy.link_wait, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.local_port, 50000);
    }

    #[test]
    fn test_policy_rejects_shared_slot() {
        let config = RecoveryConfig {
            probe_slot: 0,
            ..RecoveryConfig::default()
        };
        assert!(RecoveryPolicy::from_config(&config).is_err());
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            FailureKind::classify(&LinkError::NotConnected),
            None
        );
        assert_eq!(
            FailureKind::classify(&LinkError::ResponseTimeout {
                transaction_id: 1,
                elapsed_ms: 1,
                buffered: 0
            }),
            Some(FailureKind::Transport)
        );
    }
}
