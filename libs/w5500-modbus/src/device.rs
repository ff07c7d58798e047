//! W5500 device handle
//!
//! Owns the bus and clock, and provides typed access to the common register
//! block: chip bring-up, network identity, retry settings and PHY state.
//! Socket-level operations live in `socket.rs` and buffer movement in
//! `ring.rs`, both as further `impl W5500` blocks.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::clock::{poll_until, Clock, SystemClock};
use crate::config::{BufferConfig, MacAddress, NetworkConfig};
use crate::error::{LinkError, Result};
use crate::registers::{
    common, mode, phy, SocketCommand, SocketSlot, CHIP_VERSION, COMMON_BLOCK, NUM_SOCKETS,
};

const VERSION_ATTEMPTS: u32 = 5;
const VERSION_RETRY_DELAY: Duration = Duration::from_millis(50);
const RESET_TIMEOUT: Duration = Duration::from_millis(100);

/// Timing budgets for socket-level polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTiming {
    /// How long a command may sit in Sn_CR before it counts as stuck
    pub command_budget: Duration,
    pub command_poll: Duration,
    /// How long a closed socket may take to report CLOSED
    pub close_settle: Duration,
    pub connect_poll: Duration,
    /// How long a send may wait for TX free space
    pub tx_free_timeout: Duration,
}

impl Default for SocketTiming {
    fn default() -> Self {
        Self {
            command_budget: Duration::from_millis(500),
            command_poll: Duration::from_millis(10),
            close_settle: Duration::from_millis(100),
            connect_poll: Duration::from_millis(100),
            tx_free_timeout: Duration::from_millis(500),
        }
    }
}

/// Decoded PHYCFGR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhyStatus {
    pub link_up: bool,
    pub speed_100: bool,
    pub full_duplex: bool,
    pub raw: u8,
}

impl PhyStatus {
    pub const fn from_register(raw: u8) -> Self {
        Self {
            link_up: raw & phy::LINK != 0,
            speed_100: raw & phy::SPEED_100 != 0,
            full_duplex: raw & phy::FULL_DUPLEX != 0,
            raw,
        }
    }
}

/// W5500 chip behind a [`Bus`]
pub struct W5500<B: Bus, C: Clock = SystemClock> {
    bus: B,
    clock: C,
    timing: SocketTiming,
    last_command: [Option<SocketCommand>; NUM_SOCKETS as usize],
}

impl<B: Bus> W5500<B, SystemClock> {
    pub fn new(bus: B) -> Self {
        Self::with_clock(bus, SystemClock::new())
    }
}

impl<B: Bus, C: Clock> W5500<B, C> {
    pub fn with_clock(bus: B, clock: C) -> Self {
        Self {
            bus,
            clock,
            timing: SocketTiming::default(),
            last_command: [None; NUM_SOCKETS as usize],
        }
    }

    pub fn with_timing(mut self, timing: SocketTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn timing(&self) -> &SocketTiming {
        &self.timing
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    pub fn last_command(&self, slot: SocketSlot) -> Option<SocketCommand> {
        self.last_command[usize::from(slot.index())]
    }

    pub(crate) fn record_command(&mut self, slot: SocketSlot, command: SocketCommand) {
        self.last_command[usize::from(slot.index())] = Some(command);
    }

    // ========================================================================
    // Raw register access
    // ========================================================================

    pub fn read_bytes(&mut self, addr: u16, block: u8, len: usize) -> Result<Vec<u8>> {
        let data = self.bus.read(addr, block, len)?;
        if data.len() != len {
            return Err(LinkError::bus(format!(
                "short read at {:04X}/{:02X}: {}B of {}B",
                addr,
                block,
                data.len(),
                len
            )));
        }
        Ok(data)
    }

    pub fn write_bytes(&mut self, addr: u16, block: u8, data: &[u8]) -> Result<()> {
        self.bus.write(addr, block, data)
    }

    pub fn read_u8(&mut self, addr: u16, block: u8) -> Result<u8> {
        let data = self.read_bytes(addr, block, 1)?;
        Ok(data[0])
    }

    pub fn write_u8(&mut self, addr: u16, block: u8, value: u8) -> Result<()> {
        self.write_bytes(addr, block, &[value])
    }

    pub fn read_u16(&mut self, addr: u16, block: u8) -> Result<u16> {
        let data = self.read_bytes(addr, block, 2)?;
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    pub fn write_u16(&mut self, addr: u16, block: u8, value: u16) -> Result<()> {
        self.write_bytes(addr, block, &value.to_be_bytes())
    }

    fn read_ipv4(&mut self, addr: u16) -> Result<Ipv4Addr> {
        let data = self.read_bytes(addr, COMMON_BLOCK, 4)?;
        Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
    }

    // ========================================================================
    // Bring-up
    // ========================================================================

    pub fn version(&mut self) -> Result<u8> {
        self.read_u8(common::VERSIONR, COMMON_BLOCK)
    }

    /// Resets every register to its power-on value
    pub fn software_reset(&mut self) -> Result<()> {
        self.write_u8(common::MR, COMMON_BLOCK, mode::RST)?;
        let clock = self.clock.clone();
        let poll = self.timing.command_poll;
        let done = poll_until(&clock, RESET_TIMEOUT, poll, || {
            Ok((self.read_u8(common::MR, COMMON_BLOCK)? & mode::RST == 0).then_some(()))
        })?;
        if done.is_none() {
            return Err(LinkError::bus("software reset did not complete"));
        }
        self.last_command = [None; NUM_SOCKETS as usize];
        debug!("Chip reset");
        Ok(())
    }

    fn verify_version(&mut self) -> Result<()> {
        let mut version = 0;
        for attempt in 1..=VERSION_ATTEMPTS {
            version = self.version()?;
            if version == CHIP_VERSION {
                return Ok(());
            }
            warn!(
                "Chip version 0x{:02X}, attempt {}/{}",
                version, attempt, VERSION_ATTEMPTS
            );
            self.clock.sleep(VERSION_RETRY_DELAY);
        }
        Err(LinkError::UnexpectedVersion(version))
    }

    /// Resets the chip and programs network identity, retries and buffers
    pub fn initialize(&mut self, network: &NetworkConfig, buffers: &BufferConfig) -> Result<()> {
        buffers.validate()?;
        self.software_reset()?;
        self.verify_version()?;

        self.set_mac(network.mac)?;
        self.set_gateway(network.gateway)?;
        self.set_subnet(network.subnet)?;
        self.set_ip(network.ip)?;
        self.set_retry_time(network.retry_time_units())?;
        self.set_retry_count(network.retry_count)?;
        self.configure_buffers(buffers)?;
        self.set_force_arp(network.force_arp)?;

        info!(
            "W5500 up: {} mac={} gw={} rtr={}ms rcr={}",
            network.ip, network.mac, network.gateway, network.retry_time_ms, network.retry_count
        );
        Ok(())
    }

    // ========================================================================
    // Network identity
    // ========================================================================

    pub fn set_mac(&mut self, mac: MacAddress) -> Result<()> {
        self.write_bytes(common::SHAR, COMMON_BLOCK, &mac.octets())
    }

    pub fn mac(&mut self) -> Result<MacAddress> {
        let data = self.read_bytes(common::SHAR, COMMON_BLOCK, 6)?;
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&data);
        Ok(MacAddress(octets))
    }

    pub fn set_ip(&mut self, ip: Ipv4Addr) -> Result<()> {
        self.write_bytes(common::SIPR, COMMON_BLOCK, &ip.octets())
    }

    pub fn ip(&mut self) -> Result<Ipv4Addr> {
        self.read_ipv4(common::SIPR)
    }

    pub fn set_subnet(&mut self, subnet: Ipv4Addr) -> Result<()> {
        self.write_bytes(common::SUBR, COMMON_BLOCK, &subnet.octets())
    }

    pub fn subnet(&mut self) -> Result<Ipv4Addr> {
        self.read_ipv4(common::SUBR)
    }

    pub fn set_gateway(&mut self, gateway: Ipv4Addr) -> Result<()> {
        self.write_bytes(common::GAR, COMMON_BLOCK, &gateway.octets())
    }

    pub fn gateway(&mut self) -> Result<Ipv4Addr> {
        self.read_ipv4(common::GAR)
    }

    /// RTR in 100us units
    pub fn set_retry_time(&mut self, units: u16) -> Result<()> {
        self.write_u16(common::RTR, COMMON_BLOCK, units)
    }

    pub fn retry_time(&mut self) -> Result<u16> {
        self.read_u16(common::RTR, COMMON_BLOCK)
    }

    pub fn set_retry_count(&mut self, count: u8) -> Result<()> {
        self.write_u8(common::RCR, COMMON_BLOCK, count)
    }

    pub fn retry_count(&mut self) -> Result<u8> {
        self.read_u8(common::RCR, COMMON_BLOCK)
    }

    // ========================================================================
    // Mode and PHY
    // ========================================================================

    pub fn set_force_arp(&mut self, enabled: bool) -> Result<()> {
        let current = self.read_u8(common::MR, COMMON_BLOCK)?;
        let updated = if enabled {
            current | mode::FARP
        } else {
            current & !mode::FARP
        };
        // RST must never be written back
        self.write_u8(common::MR, COMMON_BLOCK, updated & !mode::RST)?;
        debug!("FARP {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    pub fn force_arp(&mut self) -> Result<bool> {
        Ok(self.read_u8(common::MR, COMMON_BLOCK)? & mode::FARP != 0)
    }

    pub fn phy_status(&mut self) -> Result<PhyStatus> {
        Ok(PhyStatus::from_register(
            self.read_u8(common::PHYCFGR, COMMON_BLOCK)?,
        ))
    }

    pub fn link_up(&mut self) -> Result<bool> {
        Ok(self.phy_status()?.link_up)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::SimulatedW5500;

    fn device() -> (SimulatedW5500, W5500<SimulatedW5500, ManualClock>) {
        let clock = ManualClock::new();
        let sim = SimulatedW5500::new(clock.clone());
        let device = W5500::with_clock(sim.clone(), clock);
        (sim, device)
    }

    #[test]
    fn test_initialize_programs_network() {
        let (_sim, mut dev) = device();
        let network = NetworkConfig::default();
        dev.initialize(&network, &BufferConfig::default()).unwrap();

        assert_eq!(dev.version().unwrap(), CHIP_VERSION);
        assert_eq!(dev.mac().unwrap(), network.mac);
        assert_eq!(dev.ip().unwrap(), network.ip);
        assert_eq!(dev.subnet().unwrap(), network.subnet);
        assert_eq!(dev.gateway().unwrap(), network.gateway);
        assert_eq!(dev.retry_time().unwrap(), 5000);
        assert_eq!(dev.retry_count().unwrap(), 10);
        assert!(dev.force_arp().unwrap());
    }

    #[test]
    fn test_initialize_rejects_wrong_version() {
        let (sim, mut dev) = device();
        sim.set_version(0x51);
        let err = dev
            .initialize(&NetworkConfig::default(), &BufferConfig::default())
            .unwrap_err();
        assert!(matches!(err, LinkError::UnexpectedVersion(0x51)));
    }

    #[test]
    fn test_force_arp_preserves_other_bits() {
        let (_sim, mut dev) = device();
        dev.write_u8(common::MR, COMMON_BLOCK, 0x10).unwrap();
        dev.set_force_arp(true).unwrap();
        assert_eq!(dev.read_u8(common::MR, COMMON_BLOCK).unwrap(), 0x12);
        dev.set_force_arp(false).unwrap();
        assert_eq!(dev.read_u8(common::MR, COMMON_BLOCK).unwrap(), 0x10);
    }

    #[test]
    fn test_phy_status_decoding() {
        let status = PhyStatus::from_register(0b0000_0111);
        assert!(status.link_up && status.speed_100 && status.full_duplex);

        let (sim, mut dev) = device();
        assert!(dev.link_up().unwrap());
        sim.set_link(false);
        assert!(!dev.link_up().unwrap());
    }

    #[test]
    fn test_bus_timeout_propagates() {
        let (sim, mut dev) = device();
        sim.set_bus_timeout(true);
        let err = dev.version().unwrap_err();
        assert!(matches!(
            err,
            LinkError::BusTimeout {
                addr: common::VERSIONR,
                block: COMMON_BLOCK
            }
        ));
    }
}
