//! Link configuration
//!
//! Serde model for everything a deployment tunes: chip network identity, the
//! Modbus peer, recovery timing and socket buffer sizes. Every field has a
//! default, so a partial file (or none at all) yields a usable config.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::registers::NUM_SOCKETS;

/// Buffer sizes the chip accepts, in KB
pub const VALID_BUFFER_KB: [u8; 6] = [0, 1, 2, 4, 8, 16];

/// Total buffer memory per direction, in KB
pub const BUFFER_MEMORY_KB: u32 = 16;

// ============================================================================
// MAC address
// ============================================================================

/// Hardware address, printed and parsed as `aa:bb:cc:dd:ee:ff`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for MacAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c: char| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| LinkError::config(format!("MAC address too short: {}", s)))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| LinkError::config(format!("invalid MAC octet '{}' in {}", part, s)))?;
        }
        if parts.next().is_some() {
            return Err(LinkError::config(format!("MAC address too long: {}", s)));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Chip network identity and TCP retransmission settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Retransmission timeout (RTR), 100us resolution on the chip
    pub retry_time_ms: u16,
    /// Retransmission count (RCR)
    pub retry_count: u8,
    /// Resolve the peer MAC before every send
    pub force_arp: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mac: MacAddress([0x02, 0x08, 0xDC, 0xAB, 0xCD, 0x29]),
            ip: Ipv4Addr::new(192, 168, 123, 29),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 123, 1),
            retry_time_ms: 500,
            retry_count: 10,
            force_arp: true,
        }
    }
}

impl NetworkConfig {
    /// RTR register value in 100us units
    pub fn retry_time_units(&self) -> u16 {
        self.retry_time_ms.saturating_mul(10)
    }
}

/// Modbus server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub unit_id: u8,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::new(192, 168, 123, 10),
            port: 502,
            unit_id: 1,
        }
    }
}

impl PeerConfig {
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

/// When the supervisor runs the UDP reachability probe before connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpProbeMode {
    Never,
    #[default]
    OnFailure,
    Always,
}

/// Connect/recovery timing and slot assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub link_wait_ms: u64,
    pub arp_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_attempts: u32,
    pub max_transaction_attempts: u32,
    pub arp_probe: ArpProbeMode,
    pub data_slot: u8,
    pub probe_slot: u8,
    pub local_port: u16,
    pub probe_port: u16,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            link_wait_ms: 5000,
            arp_timeout_ms: 5000,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 5000,
            max_attempts: 3,
            max_transaction_attempts: 2,
            arp_probe: ArpProbeMode::OnFailure,
            data_slot: 0,
            probe_slot: 1,
            local_port: 50000,
            probe_port: 50001,
        }
    }
}

impl RecoveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Per-socket TX/RX buffer sizes in KB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub tx_kb: [u8; 8],
    pub rx_kb: [u8; 8],
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::uniform(2)
    }
}

impl BufferConfig {
    pub const fn uniform(kb: u8) -> Self {
        Self {
            tx_kb: [kb; 8],
            rx_kb: [kb; 8],
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (direction, sizes) in [("tx", &self.tx_kb), ("rx", &self.rx_kb)] {
            if let Some(bad) = sizes.iter().find(|kb| !VALID_BUFFER_KB.contains(*kb)) {
                return Err(LinkError::config(format!(
                    "{} buffer size {}KB not in {:?}",
                    direction, bad, VALID_BUFFER_KB
                )));
            }
            let total: u32 = sizes.iter().map(|&kb| u32::from(kb)).sum();
            if total > BUFFER_MEMORY_KB {
                return Err(LinkError::config(format!(
                    "{} buffers total {}KB, chip has {}KB",
                    direction, total, BUFFER_MEMORY_KB
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete link configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub network: NetworkConfig,
    pub peer: PeerConfig,
    pub recovery: RecoveryConfig,
    pub buffers: BufferConfig,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        let recovery = &self.recovery;
        for (name, slot) in [
            ("data_slot", recovery.data_slot),
            ("probe_slot", recovery.probe_slot),
        ] {
            if slot >= NUM_SOCKETS {
                return Err(LinkError::config(format!(
                    "{} {} out of range 0..{}",
                    name, slot, NUM_SOCKETS
                )));
            }
        }
        if recovery.data_slot == recovery.probe_slot {
            return Err(LinkError::config(format!(
                "data_slot and probe_slot both {}",
                recovery.data_slot
            )));
        }
        if recovery.max_attempts == 0 || recovery.max_transaction_attempts == 0 {
            return Err(LinkError::config("attempt budgets must be at least 1"));
        }
        if self.network.retry_time_ms > u16::MAX / 10 {
            return Err(LinkError::config(format!(
                "retry_time_ms {} exceeds {}",
                self.network.retry_time_ms,
                u16::MAX / 10
            )));
        }
        self.buffers.validate()?;
        let data_slot = usize::from(recovery.data_slot);
        if self.buffers.tx_kb[data_slot] == 0 || self.buffers.rx_kb[data_slot] == 0 {
            return Err(LinkError::config("data slot has no buffer memory"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.retry_time_units(), 5000);
        assert_eq!(config.peer.socket_addr().to_string(), "192.168.123.10:502");
        assert_eq!(config.recovery.arp_probe, ArpProbeMode::OnFailure);
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "02:08:DC:ab:cd:29".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0x08, 0xDC, 0xAB, 0xCD, 0x29]);
        assert_eq!(mac.to_string(), "02:08:dc:ab:cd:29");
        assert!("02:08:dc:ab:cd".parse::<MacAddress>().is_err());
        assert!("02:08:dc:ab:cd:29:00".parse::<MacAddress>().is_err());
        assert!("02:08:dc:ab:cd:zz".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let json = serde_json::to_string(&MacAddress([1, 2, 3, 4, 5, 6])).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MacAddress([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{"peer": {"ip": "10.0.0.5"}, "recovery": {"arp_probe": "always"}}"#)
                .unwrap();
        assert_eq!(config.peer.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(config.peer.port, 502);
        assert_eq!(config.recovery.arp_probe, ArpProbeMode::Always);
        assert_eq!(config.recovery.max_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_bad_slots() {
        let mut config = LinkConfig::default();
        config.recovery.probe_slot = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.recovery.data_slot = 8;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.recovery.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_validation() {
        assert!(BufferConfig::uniform(2).validate().is_ok());
        assert!(BufferConfig::uniform(4).validate().is_err());
        assert!(BufferConfig::uniform(3).validate().is_err());

        let mut buffers = BufferConfig::uniform(0);
        buffers.tx_kb[0] = 16;
        buffers.rx_kb[0] = 8;
        buffers.rx_kb[1] = 8;
        assert!(buffers.validate().is_ok());
    }
}
