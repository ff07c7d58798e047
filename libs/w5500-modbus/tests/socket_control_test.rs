//! Socket control tests against the simulated chip
//!
//! Bring-up, open/connect outcomes and fault paths of the per-slot command
//! state machine.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tracing_test::traced_test;
use w5500_modbus::registers::{common, mode};
use w5500_modbus::sim::{ConnectBehavior, SimulatedW5500};
use w5500_modbus::{
    BufferConfig, Clock, ConnectOutcome, LinkError, ManualClock, NetworkConfig, SocketCommand,
    SocketMode, SocketSlot, SocketStatus, W5500,
};

fn chip() -> (SimulatedW5500, W5500<SimulatedW5500, ManualClock>) {
    let clock = ManualClock::new();
    let sim = SimulatedW5500::new(clock.clone());
    let mut device = W5500::with_clock(sim.clone(), clock);
    device
        .initialize(&NetworkConfig::default(), &BufferConfig::default())
        .unwrap();
    (sim, device)
}

fn slot(index: u8) -> SocketSlot {
    SocketSlot::new(index).unwrap()
}

fn plc() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(192, 168, 123, 10), 502)
}

// ============================================================================
// Bring-up
// ============================================================================

#[test]
fn test_initialize_enables_force_arp() {
    let (sim, mut dev) = chip();
    assert!(dev.force_arp().unwrap());
    assert_eq!(sim.common_register(common::MR) & mode::FARP, mode::FARP);
    assert_eq!(sim.common_register(common::MR) & mode::RST, 0);
}

#[test]
fn test_initialize_rejects_wrong_chip() {
    let clock = ManualClock::new();
    let sim = SimulatedW5500::new(clock.clone());
    sim.set_version(0x51);
    let mut dev = W5500::with_clock(sim, clock);
    let err = dev
        .initialize(&NetworkConfig::default(), &BufferConfig::default())
        .unwrap_err();
    assert!(matches!(err, LinkError::UnexpectedVersion(0x51)));
    assert!(err.is_fatal());
}

#[test]
fn test_bus_timeout_is_fatal() {
    let (sim, mut dev) = chip();
    sim.set_bus_timeout(true);
    let err = dev.status(slot(0)).unwrap_err();
    assert!(matches!(err, LinkError::BusTimeout { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_phy_status_follows_link() {
    let (sim, mut dev) = chip();
    let phy = dev.phy_status().unwrap();
    assert!(phy.link_up && phy.speed_100 && phy.full_duplex);

    sim.set_link(false);
    assert!(!dev.link_up().unwrap());
}

// ============================================================================
// Connect outcomes
// ============================================================================

#[test]
fn test_connect_then_inspect() {
    let (_sim, mut dev) = chip();
    dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
    let outcome = dev
        .connect(slot(0), plc(), Duration::from_secs(10))
        .unwrap();
    assert_eq!(outcome, ConnectOutcome::Established);

    let info = dev.inspect(slot(0)).unwrap();
    assert_eq!(info.mode, SocketMode::Tcp);
    assert_eq!(info.status, SocketStatus::Established);
    assert_eq!(info.peer, plc());
    assert_eq!(info.tx_free, 2048);
    assert_eq!(info.rx_received, 0);
}

#[test]
fn test_refused_is_never_reported_as_timeout() {
    for timeout_ms in [100, 1_000, 10_000] {
        let (sim, mut dev) = chip();
        sim.set_connect_behavior(ConnectBehavior::Refuse);
        dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();

        let start = dev.clock().now();
        let timeout = Duration::from_millis(timeout_ms);
        let outcome = dev.connect(slot(0), plc(), timeout).unwrap();
        assert_eq!(outcome, ConnectOutcome::Refused);
        assert!(dev.clock().now() - start < timeout);
    }
}

#[test]
#[traced_test]
fn test_connect_timeout_logged() {
    let (sim, mut dev) = chip();
    sim.set_connect_behavior(ConnectBehavior::Silent);
    dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
    let outcome = dev.connect(slot(0), plc(), Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, ConnectOutcome::Timeout);
    assert!(logs_contain("TCP connect timeout"));
}

#[test]
fn test_connect_with_link_down_times_out() {
    let (sim, mut dev) = chip();
    sim.set_link(false);
    dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
    let outcome = dev.connect(slot(0), plc(), Duration::from_secs(5)).unwrap();
    assert_eq!(outcome, ConnectOutcome::Timeout);
}

#[test]
fn test_reopen_closes_first() {
    let (sim, mut dev) = chip();
    dev.open(slot(3), SocketMode::Tcp, 40000).unwrap();
    dev.open(slot(3), SocketMode::Udp, 40001).unwrap();
    assert_eq!(sim.socket_status(slot(3)), SocketStatus::Udp);
    assert_eq!(sim.command_count(3, SocketCommand::Close), 2);
    assert_eq!(sim.command_count(3, SocketCommand::Open), 2);
}

#[test]
fn test_command_timeout_carries_snapshot() {
    let (sim, mut dev) = chip();
    dev.open(slot(0), SocketMode::Tcp, 50000).unwrap();
    sim.set_stuck_command(true);

    let err = dev
        .connect(slot(0), plc(), Duration::from_secs(1))
        .unwrap_err();
    assert!(err.is_transport());
    let snapshot = err.snapshot().unwrap();
    assert_eq!(snapshot.slot, 0);
    assert_eq!(snapshot.status, SocketStatus::Init);
    assert_eq!(snapshot.last_command, Some(SocketCommand::Connect));
}
