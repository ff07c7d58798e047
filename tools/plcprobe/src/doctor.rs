//! Health check and diagnostics for a W5500 Modbus link

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use colored::*;
use serde::Serialize;
use w5500_modbus::registers::CHIP_VERSION;
use w5500_modbus::{Bus, Clock, LinkConfig, MacAddress, Supervisor, W5500};

/// Check result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

/// Single check result
#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl CheckResult {
    fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            message: message.into(),
            suggestion: None,
            duration_ms: None,
        }
    }

    fn warning(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warning,
            message: message.into(),
            suggestion: Some(suggestion.into()),
            duration_ms: None,
        }
    }

    fn error(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            message: message.into(),
            suggestion: Some(suggestion.into()),
            duration_ms: None,
        }
    }

    fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Run all health checks, exit 1 if any failed
pub fn run_doctor<B: Bus, C: Clock>(
    device: W5500<B, C>,
    link: &LinkConfig,
    verbose: bool,
    json_output: bool,
) -> Result<()> {
    let results = collect_checks(device, link);

    if json_output {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results, verbose);
    }

    let has_errors = results.iter().any(|r| r.status == CheckStatus::Error);
    if has_errors {
        std::process::exit(1);
    }

    Ok(())
}

/// Checks run in bring-up order; a failed chip check ends the run early
pub fn collect_checks<B: Bus, C: Clock>(
    mut device: W5500<B, C>,
    link: &LinkConfig,
) -> Vec<CheckResult> {
    let clock = device.clock().clone();
    let mut results = Vec::new();

    let start = clock.now();
    let version = check_version(&mut device).with_duration(clock.now() - start);
    let chip_ok = version.status == CheckStatus::Ok;
    results.push(version);
    if !chip_ok {
        return results;
    }

    if let Err(e) = device.initialize(&link.network, &link.buffers) {
        results.push(CheckResult::error(
            "Bring-up",
            e.to_string(),
            "Power-cycle the module and check the reset line",
        ));
        return results;
    }

    results.push(check_phy(&mut device));
    results.push(check_network(&mut device, link));

    let mut supervisor = match Supervisor::from_config(device, link) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            results.push(CheckResult::error(
                "Supervisor",
                e.to_string(),
                "Fix the [recovery] section of the config",
            ));
            return results;
        },
    };
    let peer = link.peer.socket_addr();

    let start = clock.now();
    let arp = match supervisor.arp_probe(peer) {
        Ok(()) => CheckResult::ok("ARP probe", format!("{} answered", peer.ip())),
        Err(e) => CheckResult::error(
            "ARP probe",
            e.to_string(),
            "Check the peer IP, subnet and gateway",
        ),
    };
    results.push(arp.with_duration(clock.now() - start));

    let start = clock.now();
    let connect = match supervisor.connect(peer, link.recovery.connect_timeout()) {
        Ok(()) => {
            let result = CheckResult::ok("Modbus connect", format!("Connected to {}", peer));
            if let Err(e) = supervisor.disconnect() {
                tracing::warn!("Disconnect after check: {}", e);
            }
            result
        },
        Err(e) => CheckResult::error(
            "Modbus connect",
            e.to_string(),
            format!("Check that the server listens on port {}", peer.port()),
        ),
    };
    results.push(connect.with_duration(clock.now() - start));

    results
}

fn check_version<B: Bus, C: Clock>(device: &mut W5500<B, C>) -> CheckResult {
    match device.version() {
        Ok(CHIP_VERSION) => {
            CheckResult::ok("Chip version", format!("W5500 (0x{:02X})", CHIP_VERSION))
        },
        Ok(other) => CheckResult::error(
            "Chip version",
            format!("Unexpected 0x{:02X}", other),
            "Check SPI wiring, mode 0 and chip select",
        ),
        Err(e) => CheckResult::error(
            "Chip version",
            e.to_string(),
            "Check the SPI device path and permissions",
        ),
    }
}

fn check_phy<B: Bus, C: Clock>(device: &mut W5500<B, C>) -> CheckResult {
    match device.phy_status() {
        Ok(phy) if phy.link_up => CheckResult::ok(
            "PHY link",
            format!(
                "Up, {} {}",
                if phy.speed_100 { "100M" } else { "10M" },
                if phy.full_duplex { "full duplex" } else { "half duplex" }
            ),
        ),
        Ok(_) => CheckResult::error("PHY link", "Down", "Check the cable and switch port"),
        Err(e) => CheckResult::error("PHY link", e.to_string(), "Check the SPI connection"),
    }
}

fn read_network<B: Bus, C: Clock>(
    device: &mut W5500<B, C>,
) -> w5500_modbus::Result<(MacAddress, Ipv4Addr, Ipv4Addr, Ipv4Addr)> {
    Ok((device.mac()?, device.ip()?, device.subnet()?, device.gateway()?))
}

fn check_network<B: Bus, C: Clock>(device: &mut W5500<B, C>, link: &LinkConfig) -> CheckResult {
    let expected = &link.network;
    match read_network(device) {
        Ok((mac, ip, subnet, gateway)) => {
            let summary = format!(
                "{} {}/{} gw {}",
                mac,
                ip,
                u32::from(subnet).count_ones(),
                gateway
            );
            if mac == expected.mac
                && ip == expected.ip
                && subnet == expected.subnet
                && gateway == expected.gateway
            {
                CheckResult::ok("Network", summary)
            } else {
                CheckResult::warning(
                    "Network",
                    format!("Read back {}", summary),
                    "Registers differ from the config, the chip may have reset",
                )
            }
        },
        Err(e) => CheckResult::error("Network", e.to_string(), "Check the SPI connection"),
    }
}

/// Print results in a table
fn print_results(results: &[CheckResult], verbose: bool) {
    println!();
    println!(
        "{}",
        "┌─────────────────────────────────────────────────────────┐".bright_blue()
    );
    println!(
        "{}",
        "│             W5500 Modbus Link Health Check              │".bright_blue()
    );
    println!(
        "{}",
        "├─────────────────────────────────────────────────────────┤".bright_blue()
    );

    for result in results {
        let icon = match result.status {
            CheckStatus::Ok => "✓".green(),
            CheckStatus::Warning => "⚠".yellow(),
            CheckStatus::Error => "✗".red(),
        };

        let name = format!("{:<16}", result.name);
        let message = match (verbose, result.duration_ms) {
            (true, Some(ms)) => format!("{} ({}ms)", result.message, ms),
            _ => result.message.clone(),
        };

        println!("│ {} {} {:<37} │", icon, name, message);

        if let Some(ref suggestion) = result.suggestion {
            println!("│   {} {:<52} │", "→".cyan(), suggestion.dimmed());
        }
    }

    println!(
        "{}",
        "├─────────────────────────────────────────────────────────┤".bright_blue()
    );

    let ok_count = results
        .iter()
        .filter(|r| r.status == CheckStatus::Ok)
        .count();
    let total = results.len();
    let summary = format!("{}/{} checks passed", ok_count, total);

    let summary_colored = if ok_count == total {
        summary.green()
    } else if ok_count + 1 >= total {
        summary.yellow()
    } else {
        summary.red()
    };

    println!("│ {:<55} │", summary_colored);
    println!(
        "{}",
        "└─────────────────────────────────────────────────────────┘".bright_blue()
    );
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use w5500_modbus::sim::{ConnectBehavior, SimulatedW5500};
    use w5500_modbus::ManualClock;

    fn chip() -> (SimulatedW5500, W5500<SimulatedW5500, ManualClock>) {
        let clock = ManualClock::new();
        let sim = SimulatedW5500::new(clock.clone());
        let device = W5500::with_clock(sim.clone(), clock);
        (sim, device)
    }

    fn statuses(results: &[CheckResult]) -> Vec<(&str, CheckStatus)> {
        results
            .iter()
            .map(|r| (r.name.as_str(), r.status))
            .collect()
    }

    #[test]
    fn test_healthy_link_passes_every_check() {
        let (_sim, device) = chip();
        let results = collect_checks(device, &LinkConfig::default());
        assert_eq!(
            statuses(&results),
            vec![
                ("Chip version", CheckStatus::Ok),
                ("PHY link", CheckStatus::Ok),
                ("Network", CheckStatus::Ok),
                ("ARP probe", CheckStatus::Ok),
                ("Modbus connect", CheckStatus::Ok),
            ]
        );
        assert_eq!(results[2].message, "02:08:dc:ab:cd:29 192.168.123.29/24 gw 192.168.123.1");
    }

    #[test]
    fn test_wrong_chip_stops_early() {
        let (sim, device) = chip();
        sim.set_version(0x51);
        let results = collect_checks(device, &LinkConfig::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CheckStatus::Error);
        assert_eq!(results[0].message, "Unexpected 0x51");
    }

    #[test]
    fn test_refused_connect_reported() {
        let (sim, device) = chip();
        sim.set_connect_behavior(ConnectBehavior::Refuse);
        let results = collect_checks(device, &LinkConfig::default());
        let last = results.last().unwrap();
        assert_eq!(last.name, "Modbus connect");
        assert_eq!(last.status, CheckStatus::Error);
        assert!(last.message.contains("Connect failed after 3 attempts"));
        assert_eq!(last.suggestion.as_deref(), Some("Check that the server listens on port 502"));
    }

    #[test]
    fn test_unreachable_peer_fails_arp_probe() {
        let (sim, device) = chip();
        sim.set_arp_reachable(false);
        sim.set_connect_behavior(ConnectBehavior::ArpTimeout);
        let results = collect_checks(device, &LinkConfig::default());
        assert_eq!(results[3].name, "ARP probe");
        assert_eq!(results[3].status, CheckStatus::Error);
        assert!(results[3].message.starts_with("ARP unreachable: 192.168.123.10"));
        assert_eq!(results[4].status, CheckStatus::Error);
    }

    #[test]
    fn test_json_shape() {
        let result = CheckResult::ok("PHY link", "Up, 100M full duplex");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json.get("suggestion").is_none());
    }
}
