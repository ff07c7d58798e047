//! plcprobe - W5500 Modbus TCP link tool
//!
//! Reads and writes PLC registers through a W5500 offload chip, dumps the
//! chip's socket table and runs a bring-up health check. `--simulate` runs
//! the same code against the in-process chip model.

mod doctor;
mod settings;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use common::hex;
use tracing::{debug, info, warn};
use w5500_modbus::sim::{ModbusPeer, SimulatedW5500};
use w5500_modbus::{Bus, Clock, LinkConfig, ManualClock, SocketSlot, Supervisor, W5500};

use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "plcprobe")]
#[command(about = "W5500 Modbus TCP link probe")]
#[command(long_about = "W5500 Modbus TCP link probe

Talks Modbus TCP to a PLC through a W5500 hardware TCP/IP chip on SPI.
Register reads and writes go through the recovering supervisor, so a
dropped link is re-established before the command gives up.

Examples:
  plcprobe --simulate read-holding 0 10
  plcprobe -c link.toml write-single 0x0010 1234
  plcprobe -c link.toml doctor --json")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (toml, yaml or json); PLCLINK_* variables override it
    #[arg(short, long, global = true, env = "PLCPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging and wire dumps
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Run against the simulated chip instead of SPI hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// SPI device node (needs the `spidev` feature)
    #[arg(long, global = true, default_value = "/dev/spidev0.0")]
    spi: PathBuf,

    /// SPI clock in Hz
    #[arg(long, global = true, default_value_t = 8_000_000)]
    spi_speed: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Read holding registers (FC03)
    ReadHolding {
        #[arg(value_parser = parse_register)]
        address: u16,
        #[arg(value_parser = parse_register)]
        count: u16,
    },

    /// Read input registers (FC04)
    ReadInput {
        #[arg(value_parser = parse_register)]
        address: u16,
        #[arg(value_parser = parse_register)]
        count: u16,
    },

    /// Write one holding register (FC06)
    WriteSingle {
        #[arg(value_parser = parse_register)]
        address: u16,
        #[arg(value_parser = parse_register)]
        value: u16,
    },

    /// Write consecutive holding registers (FC16)
    WriteMultiple {
        #[arg(value_parser = parse_register)]
        address: u16,
        #[arg(required = true, num_args = 1.., value_parser = parse_register)]
        values: Vec<u16>,
    },

    /// Dump the register state of all 8 sockets
    Sockets {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Chip, PHY, network, ARP and connect checks
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Accepts decimal, `0x` prefixed or `h` suffixed values
fn parse_register(text: &str) -> std::result::Result<u16, String> {
    hex::parse_u16(text)
        .ok_or_else(|| format!("'{}' is not a 16-bit value (1234, 0x04D2 or 04D2h)", text))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure colored output
    if cli.no_color {
        colored::control::set_override(false);
    }

    let settings = settings::load(cli.config.as_deref())?;

    let mut logging = settings.logging.clone();
    if cli.verbose {
        logging = logging.with_level("debug");
    }
    if cli.no_color {
        logging.ansi = false;
    }
    common::init_logging(&logging)?;

    if cli.simulate {
        run_simulated(&cli, &settings)
    } else {
        run_hardware(&cli, &settings)
    }
}

/// Holding registers 0..16 read 100..116, input registers 0..16 read 0x4000..
fn simulated_chip(clock: &ManualClock) -> SimulatedW5500 {
    let sim = SimulatedW5500::new(clock.clone());
    let peer = ModbusPeer::new();
    let holding: Vec<u16> = (100..116).collect();
    let input: Vec<u16> = (0x4000..0x4010).collect();
    peer.set_holding(0, &holding);
    peer.set_input(0, &input);
    sim.set_peer(peer);
    sim
}

fn run_simulated(cli: &Cli, settings: &Settings) -> Result<()> {
    let clock = ManualClock::new();
    let sim = simulated_chip(&clock);
    info!("Simulated W5500, peer {}", settings.link.peer.socket_addr());

    let result = run(cli, &settings.link, W5500::with_clock(sim.clone(), clock));

    if cli.verbose {
        for frame in sim.tcp_sent() {
            println!("{} {}", "TX".bright_blue(), hex::dump(&frame, 64));
        }
    }
    result
}

#[cfg(all(feature = "spidev", target_os = "linux"))]
fn run_hardware(cli: &Cli, settings: &Settings) -> Result<()> {
    use w5500_modbus::bus::spi::SpidevBus;

    let bus = SpidevBus::open(&cli.spi, cli.spi_speed)?;
    run(cli, &settings.link, W5500::new(bus))
}

#[cfg(not(all(feature = "spidev", target_os = "linux")))]
fn run_hardware(cli: &Cli, _settings: &Settings) -> Result<()> {
    anyhow::bail!(
        "built without SPI support, cannot open {}; rebuild with --features spidev or pass --simulate",
        cli.spi.display()
    )
}

fn run<B: Bus, C: Clock>(cli: &Cli, link: &LinkConfig, mut device: W5500<B, C>) -> Result<()> {
    match &cli.command {
        Commands::ReadHolding { address, count } => session(device, link, |s| {
            let values = s.read_holding_registers(*address, *count)?;
            print_registers(*address, &values);
            Ok(())
        }),
        Commands::ReadInput { address, count } => session(device, link, |s| {
            let values = s.read_input_registers(*address, *count)?;
            print_registers(*address, &values);
            Ok(())
        }),
        Commands::WriteSingle { address, value } => session(device, link, |s| {
            s.write_single_register(*address, *value)?;
            print_written(*address, 1);
            Ok(())
        }),
        Commands::WriteMultiple { address, values } => session(device, link, |s| {
            s.write_multiple_registers(*address, values)?;
            print_written(*address, values.len());
            Ok(())
        }),
        Commands::Sockets { json } => show_sockets(&mut device, *json),
        Commands::Doctor { json } => doctor::run_doctor(device, link, cli.verbose, *json),
    }
}

/// Brings the chip up, connects, runs `op` and disconnects
fn session<B, C, F>(mut device: W5500<B, C>, link: &LinkConfig, op: F) -> Result<()>
where
    B: Bus,
    C: Clock,
    F: FnOnce(&mut Supervisor<B, C>) -> w5500_modbus::Result<()>,
{
    device.initialize(&link.network, &link.buffers)?;
    let mut supervisor = Supervisor::from_config(device, link)?;
    supervisor.connect(link.peer.socket_addr(), link.recovery.connect_timeout())?;

    let outcome = op(&mut supervisor);

    if let Err(e) = supervisor.disconnect() {
        warn!("Disconnect failed: {}", e);
    }
    debug!("Link stats: {}", serde_json::to_string(supervisor.stats())?);
    Ok(outcome?)
}

fn print_registers(address: u16, values: &[u16]) {
    println!("{}", format!("{:>7}  {:>6}  {:>6}", "Address", "Value", "Hex").bright_cyan());
    for (offset, value) in values.iter().enumerate() {
        let register = u32::from(address) + offset as u32;
        println!("{:>7}  {:>6}  0x{:04X}", register, value, value);
    }
}

fn print_written(address: u16, count: usize) {
    println!(
        "{} Wrote {} register(s) at {}",
        "✓".green(),
        count,
        address.to_string().bright_yellow()
    );
}

/// Reads socket registers without touching chip configuration
fn show_sockets<B: Bus, C: Clock>(device: &mut W5500<B, C>, json: bool) -> Result<()> {
    let sockets = SocketSlot::all()
        .map(|slot| device.inspect(slot))
        .collect::<w5500_modbus::Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sockets)?);
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<4} {:<6} {:<12} {:>6}  {:<21} {:>6} {:>6}",
            "Slot", "Mode", "Status", "Port", "Peer", "TxFree", "RxSize"
        )
        .bright_cyan()
    );
    for info in &sockets {
        let status = info.status.to_string();
        let status = if info.status == w5500_modbus::SocketStatus::Established {
            status.green()
        } else {
            status.normal()
        };
        println!(
            "{:<4} {:<6} {:<12} {:>6}  {:<21} {:>6} {:>6}",
            info.slot,
            info.mode.to_string(),
            status,
            info.local_port,
            info.peer.to_string(),
            info.tx_free,
            info.rx_received
        );
    }
    Ok(())
}
