//! Linux spidev backend

use std::io::Write;
use std::path::Path;

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use tracing::{info, trace};

use super::{frame_header, Bus};
use crate::error::{LinkError, Result};

/// Default SPI clock, comfortably below the chip's 80 MHz limit
pub const DEFAULT_SPEED_HZ: u32 = 8_000_000;

/// W5500 attached to a `/dev/spidevB.C` node
pub struct SpidevBus {
    spi: Spidev,
}

impl SpidevBus {
    pub fn open(path: impl AsRef<Path>, speed_hz: u32) -> Result<Self> {
        let path = path.as_ref();
        let mut spi = Spidev::open(path)
            .map_err(|e| LinkError::bus(format!("open {}: {}", path.display(), e)))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.configure(&options)
            .map_err(|e| LinkError::bus(format!("configure {}: {}", path.display(), e)))?;
        info!("SPI open: {} @ {}Hz", path.display(), speed_hz);
        Ok(Self { spi })
    }
}

impl Bus for SpidevBus {
    fn read(&mut self, addr: u16, block: u8, len: usize) -> Result<Vec<u8>> {
        let header = frame_header(addr, block, false);
        let mut data = vec![0u8; len];
        {
            let mut transfers = [SpidevTransfer::write(&header), SpidevTransfer::read(&mut data)];
            self.spi.transfer_multiple(&mut transfers)?;
        }
        trace!("SPI RD {:04X}/{:02X}: {}B", addr, block, len);
        Ok(data)
    }

    fn write(&mut self, addr: u16, block: u8, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(3 + data.len());
        frame.extend_from_slice(&frame_header(addr, block, true));
        frame.extend_from_slice(data);
        self.spi.write_all(&frame)?;
        trace!("SPI WR {:04X}/{:02X}: {}B", addr, block, data.len());
        Ok(())
    }
}
