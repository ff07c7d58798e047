//! Bus transaction primitive
//!
//! The chip is addressed by a 16-bit offset plus a block-select byte. A [`Bus`]
//! moves raw bytes at that address; everything above it is register logic.

use crate::error::Result;

#[cfg(all(feature = "spidev", target_os = "linux"))]
pub mod spi;

/// Read/write access to the W5500 address space
pub trait Bus {
    /// Reads `len` bytes starting at `addr` in `block`
    fn read(&mut self, addr: u16, block: u8, len: usize) -> Result<Vec<u8>>;

    /// Writes `data` starting at `addr` in `block`
    fn write(&mut self, addr: u16, block: u8, data: &[u8]) -> Result<()>;
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn read(&mut self, addr: u16, block: u8, len: usize) -> Result<Vec<u8>> {
        (**self).read(addr, block, len)
    }

    fn write(&mut self, addr: u16, block: u8, data: &[u8]) -> Result<()> {
        (**self).write(addr, block, data)
    }
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn read(&mut self, addr: u16, block: u8, len: usize) -> Result<Vec<u8>> {
        (**self).read(addr, block, len)
    }

    fn write(&mut self, addr: u16, block: u8, data: &[u8]) -> Result<()> {
        (**self).write(addr, block, data)
    }
}

const RWB_WRITE: u8 = 0x04;
// Variable data length mode, chip select framed by the host
const OM_VDM: u8 = 0x00;

/// SPI control phase byte: `bsb << 3 | rwb << 2 | om`
pub const fn control_byte(block: u8, write: bool) -> u8 {
    let rwb = if write { RWB_WRITE } else { 0 };
    (block << 3) | rwb | OM_VDM
}

/// Address and control phases preceding the data phase of an SPI frame
pub const fn frame_header(addr: u16, block: u8, write: bool) -> [u8; 3] {
    let [hi, lo] = addr.to_be_bytes();
    [hi, lo, control_byte(block, write)]
}
