//! Ring buffer transport
//!
//! Moves bytes between the host and a socket's TX/RX buffer memory. The chip
//! exposes 16-bit free-running pointers; all offsets wrap modulo 65536 and a
//! transfer crossing 0xFFFF is split into two bus bursts.

use bytes::{Bytes, BytesMut};
use tracing::{debug, error};

use crate::bus::Bus;
use crate::clock::{poll_until, Clock};
use crate::config::BufferConfig;
use crate::device::W5500;
use crate::error::{LinkError, Result};
use crate::modbus::Transport;
use crate::registers::{socket, SocketCommand, SocketSlot, SocketStatus, NUM_SOCKETS};

/// Size of the 16-bit pointer space
pub const POINTER_SPACE: usize = 0x1_0000;

/// One contiguous burst: start pointer and length
pub type Segment = (u16, usize);

/// Splits a transfer at the 0xFFFF -> 0x0000 wrap
pub fn split_at_wrap(pointer: u16, len: usize) -> (Segment, Option<Segment>) {
    let until_wrap = POINTER_SPACE - usize::from(pointer);
    if len <= until_wrap {
        ((pointer, len), None)
    } else {
        ((pointer, until_wrap), Some((0, len - until_wrap)))
    }
}

impl<B: Bus, C: Clock> W5500<B, C> {
    /// Programs Sn_TXBUF_SIZE / Sn_RXBUF_SIZE for every socket
    pub fn configure_buffers(&mut self, buffers: &BufferConfig) -> Result<()> {
        buffers.validate()?;
        for slot in SocketSlot::all() {
            let index = usize::from(slot.index());
            let block = slot.register_block();
            self.write_u8(socket::TXBUF_SIZE, block, buffers.tx_kb[index])?;
            self.write_u8(socket::RXBUF_SIZE, block, buffers.rx_kb[index])?;
        }
        debug!(
            "Buffers: tx={:?}KB rx={:?}KB",
            buffers.tx_kb, buffers.rx_kb
        );
        Ok(())
    }

    pub fn tx_capacity(&mut self, slot: SocketSlot) -> Result<usize> {
        Ok(usize::from(self.read_u8(socket::TXBUF_SIZE, slot.register_block())?) * 1024)
    }

    pub fn rx_capacity(&mut self, slot: SocketSlot) -> Result<usize> {
        Ok(usize::from(self.read_u8(socket::RXBUF_SIZE, slot.register_block())?) * 1024)
    }

    pub fn tx_free(&mut self, slot: SocketSlot) -> Result<u16> {
        self.read_u16(socket::TX_FSR, slot.register_block())
    }

    pub fn rx_received(&mut self, slot: SocketSlot) -> Result<u16> {
        self.read_u16(socket::RX_RSR, slot.register_block())
    }
}

/// Byte pipe over the socket buffers, with per-slot holdover for bytes read
/// past a caller's limit
#[derive(Debug, Default)]
pub struct RingTransport {
    holdover: [BytesMut; NUM_SOCKETS as usize],
}

impl RingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes read from the chip but not yet handed out
    pub fn held(&self, slot: SocketSlot) -> usize {
        self.holdover[usize::from(slot.index())].len()
    }

    /// Drops holdover for a slot that is being closed or reopened
    pub fn discard(&mut self, slot: SocketSlot) {
        let held = &mut self.holdover[usize::from(slot.index())];
        if !held.is_empty() {
            debug!("{} holdover dropped: {}B", slot, held.len());
            held.clear();
        }
    }

    /// Copies `data` into TX memory and issues SEND
    pub fn write<B: Bus, C: Clock>(
        &mut self,
        device: &mut W5500<B, C>,
        slot: SocketSlot,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let capacity = device.tx_capacity(slot)?;
        if data.len() > capacity {
            return Err(LinkError::invalid(format!(
                "{}B payload exceeds {} TX buffer of {}B",
                data.len(),
                slot,
                capacity
            )));
        }

        wait_tx_free(device, slot, data.len())?;

        let block = slot.register_block();
        let pointer = device.read_u16(socket::TX_WR, block)?;
        let (first, second) = split_at_wrap(pointer, data.len());
        device.write_bytes(first.0, slot.tx_block(), &data[..first.1])?;
        if let Some((addr, _)) = second {
            device.write_bytes(addr, slot.tx_block(), &data[first.1..])?;
        }

        let advanced = pointer.wrapping_add(data.len() as u16);
        device.write_u16(socket::TX_WR, block, advanced)?;
        device.issue_command(slot, SocketCommand::Send)?;
        debug!(
            "{} TX: {}B wr={:04X}->{:04X}",
            slot,
            data.len(),
            pointer,
            advanced
        );
        Ok(())
    }

    /// Returns up to `max_len` received bytes; empty when nothing is pending
    ///
    /// Holdover from a previous call is served first. Otherwise the whole
    /// pending sample is drained from the chip and anything past `max_len` is
    /// kept for the next call.
    pub fn read<B: Bus, C: Clock>(
        &mut self,
        device: &mut W5500<B, C>,
        slot: SocketSlot,
        max_len: usize,
    ) -> Result<Bytes> {
        let index = usize::from(slot.index());
        if !self.holdover[index].is_empty() {
            let take = self.holdover[index].len().min(max_len);
            return Ok(self.holdover[index].split_to(take).freeze());
        }
        if max_len == 0 {
            return Ok(Bytes::new());
        }

        let block = slot.register_block();
        let received = usize::from(device.rx_received(slot)?);
        if received == 0 {
            return Ok(Bytes::new());
        }

        let pointer = device.read_u16(socket::RX_RD, block)?;
        let (first, second) = split_at_wrap(pointer, received);
        let mut sample = BytesMut::with_capacity(received);
        sample.extend_from_slice(&device.read_bytes(first.0, slot.rx_block(), first.1)?);
        if let Some((addr, len)) = second {
            sample.extend_from_slice(&device.read_bytes(addr, slot.rx_block(), len)?);
        }

        let advanced = pointer.wrapping_add(received as u16);
        device.write_u16(socket::RX_RD, block, advanced)?;
        device.issue_command(slot, SocketCommand::Recv)?;
        debug!(
            "{} RX: {}B rd={:04X}->{:04X}",
            slot, received, pointer, advanced
        );

        if received > max_len {
            let head = sample.split_to(max_len);
            self.holdover[index] = sample;
            Ok(head.freeze())
        } else {
            Ok(sample.freeze())
        }
    }
}

fn wait_tx_free<B: Bus, C: Clock>(
    device: &mut W5500<B, C>,
    slot: SocketSlot,
    needed: usize,
) -> Result<()> {
    let clock = device.clock().clone();
    let timeout = device.timing().tx_free_timeout;
    let poll = device.timing().command_poll;
    let mut free = 0;
    let ready = poll_until(&clock, timeout, poll, || {
        free = device.tx_free(slot)?;
        Ok((usize::from(free) >= needed).then_some(()))
    })?;
    if ready.is_none() {
        let snapshot = device.snapshot(slot)?;
        error!("{} TX stalled: need {}B free {}B", slot, needed, free);
        return Err(LinkError::TxStalled {
            needed,
            free,
            snapshot,
        });
    }
    Ok(())
}

/// Established TCP socket seen as a [`Transport`]
///
/// An empty read on a socket that is no longer ESTABLISHED is reported as
/// `ConnectionLost` so a waiting request fails fast instead of timing out.
pub struct SocketStream<'a, B: Bus, C: Clock> {
    device: &'a mut W5500<B, C>,
    ring: &'a mut RingTransport,
    slot: SocketSlot,
}

impl<'a, B: Bus, C: Clock> SocketStream<'a, B, C> {
    pub fn new(device: &'a mut W5500<B, C>, ring: &'a mut RingTransport, slot: SocketSlot) -> Self {
        Self { device, ring, slot }
    }
}

impl<B: Bus, C: Clock> Transport for SocketStream<'_, B, C> {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let status = self.device.status(self.slot)?;
        if status != SocketStatus::Established {
            let snapshot = self.device.snapshot(self.slot)?;
            return Err(LinkError::ConnectionLost { snapshot });
        }
        self.ring.write(self.device, self.slot, frame)
    }

    fn recv(&mut self, max_len: usize) -> Result<Bytes> {
        let data = self.ring.read(self.device, self.slot, max_len)?;
        if data.is_empty() {
            let status = self.device.status(self.slot)?;
            if status != SocketStatus::Established {
                let snapshot = self.device.snapshot(self.slot)?;
                return Err(LinkError::ConnectionLost { snapshot });
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_split_without_wrap() {
        assert_eq!(split_at_wrap(0x0100, 12), ((0x0100, 12), None));
        assert_eq!(split_at_wrap(0xFFF4, 12), ((0xFFF4, 12), None));
    }

    #[test]
    fn test_split_across_wrap() {
        assert_eq!(split_at_wrap(0xFFFA, 12), ((0xFFFA, 6), Some((0x0000, 6))));
        assert_eq!(split_at_wrap(0xFFFF, 2), ((0xFFFF, 1), Some((0x0000, 1))));
    }

    #[test]
    fn test_pointer_advance_wraps() {
        let pointer: u16 = 0xFFFA;
        assert_eq!(pointer.wrapping_add(12), 0x0006);
    }
}
