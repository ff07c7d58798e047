//! In-process W5500 simulator
//!
//! [`SimulatedW5500`] implements [`Bus`] over an emulated register file and
//! buffer memory. Socket commands execute synchronously against a pluggable
//! [`PeerModel`] (TCP) or an ARP reachability flag (UDP). Fault knobs cover
//! the failure modes the driver has to survive: stuck command register,
//! link down, refused or silent peers, ARP timeouts, chunked delivery,
//! unsolicited bytes and bus timeouts.
//!
//! The handle is cheap to clone; all clones share one chip.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::bus::Bus;
use crate::clock::{Clock, ManualClock};
use crate::error::{LinkError, Result};
use crate::modbus::{MBAP_HEADER_LEN, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::registers::{
    common, mode, phy, sn_ir, socket, SocketCommand, SocketMode, SocketSlot, SocketStatus,
    CHIP_VERSION, NUM_SOCKETS,
};

const COMMON_REGS: usize = 0x40;
const SOCKET_REGS: usize = 0x30;
const DEFAULT_BUFFER_KB: u8 = 2;

// ============================================================================
// Peer models
// ============================================================================

/// Remote end of an established TCP connection
pub trait PeerModel: Send {
    /// Handles bytes sent by the chip and returns the reply, possibly empty
    fn on_data(&mut self, data: &[u8]) -> Vec<u8>;
}

/// Sends every payload straight back
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoPeer;

impl PeerModel for EchoPeer {
    fn on_data(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct ModbusPeerState {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    address_limit: u32,
    forced_exception: Option<u8>,
    silent: bool,
    prepend: Vec<u8>,
    responder: Option<Responder>,
    requests: Vec<Vec<u8>>,
}

/// Modbus TCP server answering FC03/04/06/16
///
/// Clones share the same register tables, so a test can keep a handle
/// after installing the peer in the simulator.
#[derive(Clone)]
pub struct ModbusPeer {
    inner: Arc<Mutex<ModbusPeerState>>,
}

impl Default for ModbusPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusPeer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ModbusPeerState {
                holding: HashMap::new(),
                input: HashMap::new(),
                address_limit: 10_000,
                forced_exception: None,
                silent: false,
                prepend: Vec::new(),
                responder: None,
                requests: Vec::new(),
            })),
        }
    }

    pub fn set_holding(&self, address: u16, values: &[u16]) {
        let mut state = self.inner.lock();
        for (offset, value) in values.iter().enumerate() {
            state
                .holding
                .insert(address.wrapping_add(offset as u16), *value);
        }
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.inner
            .lock()
            .holding
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_input(&self, address: u16, values: &[u16]) {
        let mut state = self.inner.lock();
        for (offset, value) in values.iter().enumerate() {
            state
                .input
                .insert(address.wrapping_add(offset as u16), *value);
        }
    }

    /// Requests touching addresses at or above `limit` get exception 0x02
    pub fn set_address_limit(&self, limit: u32) {
        self.inner.lock().address_limit = limit;
    }

    /// Answers every request with this exception code
    pub fn set_exception(&self, code: Option<u8>) {
        self.inner.lock().forced_exception = code;
    }

    /// Swallows requests without answering
    pub fn set_silent(&self, silent: bool) {
        self.inner.lock().silent = silent;
    }

    /// Sends `bytes` ahead of the next response
    pub fn prepend_next(&self, bytes: &[u8]) {
        self.inner.lock().prepend.extend_from_slice(bytes);
    }

    /// Overrides responses; returning `None` falls back to normal handling
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.inner.lock().responder = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        self.inner.lock().responder = None;
    }

    /// Request frames received so far
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.inner.lock().requests.clone()
    }

    pub fn last_transaction_id(&self) -> Option<u16> {
        self.inner
            .lock()
            .requests
            .last()
            .filter(|frame| frame.len() >= 2)
            .map(|frame| u16::from_be_bytes([frame[0], frame[1]]))
    }
}

impl PeerModel for ModbusPeer {
    fn on_data(&mut self, data: &[u8]) -> Vec<u8> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let mut reply = Vec::new();
        let mut rest = data;
        while rest.len() >= MBAP_HEADER_LEN {
            let length = usize::from(u16::from_be_bytes([rest[4], rest[5]]));
            let frame_len = (6 + length).min(rest.len());
            let (frame, tail) = rest.split_at(frame_len);
            rest = tail;
            state.requests.push(frame.to_vec());

            if state.silent {
                continue;
            }
            if let Some(responder) = state.responder.as_mut() {
                if let Some(custom) = responder(frame) {
                    reply.append(&mut state.prepend);
                    reply.extend_from_slice(&custom);
                    continue;
                }
            }
            if frame.len() <= MBAP_HEADER_LEN {
                continue;
            }

            let pdu = state.handle_pdu(&frame[MBAP_HEADER_LEN..]);
            reply.append(&mut state.prepend);
            reply.extend_from_slice(&frame[0..2]);
            reply.extend_from_slice(&[0x00, 0x00]);
            reply.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
            reply.push(frame[6]);
            reply.extend_from_slice(&pdu);
        }
        reply
    }
}

impl ModbusPeerState {
    fn handle_pdu(&mut self, pdu: &[u8]) -> Vec<u8> {
        let function = pdu[0];
        if let Some(code) = self.forced_exception {
            return vec![function | 0x80, code];
        }
        let word = |at: usize| -> Option<u16> {
            Some(u16::from_be_bytes([*pdu.get(at)?, *pdu.get(at + 1)?]))
        };
        let exception = |code: u8| vec![function | 0x80, code];

        match function {
            0x03 | 0x04 => {
                let (Some(address), Some(count)) = (word(1), word(3)) else {
                    return exception(0x03);
                };
                if count == 0 || count > MAX_READ_REGISTERS {
                    return exception(0x03);
                }
                if u32::from(address) + u32::from(count) > self.address_limit {
                    return exception(0x02);
                }
                let table = if function == 0x03 {
                    &self.holding
                } else {
                    &self.input
                };
                let mut out = vec![function, (count * 2) as u8];
                for offset in 0..count {
                    let value = table
                        .get(&address.wrapping_add(offset))
                        .copied()
                        .unwrap_or_default();
                    out.extend_from_slice(&value.to_be_bytes());
                }
                out
            },
            0x06 => {
                let (Some(address), Some(value)) = (word(1), word(3)) else {
                    return exception(0x03);
                };
                if u32::from(address) >= self.address_limit {
                    return exception(0x02);
                }
                self.holding.insert(address, value);
                pdu[..5].to_vec()
            },
            0x10 => {
                let (Some(address), Some(count)) = (word(1), word(3)) else {
                    return exception(0x03);
                };
                let byte_count = pdu.get(5).copied().map(usize::from);
                if count == 0
                    || count > MAX_WRITE_REGISTERS
                    || byte_count != Some(usize::from(count) * 2)
                    || pdu.len() != 6 + usize::from(count) * 2
                {
                    return exception(0x03);
                }
                if u32::from(address) + u32::from(count) > self.address_limit {
                    return exception(0x02);
                }
                for offset in 0..count {
                    if let Some(value) = word(6 + usize::from(offset) * 2) {
                        self.holding.insert(address.wrapping_add(offset), value);
                    }
                }
                pdu[..5].to_vec()
            },
            _ => exception(0x01),
        }
    }
}

/// How the simulated peer answers a TCP CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    /// SYNSENT until the delay passes, then ESTABLISHED
    AcceptAfter(Duration),
    /// RST: straight back to CLOSED
    Refuse,
    /// No answer, stays in SYNSENT
    Silent,
    /// CLOSED with the TIMEOUT interrupt, as after a failed ARP
    ArpTimeout,
}

// ============================================================================
// Chip state
// ============================================================================

struct SimSocket {
    regs: [u8; SOCKET_REGS],
    tx: Vec<u8>,
    rx: Vec<u8>,
    inbound: VecDeque<u8>,
    accept_at: Option<Duration>,
}

impl SimSocket {
    fn new() -> Self {
        let mut regs = [0u8; SOCKET_REGS];
        regs[usize::from(socket::TXBUF_SIZE)] = DEFAULT_BUFFER_KB;
        regs[usize::from(socket::RXBUF_SIZE)] = DEFAULT_BUFFER_KB;
        regs[usize::from(socket::TX_FSR)..usize::from(socket::TX_FSR) + 2]
            .copy_from_slice(&(u16::from(DEFAULT_BUFFER_KB) * 1024).to_be_bytes());
        let size = usize::from(DEFAULT_BUFFER_KB) * 1024;
        Self {
            regs,
            tx: vec![0; size],
            rx: vec![0; size],
            inbound: VecDeque::new(),
            accept_at: None,
        }
    }

    fn reg(&self, addr: u16) -> u8 {
        self.regs[usize::from(addr)]
    }

    fn set_reg(&mut self, addr: u16, value: u8) {
        self.regs[usize::from(addr)] = value;
    }

    fn reg16(&self, addr: u16) -> u16 {
        u16::from_be_bytes([self.reg(addr), self.reg(addr + 1)])
    }

    fn set_reg16(&mut self, addr: u16, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.set_reg(addr, hi);
        self.set_reg(addr + 1, lo);
    }

    fn status(&self) -> SocketStatus {
        SocketStatus::from_code(self.reg(socket::SR))
    }

    fn set_status(&mut self, status: SocketStatus) {
        self.set_reg(socket::SR, status.code());
    }

    fn raise(&mut self, bits: u8) {
        let ir = self.reg(socket::IR);
        self.set_reg(socket::IR, ir | bits);
    }

    fn destination(&self) -> SocketAddrV4 {
        let ip = usize::from(socket::DIPR);
        SocketAddrV4::new(
            Ipv4Addr::new(
                self.regs[ip],
                self.regs[ip + 1],
                self.regs[ip + 2],
                self.regs[ip + 3],
            ),
            self.reg16(socket::DPORT),
        )
    }

    fn refresh_sizes(&mut self) {
        let tx_used = self.reg16(socket::TX_WR).wrapping_sub(self.reg16(socket::TX_RD));
        let free = (self.tx.len() as u16).saturating_sub(tx_used);
        self.set_reg16(socket::TX_FSR, free);
        let rx_used = self.reg16(socket::RX_WR).wrapping_sub(self.reg16(socket::RX_RD));
        self.set_reg16(socket::RX_RSR, rx_used);
    }

    /// Moves peer bytes into RX memory, at most `chunk` per call
    fn deliver(&mut self, chunk: Option<usize>) {
        if self.rx.is_empty() || self.inbound.is_empty() {
            return;
        }
        let used = usize::from(self.reg16(socket::RX_WR).wrapping_sub(self.reg16(socket::RX_RD)));
        let room = self.rx.len().saturating_sub(used);
        let count = self
            .inbound
            .len()
            .min(room)
            .min(chunk.unwrap_or(usize::MAX));
        let write = self.reg16(socket::RX_WR);
        let size = self.rx.len();
        for i in 0..count {
            if let Some(byte) = self.inbound.pop_front() {
                self.rx[(usize::from(write) + i) % size] = byte;
            }
        }
        self.set_reg16(socket::RX_WR, write.wrapping_add(count as u16));
    }
}

struct SimState {
    clock: ManualClock,
    common: [u8; COMMON_REGS],
    sockets: Vec<SimSocket>,
    peer: Box<dyn PeerModel>,
    connect: ConnectBehavior,
    version: u8,
    link: bool,
    arp_reachable: bool,
    stuck_command: bool,
    close_ignored: bool,
    bus_timeout: bool,
    delivery_chunk: Option<usize>,
    pointer_base: u16,
    commands: Vec<(u8, SocketCommand)>,
    tcp_sent: Vec<Vec<u8>>,
    udp_sent: Vec<(SocketAddrV4, Vec<u8>)>,
}

impl SimState {
    fn reset_chip(&mut self) {
        self.common = [0; COMMON_REGS];
        self.sockets = (0..NUM_SOCKETS).map(|_| SimSocket::new()).collect();
    }

    fn read_common(&self, addr: u16, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let at = usize::from(addr) + i;
                match at as u16 {
                    common::VERSIONR => self.version,
                    common::PHYCFGR => {
                        if self.link {
                            phy::LINK | phy::SPEED_100 | phy::FULL_DUPLEX
                        } else {
                            0
                        }
                    },
                    _ => self.common.get(at).copied().unwrap_or_default(),
                }
            })
            .collect()
    }

    fn write_common(&mut self, addr: u16, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let at = usize::from(addr) + i;
            if at as u16 == common::MR && byte & mode::RST != 0 {
                self.reset_chip();
                continue;
            }
            if let Some(slot) = self.common.get_mut(at) {
                *slot = byte;
            }
        }
    }

    fn read_socket(&mut self, index: usize, addr: u16, len: usize) -> Vec<u8> {
        let now = self.clock.now();
        let chunk = self.delivery_chunk;
        let sock = &mut self.sockets[index];
        if let Some(at) = sock.accept_at {
            if now >= at && sock.status() == SocketStatus::SynSent {
                sock.set_status(SocketStatus::Established);
                sock.raise(sn_ir::CON);
                sock.accept_at = None;
            }
        }
        let end = usize::from(addr) + len;
        let rsr = usize::from(socket::RX_RSR);
        if usize::from(addr) <= rsr + 1 && end > rsr && sock.status() == SocketStatus::Established {
            sock.deliver(chunk);
        }
        sock.refresh_sizes();
        (usize::from(addr)..end)
            .map(|at| sock.regs.get(at).copied().unwrap_or_default())
            .collect()
    }

    fn write_socket(&mut self, index: usize, addr: u16, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let at = addr.wrapping_add(i as u16);
            match at {
                socket::CR => self.execute(index, byte),
                socket::IR => {
                    let sock = &mut self.sockets[index];
                    let ir = sock.reg(socket::IR);
                    sock.set_reg(socket::IR, ir & !byte);
                },
                // Read-only
                socket::SR | 0x20..=0x23 | 0x26 | 0x27 | 0x2A | 0x2B => {},
                _ if usize::from(at) < SOCKET_REGS => self.sockets[index].set_reg(at, byte),
                _ => {},
            }
        }
    }

    fn execute(&mut self, index: usize, code: u8) {
        let Some(command) = SocketCommand::from_code(code) else {
            return;
        };
        self.commands.push((index as u8, command));
        trace!("SIM S{} {}", index, command);
        if self.stuck_command {
            self.sockets[index].set_reg(socket::CR, code);
            return;
        }

        let now = self.clock.now();
        let sock = &mut self.sockets[index];
        match command {
            SocketCommand::Open => {
                let tx_size = usize::from(sock.reg(socket::TXBUF_SIZE)) * 1024;
                let rx_size = usize::from(sock.reg(socket::RXBUF_SIZE)) * 1024;
                sock.tx = vec![0; tx_size];
                sock.rx = vec![0; rx_size];
                sock.inbound.clear();
                sock.accept_at = None;
                for pointer in [socket::TX_RD, socket::TX_WR, socket::RX_RD, socket::RX_WR] {
                    sock.set_reg16(pointer, self.pointer_base);
                }
                let status = match SocketMode::from_register(sock.reg(socket::MR)) {
                    SocketMode::Tcp => SocketStatus::Init,
                    SocketMode::Udp => SocketStatus::Udp,
                    _ => SocketStatus::Closed,
                };
                sock.set_status(status);
            },
            SocketCommand::Listen => {
                if sock.status() == SocketStatus::Init {
                    sock.set_status(SocketStatus::Listen);
                }
            },
            SocketCommand::Connect => {
                if sock.status() == SocketStatus::Init {
                    let behavior = if self.link {
                        self.connect
                    } else {
                        ConnectBehavior::ArpTimeout
                    };
                    match behavior {
                        ConnectBehavior::Accept => {
                            sock.set_status(SocketStatus::Established);
                            sock.raise(sn_ir::CON);
                        },
                        ConnectBehavior::AcceptAfter(delay) => {
                            sock.set_status(SocketStatus::SynSent);
                            sock.accept_at = Some(now + delay);
                        },
                        ConnectBehavior::Refuse => sock.set_status(SocketStatus::Closed),
                        ConnectBehavior::Silent => sock.set_status(SocketStatus::SynSent),
                        ConnectBehavior::ArpTimeout => {
                            sock.set_status(SocketStatus::Closed);
                            sock.raise(sn_ir::TIMEOUT);
                        },
                    }
                }
            },
            SocketCommand::Discon => {
                if sock.status() == SocketStatus::Established {
                    sock.set_status(SocketStatus::Closed);
                    sock.raise(sn_ir::DISCON);
                }
            },
            SocketCommand::Close => {
                if !self.close_ignored {
                    sock.set_status(SocketStatus::Closed);
                    sock.accept_at = None;
                    sock.inbound.clear();
                }
            },
            SocketCommand::Send => {
                let read = sock.reg16(socket::TX_RD);
                let write = sock.reg16(socket::TX_WR);
                let size = sock.tx.len();
                if size > 0 {
                    let len = usize::from(write.wrapping_sub(read));
                    let payload: Vec<u8> = (0..len)
                        .map(|i| sock.tx[(usize::from(read) + i) % size])
                        .collect();
                    sock.set_reg16(socket::TX_RD, write);
                    match sock.status() {
                        SocketStatus::Established => {
                            let reply = self.peer.on_data(&payload);
                            sock.inbound.extend(reply);
                            sock.raise(sn_ir::SEND_OK);
                            self.tcp_sent.push(payload);
                        },
                        SocketStatus::Udp => {
                            let reachable = self.link && self.arp_reachable;
                            sock.raise(if reachable {
                                sn_ir::SEND_OK
                            } else {
                                sn_ir::TIMEOUT
                            });
                            self.udp_sent.push((sock.destination(), payload));
                        },
                        _ => {},
                    }
                }
            },
            // Pointers were already advanced by the host
            SocketCommand::Recv => {},
        }
        sock.set_reg(socket::CR, 0);
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Shared handle to a simulated chip
#[derive(Clone)]
pub struct SimulatedW5500 {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedW5500 {
    /// Fresh chip with link up, an accepting Modbus peer and reachable ARP
    pub fn new(clock: ManualClock) -> Self {
        let mut state = SimState {
            clock,
            common: [0; COMMON_REGS],
            sockets: Vec::new(),
            peer: Box::new(ModbusPeer::new()),
            connect: ConnectBehavior::Accept,
            version: CHIP_VERSION,
            link: true,
            arp_reachable: true,
            stuck_command: false,
            close_ignored: false,
            bus_timeout: false,
            delivery_chunk: None,
            pointer_base: 0,
            commands: Vec::new(),
            tcp_sent: Vec::new(),
            udp_sent: Vec::new(),
        };
        state.reset_chip();
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_peer(&self, peer: impl PeerModel + 'static) {
        self.state.lock().peer = Box::new(peer);
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().connect = behavior;
    }

    pub fn set_version(&self, version: u8) {
        self.state.lock().version = version;
    }

    pub fn set_link(&self, up: bool) {
        self.state.lock().link = up;
    }

    pub fn set_arp_reachable(&self, reachable: bool) {
        self.state.lock().arp_reachable = reachable;
    }

    /// Leaves every command pending in Sn_CR
    pub fn set_stuck_command(&self, stuck: bool) {
        self.state.lock().stuck_command = stuck;
    }

    /// CLOSE is accepted but the status never changes
    pub fn set_close_ignored(&self, ignored: bool) {
        self.state.lock().close_ignored = ignored;
    }

    /// Every bus access fails with `BusTimeout`
    pub fn set_bus_timeout(&self, timeout: bool) {
        self.state.lock().bus_timeout = timeout;
    }

    /// Limits how many peer bytes land in RX memory per Sn_RX_RSR read
    pub fn set_delivery_chunk(&self, chunk: Option<usize>) {
        self.state.lock().delivery_chunk = chunk;
    }

    /// Initial value of all four ring pointers after OPEN
    pub fn set_pointer_base(&self, base: u16) {
        self.state.lock().pointer_base = base;
    }

    /// Overwrites Sn_SR, e.g. to simulate the peer dropping the connection
    pub fn force_status(&self, slot: SocketSlot, status: SocketStatus) {
        let mut state = self.state.lock();
        let sock = &mut state.sockets[usize::from(slot.index())];
        sock.set_status(status);
        if status == SocketStatus::Closed {
            sock.raise(sn_ir::DISCON);
        }
    }

    /// Queues unsolicited bytes from the peer
    pub fn inject(&self, slot: SocketSlot, bytes: &[u8]) {
        self.state.lock().sockets[usize::from(slot.index())]
            .inbound
            .extend(bytes.iter().copied());
    }

    pub fn socket_status(&self, slot: SocketSlot) -> SocketStatus {
        self.state.lock().sockets[usize::from(slot.index())].status()
    }

    /// Raw register value without side effects
    pub fn socket_register(&self, slot: SocketSlot, addr: u16) -> u8 {
        self.state.lock().sockets[usize::from(slot.index())].reg(addr)
    }

    pub fn common_register(&self, addr: u16) -> u8 {
        self.state.lock().read_common(addr, 1)[0]
    }

    pub fn command_count(&self, slot: u8, command: SocketCommand) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|&&(s, c)| s == slot && c == command)
            .count()
    }

    /// Payloads delivered to the TCP peer
    pub fn tcp_sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().tcp_sent.clone()
    }

    /// Datagrams sent from UDP sockets with their destination
    pub fn udp_sent(&self) -> Vec<(SocketAddrV4, Vec<u8>)> {
        self.state.lock().udp_sent.clone()
    }
}

/// Splits a block-select byte into (socket index, region) where region is
/// 1 = registers, 2 = TX memory, 3 = RX memory
fn decode_block(block: u8) -> Option<(usize, u8)> {
    let index = usize::from(block / 4);
    let region = block % 4;
    (region != 0 && index < usize::from(NUM_SOCKETS)).then_some((index, region))
}

impl Bus for SimulatedW5500 {
    fn read(&mut self, addr: u16, block: u8, len: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if state.bus_timeout {
            return Err(LinkError::BusTimeout { addr, block });
        }
        if block == 0 {
            return Ok(state.read_common(addr, len));
        }
        let (index, region) = decode_block(block)
            .ok_or_else(|| LinkError::bus(format!("reserved block 0x{:02X}", block)))?;
        match region {
            1 => Ok(state.read_socket(index, addr, len)),
            _ => {
                let sock = &state.sockets[index];
                let memory = if region == 2 { &sock.tx } else { &sock.rx };
                if memory.is_empty() {
                    return Ok(vec![0; len]);
                }
                Ok((0..len)
                    .map(|i| memory[(usize::from(addr) + i) % memory.len()])
                    .collect())
            },
        }
    }

    fn write(&mut self, addr: u16, block: u8, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.bus_timeout {
            return Err(LinkError::BusTimeout { addr, block });
        }
        if block == 0 {
            state.write_common(addr, data);
            return Ok(());
        }
        let (index, region) = decode_block(block)
            .ok_or_else(|| LinkError::bus(format!("reserved block 0x{:02X}", block)))?;
        match region {
            1 => state.write_socket(index, addr, data),
            _ => {
                let sock = &mut state.sockets[index];
                let memory = if region == 2 {
                    &mut sock.tx
                } else {
                    &mut sock.rx
                };
                let size = memory.len();
                if size > 0 {
                    for (i, &byte) in data.iter().enumerate() {
                        memory[(usize::from(addr) + i) % size] = byte;
                    }
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_decode_block() {
        assert_eq!(decode_block(0x01), Some((0, 1)));
        assert_eq!(decode_block(0x02), Some((0, 2)));
        assert_eq!(decode_block(0x07), Some((1, 3)));
        assert_eq!(decode_block(0x04), None);
        assert_eq!(decode_block(0x21), None);
    }

    #[test]
    fn test_reset_clears_common_block() {
        let mut sim = SimulatedW5500::new(ManualClock::new());
        sim.write(common::SIPR, 0, &[10, 0, 0, 1]).unwrap();
        sim.write(common::MR, 0, &[mode::RST]).unwrap();
        assert_eq!(sim.read(common::SIPR, 0, 4).unwrap(), vec![0, 0, 0, 0]);
        assert_eq!(sim.read(common::MR, 0, 1).unwrap(), vec![0]);
        assert_eq!(sim.common_register(common::VERSIONR), CHIP_VERSION);
    }

    #[test]
    fn test_interrupt_write_one_to_clear() {
        let mut sim = SimulatedW5500::new(ManualClock::new());
        let slot = SocketSlot::new(0).unwrap();
        sim.force_status(slot, SocketStatus::Closed);
        assert_eq!(sim.socket_register(slot, socket::IR), sn_ir::DISCON);
        sim.write(socket::IR, 0x01, &[sn_ir::DISCON]).unwrap();
        assert_eq!(sim.socket_register(slot, socket::IR), 0);
    }

    #[test]
    fn test_modbus_peer_read_write() {
        let mut peer = ModbusPeer::new();
        let write = [0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x64, 0x04, 0xD2];
        assert_eq!(peer.on_data(&write), write.to_vec());
        assert_eq!(peer.holding(100), 1234);

        let read = [0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x01];
        assert_eq!(
            peer.on_data(&read),
            vec![0x00, 0x08, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x04, 0xD2]
        );
    }

    #[test]
    fn test_modbus_peer_address_limit() {
        let mut peer = ModbusPeer::new();
        peer.set_address_limit(100);
        let read = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x01];
        assert_eq!(
            peer.on_data(&read),
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]
        );
    }

    #[test]
    fn test_modbus_peer_silent_still_records() {
        let mut peer = ModbusPeer::new();
        peer.set_silent(true);
        let read = [0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert!(peer.on_data(&read).is_empty());
        assert_eq!(peer.last_transaction_id(), Some(3));
    }
}
