//! Modbus transaction engine
//!
//! Owns the transaction ID sequence and runs one request/response exchange
//! over any byte [`Transport`]. Responses carrying an older transaction ID
//! are treated as late answers to abandoned requests and skipped.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::frame::{encode_frame, FrameAssembler, ResponseFrame, MAX_FRAME_LEN};
use super::pdu::{Request, Response};
use crate::clock::{poll_until, Clock, Deadline};
use crate::error::{LinkError, Result};

/// Byte pipe to the Modbus server
pub trait Transport {
    /// Sends a complete frame
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Returns up to `max_len` bytes without blocking; empty when none are pending
    fn recv(&mut self, max_len: usize) -> Result<Bytes>;
}

/// Per-session request settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub unit_id: u8,
    pub response_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            response_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Modbus TCP client state for one session
#[derive(Debug)]
pub struct ModbusEngine {
    config: EngineConfig,
    next_transaction_id: u16,
    assembler: FrameAssembler,
}

impl ModbusEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            next_transaction_id: 1,
            assembler: FrameAssembler::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// ID the next request will carry
    pub fn next_transaction_id(&self) -> u16 {
        self.next_transaction_id
    }

    /// Starts a new session: IDs restart at 1 and partial input is dropped
    pub fn reset_session(&mut self) {
        self.next_transaction_id = 1;
        self.assembler.clear();
    }

    fn allocate_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    /// Sends `request` and waits for its response
    ///
    /// Invalid requests fail before an ID is consumed. Once a frame has been
    /// built the ID is spent whatever the outcome.
    pub fn request<T, C>(&mut self, transport: &mut T, clock: &C, request: &Request) -> Result<Response>
    where
        T: Transport,
        C: Clock,
    {
        let pdu = request.encode_pdu()?;
        let transaction_id = self.allocate_transaction_id();
        let frame = encode_frame(transaction_id, self.config.unit_id, &pdu);

        self.assembler.clear();
        debug!(
            "MB TX: {} addr={} trans_id={} {}B",
            request.function_code(),
            request.address(),
            transaction_id,
            frame.len()
        );
        transport.send(&frame)?;

        let response = self.await_response(transport, clock, transaction_id)?;
        if response.header.unit_id != self.config.unit_id {
            return Err(LinkError::protocol(format!(
                "unit id {} in response, expected {}",
                response.header.unit_id, self.config.unit_id
            )));
        }
        debug!(
            "MB RX: FC{:02X} trans_id={} {}B",
            response.function_code(),
            transaction_id,
            response.pdu.len()
        );
        request.decode_response(&response.pdu)
    }

    fn await_response<T, C>(
        &mut self,
        transport: &mut T,
        clock: &C,
        transaction_id: u16,
    ) -> Result<ResponseFrame>
    where
        T: Transport,
        C: Clock,
    {
        let deadline = Deadline::after(clock, self.config.response_timeout);
        let assembler = &mut self.assembler;
        let found = poll_until(
            clock,
            self.config.response_timeout,
            self.config.poll_interval,
            // One read per probe; the deadline is checked between reads
            || {
                if let Some(frame) = take_matching(assembler, transaction_id)? {
                    return Ok(Some(frame));
                }
                let chunk = transport.recv(MAX_FRAME_LEN)?;
                if chunk.is_empty() {
                    return Ok(None);
                }
                assembler.push(&chunk);
                take_matching(assembler, transaction_id)
            },
        )?;

        found.ok_or_else(|| {
            let elapsed_ms = deadline.elapsed(clock).as_millis() as u64;
            warn!(
                "Response timeout: trans_id={} after {}ms",
                transaction_id, elapsed_ms
            );
            LinkError::ResponseTimeout {
                transaction_id,
                elapsed_ms,
                buffered: self.assembler.buffered(),
            }
        })
    }
}

/// Pops assembled frames until one carries `transaction_id`, dropping the rest
fn take_matching(
    assembler: &mut FrameAssembler,
    transaction_id: u16,
) -> Result<Option<ResponseFrame>> {
    while let Some(frame) = assembler.next_frame()? {
        if frame.header.transaction_id == transaction_id {
            return Ok(Some(frame));
        }
        warn!(
            "Stale frame dropped: trans_id={} waiting for {}",
            frame.header.transaction_id, transaction_id
        );
    }
    Ok(None)
}
