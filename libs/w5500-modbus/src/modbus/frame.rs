//! MBAP framing
//!
//! Requests are encoded in one piece. Responses arrive in arbitrary chunks and
//! are reassembled by [`FrameAssembler`], which derives the frame length from
//! the function code and cross-checks it against the MBAP length field.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{LinkError, Result};

/// Transaction ID + protocol ID + length + unit ID
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest legal MBAP length field (unit ID + 253-byte PDU)
pub const MAX_MBAP_LENGTH: u16 = 254;

pub const MODBUS_TCP_PORT: u16 = 502;

/// Largest frame on the wire
pub const MAX_FRAME_LEN: usize = MBAP_HEADER_LEN + 253;

/// Modbus TCP application header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit ID plus PDU length
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn for_pdu(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    /// Parses the first seven bytes, `None` if fewer are available
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MBAP_HEADER_LEN {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    /// Total frame length implied by the length field
    pub fn frame_len(&self) -> usize {
        6 + usize::from(self.length)
    }
}

/// Encodes a complete request frame
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    MbapHeader::for_pdu(transaction_id, unit_id, pdu.len()).encode(&mut buf);
    buf.extend_from_slice(pdu);
    buf.freeze()
}

/// Complete response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: MbapHeader,
    /// Function code and payload
    pub pdu: Bytes,
}

impl ResponseFrame {
    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or_default()
    }
}

/// Reassembles response frames from partial reads
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pops the next complete frame, `Ok(None)` while more bytes are needed
    ///
    /// A malformed header drops everything buffered, since the stream
    /// position is no longer trustworthy.
    pub fn next_frame(&mut self) -> Result<Option<ResponseFrame>> {
        match self.frame_len() {
            Ok(Some(len)) if self.buf.len() >= len => {
                let frame = self.buf.split_to(len).freeze();
                let header = MbapHeader::parse(&frame)
                    .ok_or_else(|| LinkError::protocol("truncated MBAP header"))?;
                Ok(Some(ResponseFrame {
                    header,
                    pdu: frame.slice(MBAP_HEADER_LEN..),
                }))
            },
            Ok(_) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            },
        }
    }

    /// Expected length of the frame at the head of the buffer
    fn frame_len(&self) -> Result<Option<usize>> {
        // Header plus function code
        if self.buf.len() < MBAP_HEADER_LEN + 1 {
            return Ok(None);
        }
        let Some(header) = MbapHeader::parse(&self.buf) else {
            return Ok(None);
        };
        if header.protocol_id != 0 {
            return Err(LinkError::protocol(format!(
                "protocol id {} in response",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.length > MAX_MBAP_LENGTH {
            return Err(LinkError::protocol(format!(
                "MBAP length {} out of range",
                header.length
            )));
        }

        let function = self.buf[MBAP_HEADER_LEN];
        let expected = if function & 0x80 != 0 {
            MBAP_HEADER_LEN + 2
        } else {
            match function {
                0x03 | 0x04 => match self.buf.get(MBAP_HEADER_LEN + 1) {
                    Some(&byte_count) => MBAP_HEADER_LEN + 2 + usize::from(byte_count),
                    None => return Ok(None),
                },
                0x06 | 0x10 => MBAP_HEADER_LEN + 5,
                // Unknown function: trust the header so the frame can be skipped
                _ => header.frame_len(),
            }
        };

        if expected != header.frame_len() {
            return Err(LinkError::protocol(format!(
                "FC{:02X} frame is {}B but MBAP length says {}B",
                function,
                expected,
                header.frame_len()
            )));
        }
        Ok(Some(expected))
    }
}
