/// Zero-copy message decoder
///
/// The decoder takes a transport buffer and returns a `MessageRef` that points
/// directly into it. Messages that must outlive the buffer (anything placed in
/// a reorder buffer) are deep-copied into an `OwnedMessage`.

use crate::protocol::*;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid domain: {0}")]
    InvalidDomain(u8),

    #[error("truncated message: declared length {declared} exceeds buffer {actual}")]
    TruncatedMessage { declared: u16, actual: usize },

    #[error("message of {0} bytes does not fit the 16-bit length field")]
    MessageTooLarge(usize),

    #[error("payload rejected by application")]
    Rejected,
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Borrowed view of one framed message
#[derive(Debug, Clone, Copy)]
pub struct MessageRef<'a> {
    header: MessageHeader,
    raw: &'a [u8],
}

impl<'a> MessageRef<'a> {
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.header.msg_type
    }

    /// Sequence number, if the message carries one
    pub fn sequence(&self) -> Option<u32> {
        self.header.has_sequence().then_some(self.header.sequence)
    }

    pub fn is_refresh_complete(&self) -> bool {
        self.header.is_refresh_complete()
    }

    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    pub fn domain(&self) -> Domain {
        self.header.domain
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.raw[HEADER_SIZE..]
    }

    /// Full encoded bytes, header included
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }

    /// Deep copy that no longer borrows the transport buffer
    pub fn to_owned_message(&self) -> OwnedMessage {
        OwnedMessage {
            header: self.header,
            raw: self.raw.to_vec(),
        }
    }
}

/// Owned copy of a framed message. Dropping it releases the copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMessage {
    header: MessageHeader,
    raw: Vec<u8>,
}

impl OwnedMessage {
    /// Encode a header and payload into a new message
    pub fn build(header: MessageHeader, payload: &[u8]) -> DecodeResult<Self> {
        let total = HEADER_SIZE + payload.len();
        let length = u16::try_from(total).map_err(|_| DecodeError::MessageTooLarge(total))?;
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[0] = header.msg_type as u8;
        raw[1] = header.flags;
        raw[2] = header.domain as u8;
        LittleEndian::write_u16(&mut raw[4..6], length);
        LittleEndian::write_u32(&mut raw[8..12], header.stream_id);
        LittleEndian::write_u32(&mut raw[12..16], header.sequence);
        raw.extend_from_slice(payload);

        Ok(OwnedMessage {
            header: MessageHeader { length, ..header },
            raw,
        })
    }

    pub fn as_message_ref(&self) -> MessageRef<'_> {
        MessageRef {
            header: self.header,
            raw: &self.raw,
        }
    }

    pub fn sequence(&self) -> Option<u32> {
        self.header.has_sequence().then_some(self.header.sequence)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Zero-copy decoder
pub struct Decoder;

impl Decoder {
    /// Parse a single message from the start of `buffer`
    /// Returns the message and the number of bytes consumed
    pub fn decode(buffer: &[u8]) -> DecodeResult<(MessageRef<'_>, usize)> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::BufferTooSmall {
                need: HEADER_SIZE,
                have: buffer.len(),
            });
        }

        let msg_type = MessageType::from_u8(buffer[0])
            .ok_or(DecodeError::InvalidMessageType(buffer[0]))?;
        let flags = buffer[1];
        let domain = Domain::from_u8(buffer[2]).ok_or(DecodeError::InvalidDomain(buffer[2]))?;
        let length = LittleEndian::read_u16(&buffer[4..6]);
        let stream_id = LittleEndian::read_u32(&buffer[8..12]);
        let sequence = LittleEndian::read_u32(&buffer[12..16]);

        let declared = length as usize;
        if declared < HEADER_SIZE || declared > buffer.len() {
            return Err(DecodeError::TruncatedMessage {
                declared: length,
                actual: buffer.len(),
            });
        }

        let header = MessageHeader {
            msg_type,
            flags,
            domain,
            length,
            stream_id,
            sequence,
        };

        Ok((
            MessageRef {
                header,
                raw: &buffer[..declared],
            },
            declared,
        ))
    }

    /// Decode a packet of back-to-back messages
    /// Calls callback for each message; stops on error or if callback returns false
    pub fn decode_stream<F>(buffer: &[u8], mut callback: F) -> DecodeResult<usize>
    where
        F: FnMut(&MessageRef<'_>) -> bool,
    {
        let mut offset = 0;
        let mut count = 0;

        while offset < buffer.len() {
            let (msg, consumed) = Self::decode(&buffer[offset..])?;
            if !callback(&msg) {
                break;
            }
            offset += consumed;
            count += 1;
        }

        Ok(count)
    }
}
