/// Binary framing for feed messages
///
/// Fixed header: 16 bytes, little-endian
///   - msg_type: u8
///   - flags: u8 (HAS_SEQUENCE, REFRESH_COMPLETE)
///   - domain: u8
///   - reserved: u8
///   - length: u16 - total message length including header
///   - reserved: u16
///   - stream_id: u32 - feed or snapshot stream the message belongs to
///   - sequence: u32 - only meaningful when HAS_SEQUENCE is set
///
/// The payload after the header is opaque to the sequencing engine.

use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 16;

pub const FLAG_HAS_SEQUENCE: u8 = 0x01;
pub const FLAG_REFRESH_COMPLETE: u8 = 0x02;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Refresh = 1,
    Update = 2,
    Status = 3,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::Refresh),
            2 => Some(MessageType::Update),
            3 => Some(MessageType::Status),
            _ => None,
        }
    }
}

/// Item category. Stream ids are only unique within a domain.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    MarketPrice = 6,
    MarketByOrder = 7,
    MarketByPrice = 8,
}

impl Domain {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            6 => Some(Domain::MarketPrice),
            7 => Some(Domain::MarketByOrder),
            8 => Some(Domain::MarketByPrice),
            _ => None,
        }
    }
}

/// Decoded header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub flags: u8,
    pub domain: Domain,
    pub length: u16,
    pub stream_id: u32,
    pub sequence: u32,
}

impl MessageHeader {
    /// Header for a sequenced message; `length` is filled in on encode
    pub fn sequenced(msg_type: MessageType, domain: Domain, stream_id: u32, sequence: u32) -> Self {
        MessageHeader {
            msg_type,
            flags: FLAG_HAS_SEQUENCE,
            domain,
            length: HEADER_SIZE as u16,
            stream_id,
            sequence,
        }
    }

    /// Header for a message that carries no sequence number
    pub fn unsequenced(msg_type: MessageType, domain: Domain, stream_id: u32) -> Self {
        MessageHeader {
            msg_type,
            flags: 0,
            domain,
            length: HEADER_SIZE as u16,
            stream_id,
            sequence: 0,
        }
    }

    pub fn with_refresh_complete(mut self) -> Self {
        self.flags |= FLAG_REFRESH_COMPLETE;
        self
    }

    pub fn has_sequence(&self) -> bool {
        self.flags & FLAG_HAS_SEQUENCE != 0
    }

    pub fn is_refresh_complete(&self) -> bool {
        self.flags & FLAG_REFRESH_COMPLETE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::Refresh));
        assert_eq!(MessageType::from_u8(3), Some(MessageType::Status));
        assert_eq!(MessageType::from_u8(99), None);
    }

    #[test]
    fn test_domain_conversion() {
        assert_eq!(Domain::from_u8(6), Some(Domain::MarketPrice));
        assert_eq!(Domain::from_u8(8), Some(Domain::MarketByPrice));
        assert_eq!(Domain::from_u8(0), None);
    }

    #[test]
    fn test_header_flags() {
        let hdr = MessageHeader::sequenced(MessageType::Refresh, Domain::MarketPrice, 5, 10);
        assert!(hdr.has_sequence());
        assert!(!hdr.is_refresh_complete());
        assert!(hdr.with_refresh_complete().is_refresh_complete());

        let status = MessageHeader::unsequenced(MessageType::Status, Domain::MarketPrice, 5);
        assert!(!status.has_sequence());
    }
}
